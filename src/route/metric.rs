//! Composite link metric

use crate::amc::QualityReport;
use crate::error::ConfigError;

/// SNR at which the SNR factor saturates, in dB
pub const SNR_FULL_SCALE_DB: f32 = 30.0;
/// Latency at which the latency factor reaches its floor, in ms
pub const LATENCY_FULL_SCALE_MS: f32 = 100.0;
/// Minimum latency factor
pub const LATENCY_FLOOR: f32 = 0.1;

/// Exponents applied to each factor of the composite metric
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricWeights {
    pub snr: f32,
    pub loss: f32,
    pub latency: f32,
}

impl Default for MetricWeights {
    fn default() -> Self {
        Self{ snr: 1.0, loss: 1.0, latency: 1.0 }
    }
}

impl MetricWeights {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match [self.snr, self.loss, self.latency].iter().all(|w| w.is_finite() && *w >= 0.0) {
            true => Ok(()),
            false => Err(ConfigError::MetricWeights),
        }
    }
}

/// Link metric in [0, 1], higher is better
///
/// `(1 - loss)^wl * min(1, snr / 30)^ws * max(0.1, 1 - latency / 100)^wt`
pub fn composite_metric(report: &QualityReport, weights: &MetricWeights) -> f32 {
    let delivery = (1.0 - report.packet_loss).clamp(0.0, 1.0);
    let snr = (report.snr_db / SNR_FULL_SCALE_DB).clamp(0.0, 1.0);
    let latency = (1.0 - report.latency_ms / LATENCY_FULL_SCALE_MS).clamp(LATENCY_FLOOR, 1.0);

    delivery.powf(weights.loss) * snr.powf(weights.snr) * latency.powf(weights.latency)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::node::Address;

    fn report(snr_db: f32, packet_loss: f32, latency_ms: f32) -> QualityReport {
        QualityReport{ link: Address(1), snr_db, packet_loss, latency_ms }
    }

    #[test]
    fn reference_link_ordering() {
        let links = [report(25.0, 0.01, 10.0), report(15.0, 0.05, 30.0), report(5.0, 0.2, 80.0)];
        let w = MetricWeights::default();

        let metrics: Vec<_> = links.iter().map(|l| composite_metric(l, &w)).collect();

        let direct = [
            0.99 * (25.0 / 30.0) * 0.9,
            0.95 * (15.0 / 30.0) * 0.7,
            0.8 * (5.0 / 30.0) * 0.2,
        ];
        for (m, d) in metrics.iter().zip(direct.iter()) {
            assert!((m - d).abs() < 1e-5, "{} != {}", m, d);
        }

        assert!(metrics[0] > metrics[1] && metrics[1] > metrics[2]);
    }

    #[test]
    fn factor_bounds() {
        let w = MetricWeights::default();

        assert_eq!(composite_metric(&report(40.0, 0.0, 0.0), &w), 1.0);
        assert_eq!(composite_metric(&report(-3.0, 0.0, 0.0), &w), 0.0);
        assert!((composite_metric(&report(30.0, 0.0, 500.0), &w) - LATENCY_FLOOR).abs() < 1e-6);

        // Zero weight removes a factor
        let w = MetricWeights{ snr: 0.0, ..Default::default() };
        assert_eq!(composite_metric(&report(3.0, 0.0, 0.0), &w), 1.0);

        assert!(MetricWeights{ loss: -1.0, ..Default::default() }.validate().is_err());
    }
}
