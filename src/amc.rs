//! Adaptive modulation controller
//!
//! Selects a modulation and coding scheme per link from smoothed SNR
//! measurements. Up-shifts require exceeding the next scheme's threshold by
//! the hysteresis margin, down-shifts require falling below the current
//! scheme's threshold by the margin, suppressing oscillation on noisy links.
//!
//! The controller is the sole writer of the link table, which is published as
//! an immutable snapshot for the scheduler and routing engine.
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use std::collections::BTreeMap;

use log::{debug, trace, warn};
use strum::{EnumIter, IntoStaticStr, IntoEnumIterator};

use crate::Ts;
use crate::error::ConfigError;
use crate::node::Address;
use crate::route::metric::{MetricWeights, composite_metric};
use crate::snapshot::{Publisher, Reader};

/// Modulation and coding schemes, ascending by required SNR
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, EnumIter, IntoStaticStr)]
#[repr(u8)]
pub enum Mcs {
    #[strum(serialize = "QPSK-1/2")]
    Qpsk1_2 = 0,
    #[strum(serialize = "QPSK-3/4")]
    Qpsk3_4 = 1,
    #[strum(serialize = "16QAM-1/2")]
    Qam16_1_2 = 2,
    #[strum(serialize = "16QAM-3/4")]
    Qam16_3_4 = 3,
    #[strum(serialize = "64QAM-2/3")]
    Qam64_2_3 = 4,
    #[strum(serialize = "64QAM-3/4")]
    Qam64_3_4 = 5,
    #[strum(serialize = "256QAM-3/4")]
    Qam256_3_4 = 6,
    #[strum(serialize = "256QAM-5/6")]
    Qam256_5_6 = 7,
}

impl Mcs {
    /// Most robust scheme, used for unknown links and broadcasts
    pub const ROBUST: Mcs = Mcs::Qpsk1_2;

    pub fn index(&self) -> u8 {
        *self as u8
    }

    pub fn name(&self) -> &'static str {
        (*self).into()
    }

    /// Minimum SNR in dB to sustain this scheme
    pub fn min_snr_db(&self) -> f32 {
        match self {
            Mcs::Qpsk1_2 => 5.0,
            Mcs::Qpsk3_4 => 8.0,
            Mcs::Qam16_1_2 => 12.0,
            Mcs::Qam16_3_4 => 15.0,
            Mcs::Qam64_2_3 => 19.0,
            Mcs::Qam64_3_4 => 21.0,
            Mcs::Qam256_3_4 => 25.0,
            Mcs::Qam256_5_6 => 28.0,
        }
    }

    /// PSDU data rate in kbit/s
    pub fn rate_kbps(&self) -> u32 {
        match self {
            Mcs::Qpsk1_2 => 12_000,
            Mcs::Qpsk3_4 => 18_000,
            Mcs::Qam16_1_2 => 24_000,
            Mcs::Qam16_3_4 => 36_000,
            Mcs::Qam64_2_3 => 48_000,
            Mcs::Qam64_3_4 => 54_000,
            Mcs::Qam256_3_4 => 72_000,
            Mcs::Qam256_5_6 => 80_000,
        }
    }
}

impl Default for Mcs {
    fn default() -> Self {
        Self::ROBUST
    }
}

/// Index outside the scheme table
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InvalidMcs(pub u8);

impl TryFrom<u8> for Mcs {
    type Error = InvalidMcs;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        Mcs::iter().nth(v as usize).ok_or(InvalidMcs(v))
    }
}

impl <E> From<InvalidMcs> for crate::error::CoreError<E> {
    fn from(e: InvalidMcs) -> Self {
        crate::error::CoreError::InvalidMcs(e.0)
    }
}

/// Link quality measurement supplied by the estimator
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityReport {
    /// Neighbour at the far end of the link
    pub link: Address,
    pub snr_db: f32,
    /// Packet loss rate in [0, 1]
    pub packet_loss: f32,
    /// Round trip latency in ms
    pub latency_ms: f32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AmcConfig {
    /// EMA weight of the newest sample, in (0, 1]
    pub alpha: f32,
    /// Hysteresis margin in dB
    pub margin_db: f32,
}

impl Default for AmcConfig {
    fn default() -> Self {
        Self {
            alpha: 0.6,
            margin_db: 2.0,
        }
    }
}

impl AmcConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.alpha.is_nan() || self.alpha <= 0.0 || self.alpha > 1.0 {
            return Err(ConfigError::Smoothing);
        }
        if self.margin_db.is_nan() || self.margin_db < 0.0 {
            return Err(ConfigError::Hysteresis);
        }
        Ok(())
    }
}

/// Per-neighbour link state
#[derive(Debug, Clone, PartialEq)]
pub struct LinkState {
    pub report: QualityReport,
    pub mcs: Mcs,
    pub smoothed_snr: f32,
    /// EMA-smoothed composite metric
    pub smoothed_metric: f32,
    /// Time of the last quality report
    pub updated: Ts,
}

impl LinkState {
    /// Whether a report has been received within `timeout` of `now`
    pub fn is_live(&self, now: Ts, timeout: Ts) -> bool {
        now.saturating_sub(self.updated) <= timeout
    }
}

pub type LinkTable = BTreeMap<Address, LinkState>;

pub struct Amc {
    config: AmcConfig,
    weights: MetricWeights,
    links: LinkTable,
    publisher: Publisher<LinkTable>,
}

impl Amc {
    pub fn new(config: AmcConfig, weights: MetricWeights) -> Self {
        Self {
            config,
            weights,
            links: LinkTable::new(),
            publisher: Publisher::new(LinkTable::new()),
        }
    }

    /// Reader for the published link table
    pub fn reader(&self) -> Reader<LinkTable> {
        self.publisher.reader()
    }

    /// Record a quality report and re-evaluate the link's scheme,
    /// changing it at most once per call
    pub fn update(&mut self, report: QualityReport, now: Ts) -> Mcs {
        if !report.snr_db.is_finite() || !report.packet_loss.is_finite() || !report.latency_ms.is_finite() {
            warn!("Ignoring non-finite quality report for {}", report.link);
            return self.current_index(&report.link);
        }

        let metric = composite_metric(&report, &self.weights);
        let alpha = self.config.alpha;

        let (mcs, previous) = match self.links.get_mut(&report.link) {
            Some(l) => {
                l.smoothed_snr = alpha * report.snr_db + (1.0 - alpha) * l.smoothed_snr;
                l.smoothed_metric = alpha * metric + (1.0 - alpha) * l.smoothed_metric;
                l.report = report;
                l.updated = now;

                let previous = l.mcs;
                l.mcs = select(l.mcs, l.smoothed_snr, self.config.margin_db);
                (l.mcs, Some(previous))
            },
            None => {
                let mcs = select(Mcs::ROBUST, report.snr_db, self.config.margin_db);
                self.links.insert(report.link, LinkState {
                    report,
                    mcs,
                    smoothed_snr: report.snr_db,
                    smoothed_metric: metric,
                    updated: now,
                });
                (mcs, None)
            }
        };

        match previous {
            Some(p) if p != mcs => debug!("Link {} MCS {} -> {}", report.link, p.name(), mcs.name()),
            None => debug!("New link {} at MCS {}", report.link, mcs.name()),
            _ => trace!("Link {} holds MCS {}", report.link, mcs.name()),
        }

        self.publisher.publish(self.links.clone());

        mcs
    }

    /// Active scheme for a link, the most robust scheme if unmeasured
    pub fn current_index(&self, link: &Address) -> Mcs {
        self.links.get(link).map(|l| l.mcs).unwrap_or(Mcs::ROBUST)
    }

    pub fn link(&self, link: &Address) -> Option<&LinkState> {
        self.links.get(link)
    }

    /// Forget a link, ie. when the neighbour has aged out
    pub fn remove(&mut self, link: &Address) {
        if self.links.remove(link).is_some() {
            debug!("Removed link {}", link);
            self.publisher.publish(self.links.clone());
        }
    }
}

/// Hysteresis scheme selection, at most one change per evaluation
fn select(current: Mcs, snr: f32, margin: f32) -> Mcs {
    // Up-shift to the best scheme cleared by the margin
    if let Some(up) = Mcs::iter().rev()
        .take_while(|m| *m > current)
        .find(|m| snr > m.min_snr_db() + margin)
    {
        return up;
    }

    // Down-shift only once below the current threshold by the margin
    if snr < current.min_snr_db() - margin {
        return Mcs::iter().rev()
            .skip_while(|m| *m >= current)
            .find(|m| snr >= m.min_snr_db() - margin)
            .unwrap_or(Mcs::ROBUST);
    }

    current
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;

    fn report(link: u64, snr_db: f32) -> QualityReport {
        QualityReport{ link: Address(link), snr_db, packet_loss: 0.0, latency_ms: 10.0 }
    }

    #[test]
    fn scheme_table() {
        let thresholds: Vec<_> = Mcs::iter().map(|m| m.min_snr_db()).collect();
        assert!(thresholds.windows(2).all(|w| w[0] < w[1]));

        assert_eq!(Mcs::try_from(7), Ok(Mcs::Qam256_5_6));
        assert_eq!(Mcs::try_from(8), Err(InvalidMcs(8)));
        assert_eq!(Mcs::Qam16_1_2.name(), "16QAM-1/2");
    }

    #[test]
    fn unknown_link_is_robust() {
        let amc = Amc::new(AmcConfig::default(), MetricWeights::default());
        assert_eq!(amc.current_index(&Address(5)), Mcs::ROBUST);
    }

    #[test]
    fn selects_by_threshold() {
        let mut amc = Amc::new(AmcConfig::default(), MetricWeights::default());

        assert_eq!(amc.update(report(1, 3.0), 0), Mcs::Qpsk1_2);
        assert_eq!(amc.update(report(2, 15.0), 0), Mcs::Qam16_1_2);
        assert_eq!(amc.update(report(3, 30.0), 0), Mcs::Qam256_5_6);

        assert_eq!(amc.current_index(&Address(2)), Mcs::Qam16_1_2);
    }

    #[test]
    fn hysteresis() {
        let cfg = AmcConfig{ alpha: 1.0, margin_db: 2.0 };
        let mut amc = Amc::new(cfg, MetricWeights::default());

        // 16QAM-1/2 requires 12 dB, plus margin to enter
        assert_eq!(amc.update(report(1, 14.5), 0), Mcs::Qam16_1_2);

        // Jitter around the 16QAM-3/4 threshold does not shift
        for snr in [15.5, 14.8, 16.9, 15.1, 12.5, 10.1] {
            assert_eq!(amc.update(report(1, snr), 0), Mcs::Qam16_1_2);
        }

        // Clear the next threshold by the margin
        assert_eq!(amc.update(report(1, 17.5), 0), Mcs::Qam16_3_4);

        // Fall below current threshold less the margin
        assert_eq!(amc.update(report(1, 13.1), 0), Mcs::Qam16_3_4);
        assert_eq!(amc.update(report(1, 9.9), 0), Mcs::Qpsk3_4);
    }

    #[test]
    fn smoothing() {
        let cfg = AmcConfig{ alpha: 0.5, margin_db: 0.0 };
        let mut amc = Amc::new(cfg, MetricWeights::default());

        amc.update(report(1, 10.0), 0);
        amc.update(report(1, 20.0), 1);
        let l = amc.link(&Address(1)).unwrap();
        assert_eq!(l.smoothed_snr, 15.0);
        assert_eq!(l.updated, 1);

        // Non-finite reports are ignored
        amc.update(report(1, f32::NAN), 2);
        assert_eq!(amc.link(&Address(1)).unwrap().updated, 1);
    }

    #[test]
    fn publishes_snapshot() {
        let mut amc = Amc::new(AmcConfig::default(), MetricWeights::default());
        let mut r = amc.reader();
        assert!(r.load().is_empty());

        amc.update(report(1, 20.0), 0);
        assert_eq!(r.load().get(&Address(1)).map(|l| l.mcs), Some(amc.current_index(&Address(1))));

        amc.remove(&Address(1));
        assert!(r.load().is_empty());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn monotonic_snr_never_reverses(
            start in -5.0f32..35.0,
            steps in prop::collection::vec(0.0f32..3.0, 1..64),
            rising in any::<bool>(),
            alpha in 0.1f32..1.0,
            margin in 0.0f32..4.0,
        ) {
            let mut amc = Amc::new(AmcConfig{ alpha, margin_db: margin }, MetricWeights::default());

            let mut snr = start;
            let mut last = amc.update(report(1, snr), 0);

            for s in steps {
                snr = match rising { true => snr + s, false => snr - s };
                let next = amc.update(report(1, snr), 0);

                // Index only ever moves in the direction of the SNR trend
                match rising {
                    true => prop_assert!(next >= last),
                    false => prop_assert!(next <= last),
                }
                last = next;
            }
        }
    }
}
