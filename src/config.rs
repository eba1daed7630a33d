//! Protocol configuration
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use crate::Ts;
use crate::amc::AmcConfig;
use crate::error::ConfigError;
use crate::node::Callsign;
use crate::qos::{QosClass, QosConfig};
use crate::route::RoutingConfig;

/// Index of the beacon slot within each superframe
pub const BEACON_SLOT: u8 = 0;

/// Index of the contention (join) slot within each superframe
pub const CONTENTION_SLOT: u8 = 1;

/// Engine configuration, shared by all components
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Start as the network coordinator
    pub coordinator: bool,

    /// Network identifier advertised in beacons (coordinator only)
    pub network_id: u16,

    /// Station callsign used for identification
    pub callsign: Callsign,

    /// Superframe duration in us
    pub superframe_us: u32,
    /// Slot duration in us
    pub slot_us: u32,
    /// Guard time between slots in us
    pub guard_us: u32,
    /// Beacon interval in us, one beacon per superframe
    pub beacon_interval_us: u32,

    /// Deadline for slot boundary actions (maximum allowed schedule slip) in us
    pub deadline_us: u32,

    /// Compress outgoing data payloads where that shrinks them
    pub compress: bool,

    /// Channels to scan for beacons
    pub channels: Vec<u16>,
    /// Time spent listening on each channel while scanning
    pub scan_dwell_us: u32,

    /// Number of join retries before returning to scanning
    pub join_retries: u8,
    /// Superframes to await a join response
    pub join_timeout: u8,
    /// Traffic class requested on join
    pub join_class: QosClass,
    /// Slot time requested on join in us
    pub join_duration_us: u32,

    /// Number of missed beacons before desync
    pub max_beacon_misses: u32,

    /// Maximum number of retransmissions for unicast frames
    pub max_retries: u8,

    /// RSSI threshold for a channel to be determined to be clear
    pub channel_clear_threshold: i16,

    /// Silence after which neighbours are forgotten
    pub node_timeout_us: Ts,

    /// Station identification interval
    pub id_interval_us: Ts,

    pub qos: QosConfig,
    pub amc: AmcConfig,
    pub routing: RoutingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            coordinator: false,
            network_id: 0x0100,
            callsign: Callsign::default(),

            superframe_us: 100_000,
            slot_us: 5_000,
            guard_us: 100,
            beacon_interval_us: 100_000,
            deadline_us: 1_000,

            compress: true,

            channels: vec![1, 6, 11],
            scan_dwell_us: 300_000,

            join_retries: 3,
            join_timeout: 4,
            join_class: QosClass::Data,
            join_duration_us: 5_000,

            max_beacon_misses: 4,
            max_retries: 3,
            channel_clear_threshold: -85,

            node_timeout_us: 180 * 1_000_000,
            id_interval_us: 600 * 1_000_000,

            qos: QosConfig::default(),
            amc: AmcConfig::default(),
            routing: RoutingConfig::default(),
        }
    }
}

impl Config {
    /// Check configuration invariants, failing initialisation on violation
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.slot_us == 0 || self.slots_per_superframe() < 3 || self.slots_per_superframe() > u8::MAX as u64 {
            return Err(ConfigError::SlotGeometry);
        }
        if self.beacon_interval_us != self.superframe_us {
            return Err(ConfigError::BeaconInterval);
        }
        if self.channels.is_empty() {
            return Err(ConfigError::Channels);
        }

        self.qos.validate()?;
        self.amc.validate()?;
        self.routing.validate()?;

        Ok(())
    }

    pub fn superframe_duration(&self) -> u64 {
        self.superframe_us as u64
    }

    /// Slot period including the trailing guard
    pub fn slot_period(&self) -> u64 {
        self.slot_us as u64 + self.guard_us as u64
    }

    pub fn slots_per_superframe(&self) -> u64 {
        match self.slot_period() {
            0 => 0,
            p => self.superframe_duration() / p,
        }
    }

    /// Number of slots available for data after the beacon and contention slots
    pub fn data_slots(&self) -> u8 {
        self.slots_per_superframe().saturating_sub(2).min(u8::MAX as u64) as u8
    }

    /// Superframe number at `now` for a superframe sequence starting at `epoch`
    pub fn calculate_sfn(&self, now: Ts, epoch: Ts) -> u64 {
        now.saturating_sub(epoch) / self.superframe_duration()
    }

    /// Relative slot number within the current superframe,
    /// `None` in the idle tail following the last slot
    pub fn calculate_rsn(&self, now: Ts, epoch: Ts) -> Option<u8> {
        let offset = now.saturating_sub(epoch) % self.superframe_duration();
        let rsn = offset / self.slot_period();

        match rsn < self.slots_per_superframe() {
            true => Some(rsn as u8),
            false => None,
        }
    }

    /// Absolute slot number since the epoch
    pub fn calculate_asn(&self, now: Ts, epoch: Ts) -> Option<u64> {
        let sfn = self.calculate_sfn(now, epoch);
        self.calculate_rsn(now, epoch).map(|rsn| sfn * self.slots_per_superframe() + rsn as u64)
    }

    /// Start time of a slot
    pub fn slot_start(&self, epoch: Ts, sfn: u64, rsn: u8) -> Ts {
        epoch + sfn * self.superframe_duration() + rsn as u64 * self.slot_period()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn slot_geometry() {
        let c = Config::default();
        assert_eq!(c.slots_per_superframe(), 19);
        assert_eq!(c.data_slots(), 17);

        let epoch = 1_000;
        assert_eq!(c.calculate_sfn(epoch + 250_000, epoch), 2);
        assert_eq!(c.calculate_rsn(epoch + 200_000, epoch), Some(0));
        assert_eq!(c.calculate_rsn(epoch + 205_100, epoch), Some(1));
        assert_eq!(c.calculate_rsn(epoch + 205_099, epoch), Some(0));
        assert_eq!(c.calculate_rsn(epoch + 299_000, epoch), None);
        assert_eq!(c.calculate_asn(epoch + 105_100, epoch), Some(20));
        assert_eq!(c.slot_start(epoch, 1, 1), epoch + 105_100);
    }

    #[test]
    fn validate() {
        assert_eq!(Config::default().validate(), Ok(()));

        let c = Config{ slot_us: 40_000, ..Default::default() };
        assert_eq!(c.validate(), Err(ConfigError::SlotGeometry));

        let c = Config{ beacon_interval_us: 200_000, ..Default::default() };
        assert_eq!(c.validate(), Err(ConfigError::BeaconInterval));

        let c = Config{ channels: vec![], ..Default::default() };
        assert_eq!(c.validate(), Err(ConfigError::Channels));
    }
}
