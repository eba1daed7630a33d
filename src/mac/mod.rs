//! Medium Access Control (MAC) layer module.
//!
//! Contains the MAC trait, shared MAC types and the beacon-synchronised
//! TDMA implementation.

use crate::node::Address;
use crate::qos::QosClass;

pub mod tdma;
pub use tdma::Tdma;

mod rx;

/// Generic MAC trait, implemented by all MACs
pub trait Mac {
    type Error;

    /// Queue a payload for transmission to `dest` in the provided traffic class
    fn transmit(&mut self, dest: Address, class: QosClass, data: &[u8]) -> Result<(), Self::Error>;

    /// Fetch a received payload, if any
    ///
    /// Fails with `BufferTooSmall` when `buff` cannot hold the next payload,
    /// leaving it queued
    fn receive(&mut self, buff: &mut [u8]) -> Result<Option<(usize, RxInfo)>, Self::Error>;

    /// Check whether the MAC has pending work
    fn busy(&mut self) -> Result<bool, Self::Error>;

    /// Update the MAC state
    fn tick(&mut self) -> Result<(), Self::Error>;
}

/// Information about a received payload
#[derive(Debug, Clone, PartialEq)]
pub struct RxInfo {
    /// Originating node
    pub source: Address,
    /// Neighbour the payload was received from
    pub via: Address,
    pub rssi: i16,
    pub class: QosClass,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SyncRole {
    Coordinator,
    Member,
}

/// TDMA MAC states
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MacState {
    /// Listening for a beacon, hopping channels
    Scanning,
    /// Synchronised to a beacon, awaiting admission
    Joining,
    Synchronized(SyncRole),
    /// Beacons lost, rescanning on the next tick
    Degraded,
}

impl MacState {
    pub fn is_synced(&self) -> bool {
        matches!(self, MacState::Synchronized(_))
    }

    pub fn is_coordinator(&self) -> bool {
        *self == MacState::Synchronized(SyncRole::Coordinator)
    }
}

/// Notifications for the upper layers
#[derive(Debug, Clone, PartialEq)]
pub enum MacEvent {
    /// Admitted to a network
    Joined{ coordinator: Address, slots: u8 },
    /// Join request denied by the coordinator
    JoinDenied(QosClass),
    /// Join retries exhausted, scanning again
    JoinFailed,
    /// Additional slot request granted
    SlotGranted{ class: QosClass, slots: u8 },
    /// Additional slot request denied
    SlotDenied(QosClass),
    /// Beacons lost
    NoBeacon,
    /// Frame not delivered after the maximum number of retransmissions
    TxFailed{ dest: Address, seq: u16 },
    /// No route to the destination
    Unreachable(Address),
    /// Coordinator admitted a node
    NodeJoined(Address),
    /// Neighbour silent for longer than the node timeout
    NodeLost(Address),
}

/// MAC statistics
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MacStats {
    pub tx_frames: u32,
    pub rx_frames: u32,
    pub retransmissions: u32,
    pub tx_fail: u32,
    pub crc_fail: u32,
    pub malformed: u32,
    pub deadline_miss: u32,
    pub cca_fail: u32,
    pub sync_fail: u32,
    pub rx_overflow: u32,
}

impl MacStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fraction of transmitted frames not reported as failed
    pub fn success_rate(&self) -> f32 {
        match self.tx_frames {
            0 => 1.0,
            n => 1.0 - (self.tx_fail as f32 / n as f32).min(1.0),
        }
    }

    /// Fraction of received frames failing their checksum
    pub fn crc_failure_rate(&self) -> f32 {
        match self.rx_frames.saturating_add(self.crc_fail) {
            0 => 0.0,
            n => self.crc_fail as f32 / n as f32,
        }
    }
}
