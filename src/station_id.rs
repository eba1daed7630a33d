//! Station identification timer
//!
//! Identification is independent of traffic: the callsign is due at start-up
//! and every `interval` thereafter, and its frame bypasses QoS admission.

use log::info;

use crate::Ts;
use crate::codec::mgmt::Identification;
use crate::node::Callsign;

#[derive(Debug, Clone, PartialEq)]
pub struct StationId {
    callsign: Callsign,
    interval: Ts,
    next_due: Ts,
}

impl StationId {
    pub fn new(callsign: Callsign, interval: Ts, now: Ts) -> Self {
        Self{ callsign, interval, next_due: now }
    }

    pub fn callsign(&self) -> &Callsign {
        &self.callsign
    }

    pub fn due(&self, now: Ts) -> bool {
        now >= self.next_due
    }

    pub fn next_due(&self) -> Ts {
        self.next_due
    }

    pub fn frame(&self) -> Identification {
        Identification{ callsign: self.callsign.clone() }
    }

    /// Record an identification sent at `now`
    pub fn sent(&mut self, now: Ts) {
        info!("Station identification {} at {} us", self.callsign, now);
        self.next_due = now + self.interval;
    }
}
