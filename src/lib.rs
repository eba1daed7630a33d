//! A time-division mesh radio protocol engine.
//!
//! Channel access is arbitrated by a beacon-synchronised TDMA scheduler ([`mac`]),
//! per-link modulation is selected by an adaptive controller ([`amc`]), slot
//! capacity is admitted by traffic class ([`qos`]) and multi-hop routes are
//! maintained by an originator-message distance-vector engine ([`route`]).
//! [`engine::Engine`] composes these into a single cooperative loop.

use core::fmt::Debug;

use radio::{State, Transmit, Receive, Rssi, ReceiveInfo};

pub mod timer;

pub mod error;

pub mod config;

pub mod node;

pub mod codec;

pub mod snapshot;

pub mod amc;

pub mod qos;

pub mod schedule;

pub mod base;

pub mod route;

pub mod station_id;

pub mod mac;

pub mod engine;

#[cfg(any(test, feature="mocks"))]
pub mod sim;

pub mod prelude;


/// Timestamps are 64-bit in microseconds
pub type Ts = u64;

/// Statically sized packet buffer, large enough for any physical frame
pub struct RawPacket{
    data: [u8; codec::phy::MAX_FRAME_LEN],
    len: usize,
    rssi: i16,
}

impl Default for RawPacket {
    fn default() -> Self {
        Self {
            data: [0u8; codec::phy::MAX_FRAME_LEN],
            len: 0,
            rssi: 0,
        }
    }
}

impl RawPacket {
    pub fn data(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn rssi(&self) -> i16 {
        self.rssi
    }
}

/// Radio interface combines `radio` traits
pub trait Radio<S: radio::RadioState, I: radio::ReceiveInfo, E: Debug>: radio::State<State=S, Error=E> + radio::Transmit<Error=E> + radio::Receive<Info=I, Error=E> + radio::Rssi<Error=E> {}

/// Default Radio impl for radio devices
impl <T, S: radio::RadioState, I: ReceiveInfo, E: Debug> Radio<S, I, E> for T where
    T: State<State=S, Error=E> + Transmit<Error=E> + Receive<Info=I, Error=E> + Rssi<Error=E>,
{}
