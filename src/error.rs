//! Error types
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use core::fmt;

use strum::IntoStaticStr;

use crate::Ts;
use crate::codec::{DecodeError, Malformed, Checksum};
use crate::node::Address;
use crate::qos::QosClass;

/// Core protocol errors, generic over the underlying radio error
#[derive(Debug, Clone, PartialEq)]
pub enum CoreError<E> {
    /// Malformed frame (bad length, tag or version)
    Format(Malformed),

    /// Frame check failed, the sender should retransmit
    ChecksumFailure(Checksum),

    /// Slot boundary action executed after its deadline
    TimingViolation {
        expected: Ts,
        actual: Ts,
    },

    /// Slot request could not be satisfied this superframe
    AdmissionDenied(QosClass),

    /// No usable next hop for the destination
    RouteUnreachable(Address),

    /// No beacon received from the coordinator
    NoBeacon,

    /// Operation timed out
    Timeout,

    /// Outbound queue full
    BufferOverflow,

    /// Receive buffer shorter than the pending payload, which stays queued
    BufferTooSmall(usize),

    /// Modulation index outside the scheme table
    InvalidMcs(u8),

    /// Radio busy
    Busy,

    /// Configuration invariant violated
    Config(ConfigError),

    /// Wrapper for unhandled / underlying radio errors
    Radio(E),
}

impl <E> CoreError<E> {
    /// Operator-facing error code, where one exists
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            CoreError::ChecksumFailure(_) => Some(ErrorCode::CrcFailure),
            CoreError::Timeout => Some(ErrorCode::Timeout),
            CoreError::NoBeacon => Some(ErrorCode::NoBeacon),
            CoreError::BufferOverflow => Some(ErrorCode::BufferOverflow),
            CoreError::InvalidMcs(_) => Some(ErrorCode::InvalidMcs),
            _ => None,
        }
    }
}

impl <E> From<DecodeError> for CoreError<E> {
    fn from(e: DecodeError) -> Self {
        match e {
            DecodeError::Malformed(m) => CoreError::Format(m),
            DecodeError::ChecksumFailure(c) => CoreError::ChecksumFailure(c),
        }
    }
}

impl <E> From<ConfigError> for CoreError<E> {
    fn from(e: ConfigError) -> Self {
        CoreError::Config(e)
    }
}

impl <E: fmt::Debug> fmt::Display for CoreError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreError::Format(m) => write!(f, "malformed frame: {}", m),
            CoreError::ChecksumFailure(c) => write!(f, "{:?} checksum failure", c),
            CoreError::TimingViolation{expected, actual} => {
                write!(f, "timing violation (expected: {} us actual: {} us)", expected, actual)
            },
            CoreError::AdmissionDenied(c) => write!(f, "admission denied for class {}", c),
            CoreError::RouteUnreachable(a) => write!(f, "no route to {}", a),
            CoreError::NoBeacon => write!(f, "no beacon"),
            CoreError::Timeout => write!(f, "timeout"),
            CoreError::BufferOverflow => write!(f, "buffer overflow"),
            CoreError::BufferTooSmall(n) => write!(f, "receive buffer too small ({} bytes required)", n),
            CoreError::InvalidMcs(i) => write!(f, "invalid MCS index {}", i),
            CoreError::Busy => write!(f, "radio busy"),
            CoreError::Config(c) => write!(f, "invalid configuration: {}", c),
            CoreError::Radio(e) => write!(f, "radio error: {:?}", e),
        }
    }
}

/// Error codes surfaced to operators and upper layers
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoStaticStr)]
#[repr(u8)]
pub enum ErrorCode {
    #[strum(serialize = "CRC Failure")]
    CrcFailure = 0x01,
    #[strum(serialize = "Timeout")]
    Timeout = 0x02,
    #[strum(serialize = "No Beacon")]
    NoBeacon = 0x03,
    #[strum(serialize = "Buffer Overflow")]
    BufferOverflow = 0x04,
    #[strum(serialize = "Invalid MCS")]
    InvalidMcs = 0x05,
}

impl ErrorCode {
    pub fn code(&self) -> u8 {
        *self as u8
    }

    /// Recommended recovery action
    pub fn remedy(&self) -> &'static str {
        match self {
            ErrorCode::CrcFailure => "request retransmission",
            ErrorCode::Timeout => "increase timeout / retry",
            ErrorCode::NoBeacon => "rescan channels",
            ErrorCode::BufferOverflow => "reduce data rate",
            ErrorCode::InvalidMcs => "fall back to most robust scheme",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name: &'static str = self.into();
        write!(f, "0x{:02x} {} ({})", self.code(), name, self.remedy())
    }
}

/// Configuration invariant violations, fatal at startup
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// Guarantee fraction outside [0, 1]
    Guarantee(QosClass),
    /// Guarantee fractions must not increase with decreasing priority
    GuaranteeOrder(QosClass),
    /// Exclusive class shares exceed the available capacity
    GuaranteeOverflow,
    /// Best-effort traffic cannot hold a guarantee
    BestEffortGuarantee,
    /// Slot geometry does not fit a beacon, contention and data slot
    SlotGeometry,
    /// Beacon interval must match the superframe duration
    BeaconInterval,
    /// Smoothing factor outside (0, 1]
    Smoothing,
    /// Hysteresis margin must be non-negative
    Hysteresis,
    /// Metric weights must be non-negative, hop penalty within [0, 1)
    MetricWeights,
    /// Hop limit outside 1..=32
    MaxHops,
    /// At least one OGM interval must be tolerated
    OgmWindow,
    /// No channels configured
    Channels,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Guarantee(c) => write!(f, "{} guarantee outside [0, 1]", c),
            ConfigError::GuaranteeOrder(c) => write!(f, "{} guarantee exceeds a higher priority class", c),
            ConfigError::GuaranteeOverflow => write!(f, "class guarantees exceed 100% of capacity"),
            ConfigError::BestEffortGuarantee => write!(f, "best-effort class holds a guarantee"),
            ConfigError::SlotGeometry => write!(f, "superframe too short for slot layout"),
            ConfigError::BeaconInterval => write!(f, "beacon interval differs from superframe"),
            ConfigError::Smoothing => write!(f, "smoothing factor outside (0, 1]"),
            ConfigError::Hysteresis => write!(f, "negative hysteresis margin"),
            ConfigError::MetricWeights => write!(f, "invalid metric weighting"),
            ConfigError::MaxHops => write!(f, "max hops outside 1..=32"),
            ConfigError::OgmWindow => write!(f, "OGM window must be at least one interval"),
            ConfigError::Channels => write!(f, "no channels configured"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn error_codes() {
        let e: CoreError<()> = DecodeError::ChecksumFailure(Checksum::Fcs).into();
        assert_eq!(e.code(), Some(ErrorCode::CrcFailure));
        assert_eq!(e.code().map(|c| c.code()), Some(0x01));

        assert_eq!(CoreError::<()>::NoBeacon.code().map(|c| c.remedy()), Some("rescan channels"));
        assert_eq!(CoreError::<()>::InvalidMcs(9).code(), Some(ErrorCode::InvalidMcs));
        assert_eq!(CoreError::<()>::AdmissionDenied(QosClass::Data).code(), None);

        assert_eq!(ErrorCode::BufferOverflow.to_string(), "0x04 Buffer Overflow (reduce data rate)");
        assert_eq!(ErrorCode::CrcFailure.to_string(), "0x01 CRC Failure (request retransmission)");
        assert_eq!(CoreError::<()>::BufferTooSmall(12).code(), None);
    }
}
