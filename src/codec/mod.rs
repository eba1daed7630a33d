//! Frame codec
//!
//! Pure, stateless encoding and decoding of the three on-air frame formats:
//! physical frames ([`phy`]) carrying MAC frames ([`mac`]) carrying either
//! management payloads ([`mgmt`]) or network packets ([`net`]).
//!
//! Decoding validates checksums before any other field, bounds every length
//! field against its declared maximum and never allocates from an
//! attacker-controlled length.
//
// https://github.com/rust-iot/rust-lpwan
// Copyright 2021 Ryan Kurte

use core::fmt;

use bytes::Bytes;

pub mod crc;

pub mod phy;
pub use phy::PhysicalFrame;

pub mod mac;
pub use mac::{MacFrame, MacHeader, FrameControl, FrameType, FrameFlags, MgmtKind, CtrlKind, SeqCtrl};

pub mod net;
pub use net::{NetworkPacket, NetHeader, PacketType, Ogm};

pub mod mgmt;
pub use mgmt::{Beacon, JoinRequest, JoinResponse, JoinStatus, Identification, RetransmitRequest};

use crate::amc::Mcs;
use crate::node::Address;

/// Frame decoding errors
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DecodeError {
    /// Malformed length, tag or version, the frame is dropped
    Malformed(Malformed),
    /// Checksum mismatch, the frame should be retransmitted
    ChecksumFailure(Checksum),
}

impl From<Malformed> for DecodeError {
    fn from(m: Malformed) -> Self {
        DecodeError::Malformed(m)
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Malformed(m) => write!(f, "malformed frame: {}", m),
            DecodeError::ChecksumFailure(c) => write!(f, "{:?} checksum failure", c),
        }
    }
}

/// Failing checksum
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Checksum {
    /// CRC32 frame check sequence over the physical frame
    Fcs,
    /// CRC16 header check sequence over the MAC header
    Hcs,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Malformed {
    /// Buffer shorter than the fixed header
    Truncated,
    /// Length field disagrees with the buffer or exceeds its maximum
    Length,
    /// Reserved bits set
    Reserved,
    /// Unknown frame type
    FrameType,
    /// Unknown frame subtype
    Subtype(u8),
    /// Unsupported network protocol version
    Version(u8),
    /// Unknown network packet type
    PacketType(u8),
    /// Unknown slot owner kind
    SlotOwner(u8),
    /// Callsign not printable ASCII or too long
    Callsign,
    /// Redundant copies disagree beyond recovery
    Redundancy,
    /// Frame kind does not carry the requested content
    Content,
    /// Path metric not a number within [0, 1]
    Metric,
    /// Compressed payload does not decompress within the payload bound
    Compression,
}

impl fmt::Display for Malformed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Malformed::Truncated => write!(f, "truncated"),
            Malformed::Length => write!(f, "invalid length"),
            Malformed::Reserved => write!(f, "reserved bits set"),
            Malformed::FrameType => write!(f, "unknown frame type"),
            Malformed::Subtype(s) => write!(f, "unknown subtype {}", s),
            Malformed::Version(v) => write!(f, "unsupported version {}", v),
            Malformed::PacketType(t) => write!(f, "unknown packet type {}", t),
            Malformed::SlotOwner(k) => write!(f, "unknown slot owner {}", k),
            Malformed::Callsign => write!(f, "invalid callsign"),
            Malformed::Redundancy => write!(f, "unrecoverable redundant field"),
            Malformed::Content => write!(f, "unexpected content"),
            Malformed::Metric => write!(f, "metric outside [0, 1]"),
            Malformed::Compression => write!(f, "invalid compressed payload"),
        }
    }
}

/// Kinds of frame understood by the codec
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FrameKind {
    Physical,
    Mac,
    Network,
}

/// Any codec frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Physical(PhysicalFrame),
    Mac(MacFrame),
    Network(NetworkPacket),
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Physical(_) => FrameKind::Physical,
            Frame::Mac(_) => FrameKind::Mac,
            Frame::Network(_) => FrameKind::Network,
        }
    }

    pub fn encode(&self) -> Bytes {
        match self {
            Frame::Physical(p) => p.encode(),
            Frame::Mac(m) => m.encode(),
            Frame::Network(n) => n.encode(),
        }
    }

    pub fn decode(kind: FrameKind, buff: &[u8]) -> Result<Frame, DecodeError> {
        match kind {
            FrameKind::Physical => PhysicalFrame::decode(buff).map(Frame::Physical),
            FrameKind::Mac => MacFrame::decode(buff).map(Frame::Mac),
            FrameKind::Network => NetworkPacket::decode(buff).map(Frame::Network),
        }
    }
}

/// Wrap a MAC frame in a physical frame for transmission at the provided MCS
pub fn wrap(mcs: Mcs, frame: &MacFrame) -> Bytes {
    // MAC frames are bounded below the maximum PSDU length by construction
    PhysicalFrame::from_mac(mcs, frame).encode()
}

/// Decode a received buffer through the physical and MAC layers
pub fn unwrap(buff: &[u8]) -> Result<(Mcs, MacFrame), DecodeError> {
    let p = PhysicalFrame::decode(buff)?;
    let m = MacFrame::decode(p.psdu())?;
    Ok((p.mcs(), m))
}

/// Recover the transmitter and sequence of a physical frame whose FCS failed,
/// returning `None` unless the MAC header itself is intact
pub fn peek_header(buff: &[u8]) -> Option<(Address, Address, SeqCtrl)> {
    let psdu = buff.get(phy::PLCP_LEN..)?;
    let (h, _n) = MacHeader::decode(psdu).ok()?;
    Some((h.receiver, h.transmitter, h.seq))
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;

    use super::*;
    use crate::qos::QosClass;

    #[test]
    fn wrap_unwrap() {
        let net = NetworkPacket::data(Address(0x10), 8, 42, b"hello").unwrap();
        let mac = MacFrame::data(Address(0x20), Address(0x10), Address(0x30), SeqCtrl::new(7), QosClass::Voice, net.encode()).unwrap();

        let buff = wrap(Mcs::Qam16_1_2, &mac);
        let (mcs, decoded) = unwrap(&buff).unwrap();

        assert_eq!(mcs, Mcs::Qam16_1_2);
        assert_eq!(decoded, mac);
        assert_eq!(NetworkPacket::decode(decoded.payload()).unwrap(), net);
    }

    #[test]
    fn frame_kinds() {
        let net = NetworkPacket::data(Address(0x10), 8, 42, b"payload").unwrap();
        let mac = MacFrame::data(Address(0x20), Address(0x10), Address(0x30), SeqCtrl::new(1), QosClass::Data, net.encode()).unwrap();
        let phy = PhysicalFrame::from_mac(Mcs::Qpsk3_4, &mac);

        for f in [Frame::Network(net), Frame::Mac(mac), Frame::Physical(phy)] {
            let b = f.encode();
            assert_eq!(Frame::decode(f.kind(), &b), Ok(f));
        }
    }

    #[test]
    fn peek_intact_header() {
        let mac = MacFrame::data(Address(0x20), Address(0x10), Address(0x30), SeqCtrl::new(99), QosClass::Data, Bytes::from_static(&[1, 2, 3, 4])).unwrap();
        let mut buff = wrap(Mcs::Qpsk1_2, &mac).to_vec();

        // Corrupt the payload, FCS fails but the header remains readable
        let n = buff.len();
        buff[n - 6] ^= 0xff;

        assert_eq!(unwrap(&buff), Err(DecodeError::ChecksumFailure(Checksum::Fcs)));
        assert_eq!(peek_header(&buff), Some((Address(0x20), Address(0x10), SeqCtrl::new(99))));

        // Corrupt the header, nothing to recover
        buff[phy::PLCP_LEN + 9] ^= 0xff;
        assert_eq!(peek_header(&buff), None);
    }

    proptest! {
        #[test]
        fn single_byte_corruption_fails_checksum(
            payload in proptest::collection::vec(any::<u8>(), 0..256),
            index in any::<prop::sample::Index>(),
            flip in 1u8..=255,
        ) {
            let mac = MacFrame::data(Address(0x20), Address(0x10), Address(0x30), SeqCtrl::new(3), QosClass::Video, Bytes::from(payload)).unwrap();
            let mut buff = wrap(Mcs::Qam64_2_3, &mac).to_vec();

            let i = index.index(buff.len());
            buff[i] ^= flip;

            prop_assert_eq!(unwrap(&buff), Err(DecodeError::ChecksumFailure(Checksum::Fcs)));
        }
    }
}
