//! MAC framing
//!
//! `FrameControl (2) | DurationId (2) | Receiver (6) | Transmitter (6) |
//! Address3 (6) | SequenceControl (2) | HCS (2) | Payload (0-2304)`

use byteorder::{ByteOrder, LittleEndian};
use bytes::{Bytes, BytesMut, BufMut};

use super::{DecodeError, Malformed, Checksum, crc::crc16};
use crate::node::Address;
use crate::qos::QosClass;

/// Header length excluding the HCS
pub const MAC_HEADER_LEN: usize = 24;
pub const HCS_LEN: usize = 2;
pub const MAX_PAYLOAD_LEN: usize = 2304;

const TYPE_MASK: u16 = 0b11;
const SUBTYPE_SHIFT: u16 = 2;
const SUBTYPE_MASK: u16 = 0b1111;
const FLAGS_MASK: u16 = 0b11_1100_0000;

bitflags::bitflags!{
    /// Frame control flags
    pub struct FrameFlags: u16 {
        /// Frame is destined to the distribution system
        const TO_DS       = 1 << 6;
        /// Frame originates from the distribution system
        const FROM_DS     = 1 << 7;
        /// Frame is a retransmission
        const RETRY       = 1 << 8;
        /// Transmitter enters power save after this frame
        const POWER_MGMT  = 1 << 9;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MgmtKind {
    Beacon = 0,
    JoinRequest = 1,
    JoinResponse = 2,
    Identification = 3,
    Leave = 4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CtrlKind {
    RetransmitRequest = 0,
}

/// Frame type and subtype
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    Management(MgmtKind),
    Control(CtrlKind),
    /// Data frames carry their QoS class as subtype
    Data(QosClass),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameControl {
    pub kind: FrameType,
    pub flags: FrameFlags,
}

impl FrameControl {
    pub fn new(kind: FrameType) -> Self {
        Self{ kind, flags: FrameFlags::empty() }
    }

    pub fn encode(&self) -> u16 {
        let (t, s) = match self.kind {
            FrameType::Management(k) => (0, k as u16),
            FrameType::Control(k) => (1, k as u16),
            FrameType::Data(c) => (2, c as u16),
        };

        t | (s << SUBTYPE_SHIFT) | self.flags.bits()
    }

    pub fn decode(v: u16) -> Result<Self, Malformed> {
        if v & !(TYPE_MASK | (SUBTYPE_MASK << SUBTYPE_SHIFT) | FLAGS_MASK) != 0 {
            return Err(Malformed::Reserved);
        }

        let s = ((v >> SUBTYPE_SHIFT) & SUBTYPE_MASK) as u8;
        let kind = match v & TYPE_MASK {
            0 => FrameType::Management(match s {
                0 => MgmtKind::Beacon,
                1 => MgmtKind::JoinRequest,
                2 => MgmtKind::JoinResponse,
                3 => MgmtKind::Identification,
                4 => MgmtKind::Leave,
                _ => return Err(Malformed::Subtype(s)),
            }),
            1 => FrameType::Control(match s {
                0 => CtrlKind::RetransmitRequest,
                _ => return Err(Malformed::Subtype(s)),
            }),
            2 => FrameType::Data(QosClass::try_from(s).map_err(|_| Malformed::Subtype(s))?),
            _ => return Err(Malformed::FrameType),
        };

        Ok(Self{ kind, flags: FrameFlags::from_bits_truncate(v) })
    }
}

/// Sequence control, 4-bit fragment and 12-bit sequence numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SeqCtrl {
    pub fragment: u8,
    pub number: u16,
}

impl SeqCtrl {
    pub const MAX: u16 = 0x0FFF;

    pub fn new(number: u16) -> Self {
        Self{ fragment: 0, number: number & Self::MAX }
    }

    fn encode(&self) -> u16 {
        (self.fragment as u16 & 0xF) | ((self.number & Self::MAX) << 4)
    }

    fn decode(v: u16) -> Self {
        Self{ fragment: (v & 0xF) as u8, number: v >> 4 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MacHeader {
    pub control: FrameControl,
    pub duration_id: u16,
    /// Immediate receiver
    pub receiver: Address,
    /// Immediate transmitter
    pub transmitter: Address,
    /// Final destination for data, network identifier for management
    pub address3: Address,
    pub seq: SeqCtrl,
}

impl MacHeader {
    /// Encode header and HCS, returning the encoded length
    pub fn encode(&self, buff: &mut [u8]) -> usize {
        LittleEndian::write_u16(&mut buff[0..], self.control.encode());
        LittleEndian::write_u16(&mut buff[2..], self.duration_id);
        self.receiver.encode(&mut buff[4..]);
        self.transmitter.encode(&mut buff[10..]);
        self.address3.encode(&mut buff[16..]);
        LittleEndian::write_u16(&mut buff[22..], self.seq.encode());

        let hcs = crc16(&buff[..MAC_HEADER_LEN]);
        LittleEndian::write_u16(&mut buff[MAC_HEADER_LEN..], hcs);

        MAC_HEADER_LEN + HCS_LEN
    }

    /// Decode and verify a header, returning the header and consumed length
    pub fn decode(buff: &[u8]) -> Result<(Self, usize), DecodeError> {
        if buff.len() < MAC_HEADER_LEN + HCS_LEN {
            return Err(Malformed::Truncated.into());
        }

        let hcs = LittleEndian::read_u16(&buff[MAC_HEADER_LEN..]);
        if crc16(&buff[..MAC_HEADER_LEN]) != hcs {
            return Err(DecodeError::ChecksumFailure(Checksum::Hcs));
        }

        let h = Self {
            control: FrameControl::decode(LittleEndian::read_u16(&buff[0..]))?,
            duration_id: LittleEndian::read_u16(&buff[2..]),
            receiver: Address::decode(&buff[4..]),
            transmitter: Address::decode(&buff[10..]),
            address3: Address::decode(&buff[16..]),
            seq: SeqCtrl::decode(LittleEndian::read_u16(&buff[22..])),
        };

        Ok((h, MAC_HEADER_LEN + HCS_LEN))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MacFrame {
    pub header: MacHeader,
    payload: Bytes,
}

impl MacFrame {
    pub fn new(header: MacHeader, payload: Bytes) -> Result<Self, Malformed> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(Malformed::Length);
        }
        Ok(Self{ header, payload })
    }

    /// Data frame from `transmitter` via `receiver` to the final `destination`
    pub fn data(receiver: Address, transmitter: Address, destination: Address, seq: SeqCtrl, class: QosClass, payload: Bytes) -> Result<Self, Malformed> {
        let header = MacHeader {
            control: FrameControl::new(FrameType::Data(class)),
            duration_id: 0,
            receiver,
            transmitter,
            address3: destination,
            seq,
        };
        Self::new(header, payload)
    }

    /// Management frame, address3 carries the network identifier
    pub fn management(kind: MgmtKind, receiver: Address, transmitter: Address, network_id: u16, seq: SeqCtrl, payload: Bytes) -> Result<Self, Malformed> {
        let header = MacHeader {
            control: FrameControl::new(FrameType::Management(kind)),
            duration_id: 0,
            receiver,
            transmitter,
            address3: Address(network_id as u64),
            seq,
        };
        Self::new(header, payload)
    }

    pub fn control(kind: CtrlKind, receiver: Address, transmitter: Address, seq: SeqCtrl, payload: Bytes) -> Result<Self, Malformed> {
        let header = MacHeader {
            control: FrameControl::new(FrameType::Control(kind)),
            duration_id: 0,
            receiver,
            transmitter,
            address3: receiver,
            seq,
        };
        Self::new(header, payload)
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Network identifier of a management frame
    pub fn network_id(&self) -> u16 {
        self.header.address3.0 as u16
    }

    pub fn len(&self) -> usize {
        MAC_HEADER_LEN + HCS_LEN + self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn encode(&self) -> Bytes {
        let mut b = BytesMut::with_capacity(self.len());
        b.resize(MAC_HEADER_LEN + HCS_LEN, 0);
        self.header.encode(&mut b);
        b.put_slice(&self.payload);
        b.freeze()
    }

    pub fn decode(buff: &[u8]) -> Result<Self, DecodeError> {
        let (header, n) = MacHeader::decode(buff)?;

        let payload = &buff[n..];
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(Malformed::Length.into());
        }

        Ok(Self{ header, payload: Bytes::copy_from_slice(payload) })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn frame_control_bits() {
        let mut fc = FrameControl::new(FrameType::Data(QosClass::Video));
        fc.flags = FrameFlags::RETRY | FrameFlags::TO_DS;

        let v = fc.encode();
        assert_eq!(v & 0b11, 2);
        assert_eq!((v >> 2) & 0xF, 2);
        assert_eq!(v & (1 << 8), 1 << 8);
        assert_eq!(v & (1 << 6), 1 << 6);
        assert_eq!(FrameControl::decode(v), Ok(fc));

        assert_eq!(FrameControl::decode(0b11), Err(Malformed::FrameType));
        assert_eq!(FrameControl::decode(9 << 2), Err(Malformed::Subtype(9)));
        assert_eq!(FrameControl::decode(2 | (4 << 2)), Err(Malformed::Subtype(4)));
        assert_eq!(FrameControl::decode(1 << 12), Err(Malformed::Reserved));
    }

    #[test]
    fn header_layout() {
        let f = MacFrame::management(MgmtKind::Beacon, Address::BROADCAST, Address(0xabcd), 0x0100, SeqCtrl::new(0x123), Bytes::from_static(b"abc")).unwrap();
        let b = f.encode();

        assert_eq!(b.len(), 24 + 2 + 3);
        assert_eq!(&b[4..10], &[0xff; 6]);
        assert_eq!(&b[10..16], &[0xcd, 0xab, 0, 0, 0, 0]);
        assert_eq!(LittleEndian::read_u16(&b[22..]), 0x123 << 4);
        assert_eq!(LittleEndian::read_u16(&b[24..]), crc16(&b[..24]));

        let d = MacFrame::decode(&b).unwrap();
        assert_eq!(d, f);
        assert_eq!(d.network_id(), 0x0100);
    }

    #[test]
    fn payload_bounds() {
        let h = MacFrame::control(CtrlKind::RetransmitRequest, Address(1), Address(2), SeqCtrl::new(1), Bytes::new()).unwrap().header;
        assert_eq!(MacFrame::new(h, Bytes::from(vec![0u8; MAX_PAYLOAD_LEN + 1])), Err(Malformed::Length));
        assert!(MacFrame::new(h, Bytes::from(vec![0u8; MAX_PAYLOAD_LEN])).is_ok());

        let mut b = BytesMut::new();
        b.resize(MAC_HEADER_LEN + HCS_LEN, 0);
        h.encode(&mut b);
        b.put_slice(&[0u8; MAX_PAYLOAD_LEN + 1]);
        assert_eq!(MacFrame::decode(&b), Err(DecodeError::Malformed(Malformed::Length)));

        b[3] ^= 0x01;
        assert_eq!(MacFrame::decode(&b), Err(DecodeError::ChecksumFailure(Checksum::Hcs)));
        assert_eq!(MacFrame::decode(&b[..10]), Err(DecodeError::Malformed(Malformed::Truncated)));
    }
}
