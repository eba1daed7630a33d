//! Management and control payloads

use byteorder::{ByteOrder, LittleEndian};
use bytes::{Bytes, BytesMut, BufMut};

use super::Malformed;
use crate::node::{Address, Callsign, CALLSIGN_LEN};
use crate::qos::QosClass;
use crate::schedule::SlotOwner;

const BEACON_HEADER_LEN: usize = 19;
const SLOT_ENTRY_LEN: usize = 8;

/// Superframe beacon, emitted by the coordinator in the beacon slot
#[derive(Debug, Clone, PartialEq)]
pub struct Beacon {
    pub network_id: u16,
    /// Schedule epoch, incremented on every beacon
    pub epoch: u16,
    /// Coordinator time at the start of the superframe in us
    pub timestamp_us: u64,
    pub slot_us: u32,
    pub guard_us: u16,
    /// Slot allocation map, indexed by slot number
    pub slots: Vec<(SlotOwner, QosClass)>,
}

impl Beacon {
    pub fn encode(&self) -> Bytes {
        let n = self.slots.len().min(u8::MAX as usize);
        let mut b = BytesMut::with_capacity(BEACON_HEADER_LEN + n * SLOT_ENTRY_LEN);

        b.put_u16_le(self.network_id);
        b.put_u16_le(self.epoch);
        b.put_u64_le(self.timestamp_us);
        b.put_u32_le(self.slot_us);
        b.put_u16_le(self.guard_us);
        b.put_u8(n as u8);

        for (owner, class) in self.slots.iter().take(n) {
            let mut e = [0u8; SLOT_ENTRY_LEN];
            let (kind, addr) = match owner {
                SlotOwner::Beacon => (0, Address::default()),
                SlotOwner::Contention => (1, Address::default()),
                SlotOwner::Node(a) => (2, *a),
                SlotOwner::Free => (3, Address::default()),
            };
            e[0] = kind;
            addr.encode(&mut e[1..]);
            e[7] = *class as u8;
            b.put_slice(&e);
        }

        b.freeze()
    }

    pub fn decode(buff: &[u8]) -> Result<Self, Malformed> {
        if buff.len() < BEACON_HEADER_LEN {
            return Err(Malformed::Truncated);
        }

        let n = buff[18] as usize;
        if buff.len() != BEACON_HEADER_LEN + n * SLOT_ENTRY_LEN {
            return Err(Malformed::Length);
        }

        let mut slots = Vec::with_capacity(n);
        for e in buff[BEACON_HEADER_LEN..].chunks_exact(SLOT_ENTRY_LEN) {
            let owner = match e[0] {
                0 => SlotOwner::Beacon,
                1 => SlotOwner::Contention,
                2 => SlotOwner::Node(Address::decode(&e[1..])),
                3 => SlotOwner::Free,
                k => return Err(Malformed::SlotOwner(k)),
            };
            let class = QosClass::try_from(e[7]).map_err(|_| Malformed::Subtype(e[7]))?;
            slots.push((owner, class));
        }

        Ok(Self {
            network_id: LittleEndian::read_u16(&buff[0..]),
            epoch: LittleEndian::read_u16(&buff[2..]),
            timestamp_us: LittleEndian::read_u64(&buff[4..]),
            slot_us: LittleEndian::read_u32(&buff[12..]),
            guard_us: LittleEndian::read_u16(&buff[16..]),
            slots,
        })
    }
}

/// Slot request, sent in the contention slot on join or in an owned slot later
#[derive(Debug, Clone, PartialEq)]
pub struct JoinRequest {
    pub class: QosClass,
    pub duration_us: u32,
    pub callsign: Callsign,
}

impl JoinRequest {
    pub fn encode(&self) -> Bytes {
        let c = self.callsign.as_bytes();
        let mut b = BytesMut::with_capacity(6 + c.len());
        b.put_u8(self.class as u8);
        b.put_u32_le(self.duration_us);
        b.put_u8(c.len() as u8);
        b.put_slice(c);
        b.freeze()
    }

    pub fn decode(buff: &[u8]) -> Result<Self, Malformed> {
        if buff.len() < 6 {
            return Err(Malformed::Truncated);
        }

        let class = QosClass::try_from(buff[0]).map_err(|_| Malformed::Subtype(buff[0]))?;
        let n = buff[5] as usize;
        if n > CALLSIGN_LEN || buff.len() != 6 + n {
            return Err(Malformed::Length);
        }

        Ok(Self {
            class,
            duration_us: LittleEndian::read_u32(&buff[1..]),
            callsign: parse_callsign(&buff[6..])?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinStatus {
    Granted = 0,
    Denied = 1,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JoinResponse {
    pub status: JoinStatus,
    pub class: QosClass,
    /// Number of slots granted per superframe
    pub slots: u8,
}

impl JoinResponse {
    pub fn encode(&self) -> Bytes {
        Bytes::copy_from_slice(&[self.status as u8, self.class as u8, self.slots])
    }

    pub fn decode(buff: &[u8]) -> Result<Self, Malformed> {
        if buff.len() != 3 {
            return Err(Malformed::Length);
        }

        let status = match buff[0] {
            0 => JoinStatus::Granted,
            1 => JoinStatus::Denied,
            s => return Err(Malformed::Subtype(s)),
        };
        let class = QosClass::try_from(buff[1]).map_err(|_| Malformed::Subtype(buff[1]))?;

        Ok(Self{ status, class, slots: buff[2] })
    }
}

/// Station identification, length and callsign each sent three times
/// and recovered by majority vote
#[derive(Debug, Clone, PartialEq)]
pub struct Identification {
    pub callsign: Callsign,
}

impl Identification {
    pub fn encode(&self) -> Bytes {
        let c = self.callsign.as_bytes();
        let mut b = BytesMut::with_capacity(3 + 3 * c.len());
        b.put_slice(&[c.len() as u8; 3]);
        for _ in 0..3 {
            b.put_slice(c);
        }
        b.freeze()
    }

    pub fn decode(buff: &[u8]) -> Result<Self, Malformed> {
        if buff.len() < 3 {
            return Err(Malformed::Truncated);
        }

        let n = vote(buff[0], buff[1], buff[2])? as usize;
        if n > CALLSIGN_LEN || buff.len() != 3 + 3 * n {
            return Err(Malformed::Length);
        }

        let copies = &buff[3..];
        let mut c = [0u8; CALLSIGN_LEN];
        for i in 0..n {
            c[i] = vote(copies[i], copies[n + i], copies[2 * n + i])?;
        }

        Ok(Self{ callsign: parse_callsign(&c[..n])? })
    }
}

/// Request retransmission of a frame that failed its checksum
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetransmitRequest {
    pub seq: u16,
}

impl RetransmitRequest {
    pub fn encode(&self) -> Bytes {
        let mut b = [0u8; 2];
        LittleEndian::write_u16(&mut b, self.seq);
        Bytes::copy_from_slice(&b)
    }

    pub fn decode(buff: &[u8]) -> Result<Self, Malformed> {
        if buff.len() != 2 {
            return Err(Malformed::Length);
        }
        Ok(Self{ seq: LittleEndian::read_u16(buff) })
    }
}

fn vote(a: u8, b: u8, c: u8) -> Result<u8, Malformed> {
    if a == b || a == c {
        Ok(a)
    } else if b == c {
        Ok(b)
    } else {
        Err(Malformed::Redundancy)
    }
}

fn parse_callsign(b: &[u8]) -> Result<Callsign, Malformed> {
    core::str::from_utf8(b).ok()
        .and_then(Callsign::new)
        .ok_or(Malformed::Callsign)
}
