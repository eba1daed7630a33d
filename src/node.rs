//! Node identity and neighbour tracking

use core::fmt;
use core::str::FromStr;
use std::collections::BTreeMap;

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info};

use crate::Ts;

/// 48-bit network address
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Address(pub u64);

impl Address {
    pub const BROADCAST: Address = Address(0xFFFF_FFFF_FFFF);

    /// Encoded length in bytes
    pub const LEN: usize = 6;

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    pub fn encode(&self, buff: &mut [u8]) {
        LittleEndian::write_u48(&mut buff[..Self::LEN], self.0 & Self::BROADCAST.0);
    }

    pub fn decode(buff: &[u8]) -> Address {
        Address(LittleEndian::read_u48(&buff[..Self::LEN]))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:012x}", self.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({:012x})", self.0)
    }
}

/// Maximum callsign length in bytes
pub const CALLSIGN_LEN: usize = 16;

/// Printable ASCII station callsign
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Callsign(heapless::String<CALLSIGN_LEN>);

impl Callsign {
    pub fn new(s: &str) -> Option<Self> {
        if s.is_empty() || !s.bytes().all(|b| b.is_ascii_graphic()) {
            return None;
        }

        let mut c = heapless::String::new();
        c.push_str(s).ok()?;

        Some(Self(c))
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl Default for Callsign {
    fn default() -> Self {
        let mut c = heapless::String::new();
        let _ = c.push_str("N0CALL");
        Self(c)
    }
}

impl FromStr for Callsign {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Callsign::new(s).ok_or("callsign must be 1-16 printable ASCII characters")
    }
}

impl fmt::Display for Callsign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for Callsign {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Callsign({})", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Coordinator,
    Member,
    Joining,
}

/// Neighbour record
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub address: Address,
    pub callsign: Option<Callsign>,
    pub role: Role,
    /// Clock offset relative to the local superframe epoch in us
    pub clock_offset: i64,
    pub last_seen: Ts,
}

/// Neighbours heard within the silence timeout
#[derive(Debug, Clone, PartialEq)]
pub struct NodeTable {
    nodes: BTreeMap<Address, Node>,
    timeout: Ts,
}

impl NodeTable {
    pub fn new(timeout: Ts) -> Self {
        Self {
            nodes: BTreeMap::new(),
            timeout,
        }
    }

    /// Record a reception from a neighbour, creating the record on first contact
    pub fn heard(&mut self, address: Address, now: Ts) -> &mut Node {
        let n = self.nodes.entry(address).or_insert_with(|| {
            info!("New neighbour {} at {} us", address, now);
            Node {
                address,
                callsign: None,
                role: Role::Joining,
                clock_offset: 0,
                last_seen: now,
            }
        });
        n.last_seen = now;
        n
    }

    pub fn get(&self, address: &Address) -> Option<&Node> {
        self.nodes.get(address)
    }

    pub fn remove(&mut self, address: &Address) -> Option<Node> {
        self.nodes.remove(address)
    }

    /// Remove neighbours silent for longer than the timeout
    pub fn age(&mut self, now: Ts) -> Vec<Address> {
        let timeout = self.timeout;
        let expired: Vec<_> = self.nodes.values()
            .filter(|n| now.saturating_sub(n.last_seen) > timeout)
            .map(|n| n.address)
            .collect();

        for a in &expired {
            debug!("Neighbour {} aged out at {} us", a, now);
            self.nodes.remove(a);
        }

        expired
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item=&Node> {
        self.nodes.values()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn address_encoding() {
        let a = Address(0x0102_0304_0506);
        let mut buff = [0u8; 6];
        a.encode(&mut buff);
        assert_eq!(buff, [0x06, 0x05, 0x04, 0x03, 0x02, 0x01]);
        assert_eq!(Address::decode(&buff), a);

        Address::BROADCAST.encode(&mut buff);
        assert_eq!(buff, [0xff; 6]);
        assert!(Address::decode(&buff).is_broadcast());
    }

    #[test]
    fn callsign_validation() {
        assert_eq!(Callsign::new("VK2XYZ").map(|c| c.to_string()), Some("VK2XYZ".to_string()));
        assert!(Callsign::new("").is_none());
        assert!(Callsign::new("HAS SPACE").is_none());
        assert!(Callsign::new("ABCDEFGHIJKLMNOPQ").is_none());
    }

    #[test]
    fn neighbour_ageing() {
        let mut t = NodeTable::new(1_000);

        t.heard(Address(1), 0);
        t.heard(Address(2), 500).role = Role::Member;
        assert_eq!(t.len(), 2);

        assert_eq!(t.age(1_200), vec![Address(1)]);
        assert_eq!(t.get(&Address(2)).map(|n| n.role), Some(Role::Member));

        t.heard(Address(2), 1_400);
        assert!(t.age(2_000).is_empty());
        assert_eq!(t.age(2_401), vec![Address(2)]);
        assert!(t.is_empty());
    }
}
