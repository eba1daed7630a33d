//! Network packets
//!
//! `Version (4b) | Type (4b) | TTL (8b) | Sequence (16b) | Payload`
//!
//! Bit 3 of the type nibble marks a data packet whose user payload is an
//! LZ4 block, the origin address ahead of it is never compressed.

use byteorder::{ByteOrder, LittleEndian};
use bytes::{Bytes, BytesMut, BufMut};

use super::{DecodeError, Malformed};
use super::mac::MAX_PAYLOAD_LEN;
use crate::node::Address;

pub const NET_VERSION: u8 = 1;
pub const NET_HEADER_LEN: usize = 4;
pub const MAX_NET_PAYLOAD_LEN: usize = MAX_PAYLOAD_LEN - NET_HEADER_LEN;

/// Largest user payload in a data packet, after the origin address
pub const MAX_DATA_LEN: usize = MAX_NET_PAYLOAD_LEN - Address::LEN;

/// Encoded OGM payload length
pub const OGM_LEN: usize = Address::LEN + 4 + Address::LEN;

const COMPRESSED_FLAG: u8 = 0x08;
const TYPE_MASK: u8 = 0x07;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Data = 0,
    Ogm = 1,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NetHeader {
    pub kind: PacketType,
    pub ttl: u8,
    pub seq: u16,
    /// User data is LZ4 block compressed
    pub compressed: bool,
}

impl NetHeader {
    pub fn encode(&self, buff: &mut [u8]) -> usize {
        let flags = match self.compressed {
            true => COMPRESSED_FLAG,
            false => 0,
        };
        buff[0] = (NET_VERSION << 4) | flags | (self.kind as u8 & TYPE_MASK);
        buff[1] = self.ttl;
        LittleEndian::write_u16(&mut buff[2..], self.seq);
        NET_HEADER_LEN
    }

    pub fn decode(buff: &[u8]) -> Result<(Self, usize), Malformed> {
        if buff.len() < NET_HEADER_LEN {
            return Err(Malformed::Truncated);
        }

        let version = buff[0] >> 4;
        if version != NET_VERSION {
            return Err(Malformed::Version(version));
        }

        let kind = match buff[0] & TYPE_MASK {
            0 => PacketType::Data,
            1 => PacketType::Ogm,
            t => return Err(Malformed::PacketType(t)),
        };

        let compressed = buff[0] & COMPRESSED_FLAG != 0;
        if compressed && kind != PacketType::Data {
            return Err(Malformed::Reserved);
        }

        let h = Self {
            kind,
            ttl: buff[1],
            seq: LittleEndian::read_u16(&buff[2..]),
            compressed,
        };

        Ok((h, NET_HEADER_LEN))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NetworkPacket {
    pub header: NetHeader,
    payload: Bytes,
}

impl NetworkPacket {
    pub fn new(header: NetHeader, payload: Bytes) -> Result<Self, Malformed> {
        if payload.len() > MAX_NET_PAYLOAD_LEN {
            return Err(Malformed::Length);
        }
        Ok(Self{ header, payload })
    }

    /// Data packet carrying its origin ahead of the user payload
    pub fn data(origin: Address, ttl: u8, seq: u16, data: &[u8]) -> Result<Self, Malformed> {
        if data.len() > MAX_DATA_LEN {
            return Err(Malformed::Length);
        }

        let mut b = BytesMut::with_capacity(Address::LEN + data.len());
        b.resize(Address::LEN, 0);
        origin.encode(&mut b);
        b.put_slice(data);

        Self::new(NetHeader{ kind: PacketType::Data, ttl, seq, compressed: false }, b.freeze())
    }

    /// Data packet with the user payload compressed, falling back to a plain
    /// data packet when compression does not shrink it
    pub fn compressed_data(origin: Address, ttl: u8, seq: u16, data: &[u8]) -> Result<Self, Malformed> {
        if data.len() > MAX_DATA_LEN {
            return Err(Malformed::Length);
        }

        let packed = lz4_flex::block::compress(data);
        if packed.len() >= data.len() {
            return Self::data(origin, ttl, seq, data);
        }

        let mut p = Self::data(origin, ttl, seq, &packed)?;
        p.header.compressed = true;
        Ok(p)
    }

    pub fn ogm(ogm: &Ogm) -> Self {
        let mut b = [0u8; OGM_LEN];
        ogm.originator.encode(&mut b[0..]);
        LittleEndian::write_f32(&mut b[6..], ogm.metric);
        ogm.prev_hop.encode(&mut b[10..]);

        Self {
            header: NetHeader{ kind: PacketType::Ogm, ttl: ogm.ttl, seq: ogm.seq, compressed: false },
            payload: Bytes::copy_from_slice(&b),
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Origin and user payload of a data packet
    pub fn data_parts(&self) -> Result<(Address, &[u8]), Malformed> {
        if self.header.kind != PacketType::Data {
            return Err(Malformed::Content);
        }
        if self.payload.len() < Address::LEN {
            return Err(Malformed::Truncated);
        }

        Ok((Address::decode(&self.payload), &self.payload[Address::LEN..]))
    }

    /// Origin and user payload of a data packet, decompressed where needed
    pub fn user_data(&self) -> Result<(Address, Bytes), Malformed> {
        let (origin, data) = self.data_parts()?;
        if !self.header.compressed {
            return Ok((origin, Bytes::copy_from_slice(data)));
        }

        let mut b = vec![0u8; MAX_DATA_LEN];
        let n = lz4_flex::block::decompress_into(data, &mut b)
            .map_err(|_| Malformed::Compression)?;
        b.truncate(n);

        Ok((origin, Bytes::from(b)))
    }

    pub fn as_ogm(&self) -> Result<Ogm, Malformed> {
        if self.header.kind != PacketType::Ogm {
            return Err(Malformed::Content);
        }
        if self.payload.len() != OGM_LEN {
            return Err(Malformed::Length);
        }

        let b = &self.payload;
        let metric = LittleEndian::read_f32(&b[6..]);
        if !(0.0..=1.0).contains(&metric) {
            return Err(Malformed::Metric);
        }

        Ok(Ogm {
            originator: Address::decode(&b[0..]),
            seq: self.header.seq,
            ttl: self.header.ttl,
            metric,
            prev_hop: Address::decode(&b[10..]),
        })
    }

    /// Copy of this packet with the TTL decremented, `None` once exhausted
    pub fn forwarded(&self) -> Option<Self> {
        match self.header.ttl {
            0 | 1 => None,
            t => Some(Self {
                header: NetHeader{ ttl: t - 1, ..self.header },
                payload: self.payload.clone(),
            }),
        }
    }

    pub fn len(&self) -> usize {
        NET_HEADER_LEN + self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn encode(&self) -> Bytes {
        let mut b = BytesMut::with_capacity(self.len());
        b.resize(NET_HEADER_LEN, 0);
        self.header.encode(&mut b);
        b.put_slice(&self.payload);
        b.freeze()
    }

    pub fn decode(buff: &[u8]) -> Result<Self, DecodeError> {
        let (header, n) = NetHeader::decode(buff)?;

        let payload = &buff[n..];
        if payload.len() > MAX_NET_PAYLOAD_LEN {
            return Err(Malformed::Length.into());
        }

        Ok(Self{ header, payload: Bytes::copy_from_slice(payload) })
    }
}

/// Originator message, a periodic route advertisement
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Ogm {
    pub originator: Address,
    pub seq: u16,
    pub ttl: u8,
    /// Accumulated path metric in [0, 1]
    pub metric: f32,
    /// Neighbour the relaying node learned this advertisement from
    pub prev_hop: Address,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn header_layout() {
        let p = NetworkPacket::data(Address(0x0a), 32, 0x1234, &[9, 8, 7]).unwrap();
        let b = p.encode();

        assert_eq!(b[0], 0x10);
        assert_eq!(b[1], 32);
        assert_eq!(&b[2..4], &[0x34, 0x12]);
        assert_eq!(&b[4..10], &[0x0a, 0, 0, 0, 0, 0]);
        assert_eq!(&b[10..], &[9, 8, 7]);

        let d = NetworkPacket::decode(&b).unwrap();
        assert_eq!(d.data_parts(), Ok((Address(0x0a), &[9u8, 8, 7][..])));
        assert_eq!(d.as_ogm(), Err(Malformed::Content));
    }

    #[test]
    fn ogm_fields() {
        let o = Ogm{ originator: Address(0xaa), seq: 65535, ttl: 31, metric: 0.625, prev_hop: Address(0xbb) };
        let p = NetworkPacket::ogm(&o);

        let d = NetworkPacket::decode(&p.encode()).unwrap();
        assert_eq!(d.header.kind, PacketType::Ogm);
        assert_eq!(d.as_ogm(), Ok(o));
    }

    #[test]
    fn ogm_metric_bounds() {
        for metric in [f32::NAN, f32::INFINITY, -0.1, 1.01] {
            let o = Ogm{ originator: Address(0xaa), seq: 1, ttl: 5, metric, prev_hop: Address(0xbb) };
            let d = NetworkPacket::decode(&NetworkPacket::ogm(&o).encode()).unwrap();
            assert_eq!(d.as_ogm(), Err(Malformed::Metric));
        }
    }

    #[test]
    fn invalid_headers() {
        assert_eq!(NetworkPacket::decode(&[0x10, 1]), Err(DecodeError::Malformed(Malformed::Truncated)));
        assert_eq!(NetworkPacket::decode(&[0x20, 1, 0, 0]), Err(DecodeError::Malformed(Malformed::Version(2))));
        assert_eq!(NetworkPacket::decode(&[0x17, 1, 0, 0]), Err(DecodeError::Malformed(Malformed::PacketType(7))));
        // Only data payloads are compressed
        assert_eq!(NetworkPacket::decode(&[0x19, 1, 0, 0]), Err(DecodeError::Malformed(Malformed::Reserved)));
        assert_eq!(NetworkPacket::data(Address(1), 1, 0, &[0u8; MAX_DATA_LEN + 1]), Err(Malformed::Length));
    }

    #[test]
    fn compressed_payloads() {
        let text = b"position report position report position report position report";
        let p = NetworkPacket::compressed_data(Address(0x0a), 8, 3, text).unwrap();
        assert!(p.header.compressed);
        assert!(p.len() < NET_HEADER_LEN + Address::LEN + text.len());

        let b = p.encode();
        assert_eq!(b[0], 0x18);

        let d = NetworkPacket::decode(&b).unwrap();
        assert_eq!(d.user_data(), Ok((Address(0x0a), Bytes::copy_from_slice(text))));

        // Forwarding keeps the payload packed
        assert!(d.forwarded().unwrap().header.compressed);

        // Incompressible data is sent as is
        let p = NetworkPacket::compressed_data(Address(0x0a), 8, 4, &[1, 2, 3]).unwrap();
        assert!(!p.header.compressed);
        assert_eq!(p.user_data(), Ok((Address(0x0a), Bytes::from_static(&[1, 2, 3]))));
    }

    #[test]
    fn corrupt_compressed_payload() {
        let mut b = NetworkPacket::data(Address(0x0a), 8, 3, &[0xf0, 0xff, 0xff]).unwrap().encode().to_vec();
        b[0] |= 0x08;

        let d = NetworkPacket::decode(&b).unwrap();
        assert_eq!(d.user_data(), Err(Malformed::Compression));
    }

    #[test]
    fn forwarding_ttl() {
        let p = NetworkPacket::data(Address(1), 2, 0, &[1]).unwrap();
        let f = p.forwarded().unwrap();
        assert_eq!(f.header.ttl, 1);
        assert!(f.forwarded().is_none());
    }
}
