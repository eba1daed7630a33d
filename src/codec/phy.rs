//! Physical layer framing
//!
//! `Preamble | PLCP (4) | PSDU | FCS (4)`
//!
//! The preamble is generated by the modem and is not part of the buffer
//! handed to the radio. The PLCP header is a little-endian u32 holding the
//! MCS (bits 0-2) and PSDU length (bits 3-14), with bits 15-31 reserved.
//! The FCS is a CRC32 over the PLCP header and PSDU.

use byteorder::{ByteOrder, LittleEndian};
use bytes::{Bytes, BytesMut, BufMut};

use super::{DecodeError, Malformed, Checksum, MacFrame, crc::crc32};
use super::mac::{MAC_HEADER_LEN, HCS_LEN, MAX_PAYLOAD_LEN};
use crate::amc::Mcs;

pub const PLCP_LEN: usize = 4;
pub const FCS_LEN: usize = 4;

/// Largest PSDU, a full MAC frame
pub const MAX_PSDU_LEN: usize = MAC_HEADER_LEN + HCS_LEN + MAX_PAYLOAD_LEN;

/// Largest physical frame handed to the radio
pub const MAX_FRAME_LEN: usize = PLCP_LEN + MAX_PSDU_LEN + FCS_LEN;

/// Short training field, 10 repetitions of 16 samples
pub const SHORT_TRAINING: (usize, usize) = (10, 16);
/// Long training field, 2 repetitions of 64 samples
pub const LONG_TRAINING: (usize, usize) = (2, 64);
/// Preamble duration in us
pub const PREAMBLE_US: u32 = 320;
/// PLCP header is always sent BPSK 1/2
pub const PLCP_RATE_KBPS: u32 = 6_000;

const MCS_MASK: u32 = 0b111;
const LEN_SHIFT: u32 = 3;
const LEN_MASK: u32 = 0xFFF;
const RESERVED_SHIFT: u32 = 15;

#[derive(Debug, Clone, PartialEq)]
pub struct PhysicalFrame {
    mcs: Mcs,
    psdu: Bytes,
}

impl PhysicalFrame {
    pub fn new(mcs: Mcs, psdu: Bytes) -> Result<Self, Malformed> {
        if psdu.len() > MAX_PSDU_LEN {
            return Err(Malformed::Length);
        }
        Ok(Self{ mcs, psdu })
    }

    pub fn from_mac(mcs: Mcs, frame: &MacFrame) -> Self {
        Self{ mcs, psdu: frame.encode() }
    }

    pub fn mcs(&self) -> Mcs {
        self.mcs
    }

    pub fn psdu(&self) -> &[u8] {
        &self.psdu
    }

    pub fn len(&self) -> usize {
        PLCP_LEN + self.psdu.len() + FCS_LEN
    }

    pub fn is_empty(&self) -> bool {
        self.psdu.is_empty()
    }

    /// Time on air including the preamble
    pub fn airtime_us(&self) -> u32 {
        airtime_us(self.mcs, self.psdu.len())
    }

    pub fn encode(&self) -> Bytes {
        let mut b = BytesMut::with_capacity(self.len());

        let plcp = (self.mcs.index() as u32 & MCS_MASK)
            | ((self.psdu.len() as u32 & LEN_MASK) << LEN_SHIFT);
        b.put_u32_le(plcp);
        b.put_slice(&self.psdu);

        let fcs = crc32(&b);
        b.put_u32_le(fcs);

        b.freeze()
    }

    pub fn decode(buff: &[u8]) -> Result<Self, DecodeError> {
        if buff.len() < PLCP_LEN + FCS_LEN {
            return Err(Malformed::Truncated.into());
        }

        // Check the FCS before trusting any field
        let (body, fcs) = buff.split_at(buff.len() - FCS_LEN);
        if crc32(body) != LittleEndian::read_u32(fcs) {
            return Err(DecodeError::ChecksumFailure(Checksum::Fcs));
        }

        let plcp = LittleEndian::read_u32(&body[..PLCP_LEN]);
        if plcp >> RESERVED_SHIFT != 0 {
            return Err(Malformed::Reserved.into());
        }

        let len = ((plcp >> LEN_SHIFT) & LEN_MASK) as usize;
        let psdu = &body[PLCP_LEN..];
        if len != psdu.len() || len > MAX_PSDU_LEN {
            return Err(Malformed::Length.into());
        }

        // Three MCS bits always index the eight entry scheme table
        let mcs = Mcs::try_from((plcp & MCS_MASK) as u8)
            .map_err(|_| Malformed::Reserved)?;

        Ok(Self{ mcs, psdu: Bytes::copy_from_slice(psdu) })
    }
}

/// Time on air for a PSDU of `len` bytes at the provided MCS
pub fn airtime_us(mcs: Mcs, len: usize) -> u32 {
    let plcp_us = bits_us(PLCP_LEN, PLCP_RATE_KBPS);
    let body_us = bits_us(len + FCS_LEN, mcs.rate_kbps());

    PREAMBLE_US + plcp_us + body_us
}

fn bits_us(bytes: usize, rate_kbps: u32) -> u32 {
    let bits = bytes as u32 * 8 * 1000;
    (bits + rate_kbps - 1) / rate_kbps
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn plcp_layout() {
        let p = PhysicalFrame::new(Mcs::Qam64_3_4, Bytes::from_static(&[0xaa; 300])).unwrap();
        let b = p.encode();

        assert_eq!(b.len(), 4 + 300 + 4);
        let plcp = LittleEndian::read_u32(&b[..4]);
        assert_eq!(plcp & 0b111, 5);
        assert_eq!((plcp >> 3) & 0xFFF, 300);
        assert_eq!(plcp >> 15, 0);

        assert_eq!(PhysicalFrame::decode(&b), Ok(p));
    }

    #[test]
    fn length_bounds() {
        assert_eq!(PhysicalFrame::new(Mcs::Qpsk1_2, Bytes::from(vec![0u8; MAX_PSDU_LEN + 1])), Err(Malformed::Length));
        assert_eq!(PhysicalFrame::decode(&[0u8; 7]), Err(DecodeError::Malformed(Malformed::Truncated)));

        // Valid FCS over an inconsistent length field
        let mut b = BytesMut::new();
        b.put_u32_le(1 | (10 << 3));
        b.put_slice(&[0u8; 4]);
        let fcs = crc32(&b);
        b.put_u32_le(fcs);
        assert_eq!(PhysicalFrame::decode(&b), Err(DecodeError::Malformed(Malformed::Length)));
    }

    #[test]
    fn airtime() {
        // Full frames fit a default 5 ms slot at the most robust scheme
        assert!(airtime_us(Mcs::Qpsk1_2, MAX_PSDU_LEN) < 5_000);
        assert!(airtime_us(Mcs::Qam256_5_6, 100) < airtime_us(Mcs::Qpsk1_2, 100));
        assert!(airtime_us(Mcs::Qpsk1_2, 0) > PREAMBLE_US);
    }
}
