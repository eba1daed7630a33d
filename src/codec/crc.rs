//! Frame check sequences

/// CRC-16/CCITT-FALSE (poly 0x1021, init 0xFFFF), protects MAC headers
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for b in data {
        crc ^= (*b as u16) << 8;
        for _ in 0..8 {
            crc = match crc & 0x8000 != 0 {
                true => (crc << 1) ^ 0x1021,
                false => crc << 1,
            };
        }
    }
    crc
}

/// CRC-32 (IEEE 802.3, reflected), protects whole physical frames
pub fn crc32(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFF_FFFF;
    for b in data {
        crc ^= *b as u32;
        for _ in 0..8 {
            crc = match crc & 1 != 0 {
                true => (crc >> 1) ^ 0xEDB8_8320,
                false => crc >> 1,
            };
        }
    }
    !crc
}
