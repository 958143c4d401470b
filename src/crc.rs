//! Sector check algorithms.
//!
//! The set of algorithms a floppy controller can use is fixed, so it is a
//! closed enum rather than a registry.  Each variant carries its parameters
//! and any lookup table is built at compile time.
//!
//! | Kind | Width | Polynomial | Init | Used by |
//! |------|-------|------------|------|---------|
//! | `Ccitt16` | 16 | 0x1021 | 0xFFFF | IBM MFM / FM |
//! | `Xor8`    | 8  | -      | 0x00   | Commodore GCR |

use serde::{Deserialize, Serialize};

const CCITT_POLY: u16 = 0x1021;

static CCITT_TABLE: [u16; 256] = build_ccitt_table();

const fn build_ccitt_table() -> [u16; 256] {
    let mut table = [0u16; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = (i as u16) << 8;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 0x8000 != 0 { (crc << 1) ^ CCITT_POLY } else { crc << 1 };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CrcKind {
    /// CRC-16/CCITT, MSB first, no final XOR.
    Ccitt16,
    /// Running XOR of every byte.
    Xor8,
}

impl CrcKind {
    pub fn width(self) -> u32 {
        match self {
            CrcKind::Ccitt16 => 16,
            CrcKind::Xor8    => 8,
        }
    }

    pub fn init(self) -> u16 {
        match self {
            CrcKind::Ccitt16 => 0xFFFF,
            CrcKind::Xor8    => 0x0000,
        }
    }

    /// Number of check bytes stored on disk after the field.
    pub fn stored_len(self) -> usize {
        (self.width() / 8) as usize
    }

    /// Continue a running check value over `data`.
    pub fn update(self, state: u16, data: &[u8]) -> u16 {
        match self {
            CrcKind::Ccitt16 => data.iter().fold(state, |crc, &b| {
                (crc << 8) ^ CCITT_TABLE[((crc >> 8) as u8 ^ b) as usize]
            }),
            CrcKind::Xor8 => data.iter().fold(state & 0xFF, |acc, &b| acc ^ b as u16),
        }
    }

    pub fn checksum(self, data: &[u8]) -> u16 {
        self.update(self.init(), data)
    }

    /// Decode the stored check value that follows a field on disk.
    pub fn read_stored(self, bytes: &[u8]) -> Option<u16> {
        match self {
            CrcKind::Ccitt16 => match bytes {
                [hi, lo, ..] => Some(u16::from_be_bytes([*hi, *lo])),
                _ => None,
            },
            CrcKind::Xor8 => bytes.first().map(|&b| b as u16),
        }
    }

    /// Encode a check value the way it is written on disk.
    pub fn to_stored(self, value: u16) -> Vec<u8> {
        match self {
            CrcKind::Ccitt16 => value.to_be_bytes().to_vec(),
            CrcKind::Xor8    => vec![value as u8],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ccitt_check_value() {
        assert_eq!(CrcKind::Ccitt16.checksum(b"123456789"), 0x29B1);
    }

    #[test]
    fn ccitt_sync_preset() {
        assert_eq!(CrcKind::Ccitt16.checksum(&[0xA1, 0xA1, 0xA1]), 0xCDB4);
    }

    #[test]
    fn ccitt_incremental_matches_oneshot() {
        let data = b"flux transitions";
        let (a, b) = data.split_at(5);
        let state = CrcKind::Ccitt16.update(CrcKind::Ccitt16.init(), a);
        assert_eq!(CrcKind::Ccitt16.update(state, b), CrcKind::Ccitt16.checksum(data));
    }

    #[test]
    fn field_plus_stored_crc_is_zero() {
        let mut field = vec![0xA1, 0xA1, 0xA1, 0xFE, 2, 0, 7, 2];
        let crc = CrcKind::Ccitt16.checksum(&field);
        field.extend(CrcKind::Ccitt16.to_stored(crc));
        assert_eq!(CrcKind::Ccitt16.checksum(&field), 0);
    }

    #[test]
    fn xor8() {
        assert_eq!(CrcKind::Xor8.checksum(&[0x01, 0x02, 0x04]), 0x07);
        assert_eq!(CrcKind::Xor8.checksum(&[]), 0);
        assert_eq!(CrcKind::Xor8.read_stored(&[0x5A, 0x00]), Some(0x5A));
        assert_eq!(CrcKind::Xor8.stored_len(), 1);
    }

    #[test]
    fn read_stored_requires_enough_bytes() {
        assert_eq!(CrcKind::Ccitt16.read_stored(&[0x12]), None);
        assert_eq!(CrcKind::Ccitt16.read_stored(&[0x12, 0x34]), Some(0x1234));
    }
}
