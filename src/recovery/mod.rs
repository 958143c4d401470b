//! Sector records and per-track verdicts.
//!
//! [`scanner`] walks a fused bitstream and produces [`SectorRecord`]s.  A
//! record is created for every header whose check value holds and whose data
//! field is present, whether or not the data check passes.  Headers that fail
//! their check, missing data marks and truncated fields never become records;
//! they are reported as `RecordNotFound` issues next to the sector list.
//!
//! ## Track quality
//!
//! | Quality | Meaning |
//! |---------|---------|
//! | `Clean` | Every sector verified, no issues |
//! | `Recovered` | Every sector verified, some needed correction |
//! | `Partial` | At least one sector failed its check or went missing |
//! | `Unreadable` | No sector recovered at all |

pub mod scanner;

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::DecodeError;

pub use scanner::{read_field, scan_sectors, SectorScan};

// ── Identity ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SectorId {
    pub cylinder:  u8,
    pub head:      u8,
    pub sector:    u8,
    /// Payload is `128 << size_code` bytes.
    pub size_code: u8,
}

impl SectorId {
    pub fn size_bytes(&self) -> usize {
        128usize << self.size_code.min(7)
    }
}

impl fmt::Display for SectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "C{}:H{}:S{} ({} bytes)", self.cylinder, self.head, self.sector, self.size_bytes())
    }
}

/// Raw bit range holding a data field and its check value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSpan {
    pub start_bit: usize,
    pub len_bits:  usize,
}

impl DataSpan {
    pub fn end_bit(&self) -> usize {
        self.start_bit + self.len_bits
    }
}

// ── Sector record ────────────────────────────────────────────────────────────

/// One recovered sector slot.
///
/// `corrected == true` implies `crc_ok == true`.  After creation only the
/// corrector touches `data`, the CRC fields and the correction counters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SectorRecord {
    pub id:                    SectorId,
    #[serde(with = "hex_bytes")]
    pub data:                  Vec<u8>,
    pub stored_crc:            u16,
    pub computed_crc:          u16,
    pub crc_ok:                bool,
    pub corrected:             bool,
    /// Data bits changed by the corrector.
    pub corrections_count:     usize,
    /// Candidate sets the corrector evaluated.
    pub correction_iterations: usize,
    /// Header confidence × data confidence, in `[0, 1]`.
    pub confidence:            f32,
    pub deleted:               bool,
    /// First bit of the ID mark's sync.
    pub bit_offset:            usize,
    pub data_span:             DataSpan,
    /// Why the sector is still bad, if it is.
    pub fault:                 Option<DecodeError>,
}

impl SectorRecord {
    pub fn is_good(&self) -> bool {
        self.crc_ok
    }
}

// ── Track summary ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackQuality {
    Clean,
    Recovered,
    Partial,
    Unreadable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackSummary {
    pub sector_count:       usize,
    pub crc_ok_count:       usize,
    pub crc_error_count:    usize,
    pub corrected_count:    usize,
    /// Mean sector confidence.
    pub average_confidence: f32,
    /// Weak positions in the fused stream.
    pub weak_bits:          usize,
    pub issue_count:        usize,
    pub quality:            TrackQuality,
}

impl TrackSummary {
    pub fn from_sectors(sectors: &[SectorRecord], issues: &[DecodeError], weak_bits: usize) -> Self {
        let sector_count    = sectors.len();
        let crc_ok_count    = sectors.iter().filter(|s| s.is_good()).count();
        let corrected_count = sectors.iter().filter(|s| s.corrected).count();
        let average_confidence = if sector_count == 0 {
            0.0
        } else {
            sectors.iter().map(|s| s.confidence).sum::<f32>() / sector_count as f32
        };

        let quality = match (sector_count, crc_ok_count == sector_count && issues.is_empty()) {
            (0, _)                         => TrackQuality::Unreadable,
            (_, true) if corrected_count == 0 => TrackQuality::Clean,
            (_, true)                      => TrackQuality::Recovered,
            (_, false)                     => TrackQuality::Partial,
        };

        Self {
            sector_count,
            crc_ok_count,
            crc_error_count: sector_count - crc_ok_count,
            corrected_count,
            average_confidence,
            weak_bits,
            issue_count: issues.len(),
            quality,
        }
    }

    /// Whether another capture with more revolutions is worth taking.
    pub fn needs_recapture(&self) -> bool {
        matches!(self.quality, TrackQuality::Partial | TrackQuality::Unreadable)
    }
}

impl fmt::Display for TrackSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}: {}/{} sectors good, {} corrected, {} bad, {} issue(s), avg confidence {:.3}, {} weak bit(s)",
            self.quality,
            self.crc_ok_count,
            self.sector_count,
            self.corrected_count,
            self.crc_error_count,
            self.issue_count,
            self.average_confidence,
            self.weak_bits,
        )
    }
}

// ── Serde helper ─────────────────────────────────────────────────────────────

mod hex_bytes {
    use super::*;

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(d)?;
        hex::decode(text).map_err(serde::de::Error::custom)
    }
}
