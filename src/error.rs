use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::recovery::SectorId;

/// Every failure the decode pipeline can report.
///
/// Fatal variants abort the whole track and come back as `Err`. The
/// per-item variants (`AlignmentFailure`, `RecordNotFound`,
/// `CrcMismatchUncorrectable`) never do: they are stored on the revolution or
/// sector they describe and decoding carries on with the remaining items.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DecodeError {
    #[error("Insufficient signal: no histogram peak clears the noise floor ({samples} samples)")]
    InsufficientSignal { samples: usize },

    #[error("Alignment failure: revolution {revolution} best score {score:.3} at offset {offset}")]
    AlignmentFailure { revolution: usize, offset: isize, score: f64 },

    #[error("Record not found at bit {bit_offset}: {reason}")]
    RecordNotFound {
        bit_offset: usize,
        id:         Option<SectorId>,
        reason:     String,
    },

    #[error("CRC mismatch uncorrectable for {id} after {iterations} attempt(s)")]
    CrcMismatchUncorrectable { id: SectorId, iterations: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Empty capture: no flux transitions supplied")]
    EmptyCapture,

    #[error("Malformed capture: {0}")]
    MalformedCapture(String),

    #[error("Decode cancelled")]
    Cancelled,
}

impl DecodeError {
    /// Whether this error aborts the whole track rather than one item.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            DecodeError::AlignmentFailure { .. }
                | DecodeError::RecordNotFound { .. }
                | DecodeError::CrcMismatchUncorrectable { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, DecodeError>;
