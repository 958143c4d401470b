//! CRC-guided bit-flip correction for sectors that fail their data check.
//!
//! Only data-carrying bits inside the sector's data and check field are ever
//! flipped, and only those the fusion stage marked weak or low-confidence.
//! A high-confidence bit is never a candidate.
//!
//! # Search
//!
//! Candidates are ordered lowest confidence first and capped.  The search
//! runs in rounds over a growing *base* set (initially empty):
//!
//! 1. base + every single remaining candidate
//! 2. base + every pair of remaining candidates
//! 3. extend the base with the two lowest-confidence remaining candidates
//!
//! It stops at the first set that makes the check value match, when the base
//! plus one more flip would exceed `max_bits`, when candidates run out, or
//! when the evaluation budget is spent.  The first match is accepted even if
//! another set would also match.
//!
//! When the search fails, [`correct_from_revolutions`] re-reads the field
//! from each individual revolution and accepts the first one that verifies.

use std::sync::Arc;

use tracing::{debug, info};

use crate::codec::{LineCode, MarkKind};
use crate::error::DecodeError;
use crate::pll::DecodedBitstream;
use crate::recovery::{read_field, SectorRecord};

/// Bit slip tolerated when re-reading a field from another revolution.
const REVOLUTION_SLIP: isize = 4;

// ── Configuration ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct CorrectorConfig {
    /// Total flipped bits allowed in one candidate set.
    pub max_bits:        usize,
    /// Bits below this fused confidence are candidates even if not weak.
    pub weak_threshold:  f32,
    pub max_candidates:  usize,
    pub max_evaluations: usize,
}

impl CorrectorConfig {
    pub fn new(max_bits: usize, weak_threshold: f32) -> Self {
        Self { max_bits, weak_threshold, max_candidates: 48, max_evaluations: 200_000 }
    }
}

// ── Types ─────────────────────────────────────────────────────────────────────

/// One candidate set under evaluation.  Discarded after use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorrectionAttempt {
    /// Raw bit positions flipped.
    pub positions: Vec<usize>,
    pub crc:       u16,
    pub matched:   bool,
    pub iteration: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorrectionOutcome {
    /// The sector already verified.
    AlreadyGood,
    /// A candidate set verified.
    Corrected { positions: Vec<usize>, iterations: usize },
    /// Another revolution's copy of the field verified.
    FromRevolution { revolution: usize, changed_bits: usize },
    /// Budget exhausted; data untouched.
    Exhausted { candidates: usize, iterations: usize },
}

// ── Field view ────────────────────────────────────────────────────────────────

/// The raw bits of one data field with flips applied on top.
struct FieldView<'a> {
    code:     &'a dyn LineCode,
    raw:      Vec<bool>,
    start:    usize,
    data_len: usize,
    mark:     u8,
}

impl FieldView<'_> {
    fn evaluate(&mut self, positions: &[usize], iteration: usize) -> Option<(CorrectionAttempt, Vec<u8>, u16)> {
        for &p in positions {
            self.raw[p - self.start] ^= true;
        }
        let field = read_field(self.code, &self.raw, 0, self.data_len + self.code.crc_kind().stored_len());
        for &p in positions {
            self.raw[p - self.start] ^= true;
        }
        let field = field?;
        let (data, check) = field.split_at(self.data_len);
        let stored = self.code.crc_kind().read_stored(check)?;
        let crc = self.code.data_check(self.mark, data);
        let attempt = CorrectionAttempt {
            positions: positions.to_vec(),
            crc,
            matched:   crc == stored,
            iteration,
        };
        Some((attempt, data.to_vec(), stored))
    }
}

fn data_mark(code: &dyn LineCode, record: &SectorRecord) -> u8 {
    code.mark_byte(if record.deleted { MarkKind::DeletedData } else { MarkKind::Data })
}

/// Candidate positions, lowest confidence first.
pub fn candidates(record: &SectorRecord, fused: &DecodedBitstream, code: &dyn LineCode, cfg: &CorrectorConfig) -> Vec<usize> {
    let span = record.data_span;
    let mut out: Vec<usize> = (span.start_bit..span.end_bit().min(fused.len()))
        .filter(|&p| code.is_data_bit(p - span.start_bit) && fused.is_suspect(p, cfg.weak_threshold))
        .collect();
    out.sort_by(|&a, &b| {
        fused.confidence[a]
            .partial_cmp(&fused.confidence[b])
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.cmp(&b))
    });
    out.truncate(cfg.max_candidates);
    out
}

// ── Search ────────────────────────────────────────────────────────────────────

/// Try to repair `record` in place from the fused stream.
pub fn correct_sector(
    record: &mut SectorRecord,
    fused:  &DecodedBitstream,
    code:   &dyn LineCode,
    cfg:    &CorrectorConfig,
) -> CorrectionOutcome {
    if record.crc_ok {
        return CorrectionOutcome::AlreadyGood;
    }

    let span = record.data_span;
    let cands = candidates(record, fused, code, cfg);
    let raw = match fused.bits.get(span.start_bit..span.end_bit()) {
        Some(r) => r.to_vec(),
        None => return CorrectionOutcome::Exhausted { candidates: 0, iterations: 0 },
    };
    let mut view = FieldView {
        code,
        raw,
        start:    span.start_bit,
        data_len: record.data.len(),
        mark:     data_mark(code, record),
    };

    let mut base: Vec<usize> = Vec::new();
    let mut rest: Vec<usize> = cands.clone();
    let mut iterations = 0usize;

    'rounds: while base.len() < cfg.max_bits && !rest.is_empty() {
        // Singles, then pairs, on top of the base.
        let mut sets: Vec<Vec<usize>> = rest.iter().map(|&c| vec![c]).collect();
        if base.len() + 2 <= cfg.max_bits {
            for i in 0..rest.len() {
                for j in i + 1..rest.len() {
                    sets.push(vec![rest[i], rest[j]]);
                }
            }
        }

        for extra in sets {
            if iterations >= cfg.max_evaluations {
                break 'rounds;
            }
            iterations += 1;
            let mut positions = base.clone();
            positions.extend(extra);
            if let Some((attempt, data, stored)) = view.evaluate(&positions, iterations) {
                if attempt.matched {
                    info!(
                        id = %record.id,
                        flipped = attempt.positions.len(),
                        iterations,
                        "sector corrected"
                    );
                    record.data                  = data;
                    record.stored_crc            = stored;
                    record.computed_crc          = attempt.crc;
                    record.crc_ok                = true;
                    record.corrected             = true;
                    record.corrections_count     = attempt.positions.len();
                    record.correction_iterations = iterations;
                    record.fault                 = None;
                    return CorrectionOutcome::Corrected { positions: attempt.positions, iterations };
                }
            }
        }

        let grow = rest.len().min(2);
        base.extend(rest.drain(..grow));
    }

    debug!(id = %record.id, candidates = cands.len(), iterations, "correction search exhausted");
    record.correction_iterations = iterations;
    record.fault = Some(DecodeError::CrcMismatchUncorrectable { id: record.id, iterations });
    CorrectionOutcome::Exhausted { candidates: cands.len(), iterations }
}

/// Re-read the field from individual revolutions.
///
/// `offsets[i]` is the alignment of revolution `i` against the fused
/// timeline, `None` when it was not used.
pub fn correct_from_revolutions(
    record:  &mut SectorRecord,
    revs:    &[Arc<DecodedBitstream>],
    offsets: &[Option<isize>],
    code:    &dyn LineCode,
) -> Option<CorrectionOutcome> {
    if record.crc_ok {
        return Some(CorrectionOutcome::AlreadyGood);
    }
    let kind = code.crc_kind();
    let field_len = record.data.len() + kind.stored_len();
    let mark = data_mark(code, record);
    let current: Vec<u8> = record.data.iter().copied().chain(kind.to_stored(record.stored_crc)).collect();

    let slips = std::iter::once(0).chain((1..=REVOLUTION_SLIP).flat_map(|d| [-d, d]));
    let slips: Vec<isize> = slips.collect();

    for (index, rev) in revs.iter().enumerate() {
        let offset = match offsets.get(index).copied().flatten() {
            Some(o) => o,
            None => continue,
        };
        for &slip in &slips {
            let start = record.data_span.start_bit as isize + offset + slip;
            if start < 0 {
                continue;
            }
            let field = match read_field(code, &rev.bits, start as usize, field_len) {
                Some(f) => f,
                None => continue,
            };
            let (data, check) = field.split_at(record.data.len());
            let stored = match kind.read_stored(check) {
                Some(s) => s,
                None => continue,
            };
            let computed = code.data_check(mark, data);
            if computed != stored {
                continue;
            }
            let changed_bits = current
                .iter()
                .zip(&field)
                .map(|(a, b)| (a ^ b).count_ones() as usize)
                .sum();
            info!(id = %record.id, revolution = index, changed_bits, "sector recovered from single revolution");
            record.data              = data.to_vec();
            record.stored_crc        = stored;
            record.computed_crc      = computed;
            record.crc_ok            = true;
            record.corrected         = true;
            record.corrections_count = changed_bits;
            record.fault             = None;
            return Some(CorrectionOutcome::FromRevolution { revolution: index, changed_bits });
        }
    }
    None
}
