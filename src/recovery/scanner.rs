//! Sector scanner: address marks in, sector records out.
//!
//! # How it works
//!
//! The scanner asks the line code for every address mark in the stream, then
//! walks the ID marks in order:
//!
//! 1. Decode the header body and verify its check value.
//! 2. Look for a data mark after the header, within the line code's window,
//!    stopping early at the next ID mark.
//! 3. Decode `size + check` bytes of data and verify the data check.
//!
//! Marks that fall inside an already-consumed data field are ignored, so
//! payload bytes that happen to resemble a sync never produce phantom
//! sectors.
//!
//! The scan never fails.  Every problem becomes either a record with
//! `crc_ok == false` or a `RecordNotFound` issue.

use tracing::{debug, warn};

use crate::codec::{LineCode, MarkHit, MarkKind};
use crate::error::DecodeError;
use crate::pll::DecodedBitstream;
use crate::recovery::{DataSpan, SectorId, SectorRecord};

// ── Types ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default)]
pub struct SectorScan {
    pub sectors: Vec<SectorRecord>,
    pub issues:  Vec<DecodeError>,
    /// Address marks seen, including ones that led nowhere.
    pub marks:   usize,
}

// ── Field access ──────────────────────────────────────────────────────────────

/// Decode `count` bytes starting at raw bit `start`.
///
/// Returns `None` only when the field runs off the end of the stream; cells
/// that do not decode (invalid GCR groups) read as zero so the check fails
/// and the corrector still gets a chance.
pub fn read_field(code: &dyn LineCode, bits: &[bool], start: usize, count: usize) -> Option<Vec<u8>> {
    let step = code.raw_bits_per_byte();
    if start + count * step > bits.len() {
        return None;
    }
    Some((0..count).map(|i| code.decode_byte(bits, start + i * step).unwrap_or(0)).collect())
}

fn mean_confidence(stream: &DecodedBitstream, from: usize, to: usize) -> f32 {
    let slice = match stream.confidence.get(from..to.min(stream.confidence.len())) {
        Some(s) if !s.is_empty() => s,
        _ => return 0.0,
    };
    (slice.iter().map(|&c| c as f64).sum::<f64>() / slice.len() as f64) as f32
}

// ── Scanner ───────────────────────────────────────────────────────────────────

/// Recover every sector present in `stream`.
///
/// `cylinder` and `head` are the physical position being decoded.  A header
/// that names another position is still recovered as-is; the mismatch is
/// only logged.
pub fn scan_sectors(
    stream:    &DecodedBitstream,
    code:      &dyn LineCode,
    tolerance: u32,
    cylinder:  u8,
    head:      u8,
) -> SectorScan {
    let bits  = &stream.bits;
    let hits  = code.find_marks(bits, tolerance);
    let step  = code.raw_bits_per_byte();
    let crc   = code.crc_kind();

    let mut out = SectorScan { marks: hits.len(), ..Default::default() };
    let mut consumed_until = 0usize;

    for (i, hit) in hits.iter().enumerate() {
        if hit.sync_bit < consumed_until {
            continue;
        }
        if hit.kind != MarkKind::Id {
            debug!(bit = hit.sync_bit, kind = ?hit.kind, "data mark without a header");
            continue;
        }

        // ── Header ────────────────────────────────────────────────────────────
        let header_len = code.header_body_len();
        let header_end = hit.body_bit + header_len * step;
        let body = match read_field(code, bits, hit.body_bit, header_len) {
            Some(b) => b,
            None => {
                out.issues.push(not_found(hit.sync_bit, None, "header runs past end of track"));
                continue;
            }
        };
        let header = match code.parse_header(&body) {
            Some(h) => h,
            None => {
                out.issues.push(not_found(hit.sync_bit, None, "corrupt header: impossible size code"));
                continue;
            }
        };
        if !header.crc_ok() {
            out.issues.push(not_found(
                hit.sync_bit,
                Some(header.id),
                &format!(
                    "header check mismatch (stored {:04X}, computed {:04X})",
                    header.stored_crc, header.computed_crc
                ),
            ));
            continue;
        }
        let id = header.id;
        if id.cylinder != cylinder || id.head != head {
            debug!(%id, cylinder, head, "header names a different physical position");
        }

        // ── Data mark ─────────────────────────────────────────────────────────
        let data_hit = match find_data_mark(&hits[i + 1..], header_end, code.data_window_bits()) {
            Some(h) => h,
            None => {
                out.issues.push(not_found(
                    header_end,
                    Some(id),
                    &format!("no data mark within {} bits of header", code.data_window_bits()),
                ));
                consumed_until = header_end;
                continue;
            }
        };

        // ── Data field ────────────────────────────────────────────────────────
        let data_len  = code.data_len(&id);
        let field_len = data_len + crc.stored_len();
        let field = match read_field(code, bits, data_hit.body_bit, field_len) {
            Some(f) => f,
            None => {
                out.issues.push(not_found(data_hit.sync_bit, Some(id), "data field runs past end of track"));
                consumed_until = header_end;
                continue;
            }
        };
        let span = DataSpan { start_bit: data_hit.body_bit, len_bits: field_len * step };

        let data = field[..data_len].to_vec();
        let stored_crc = crc.read_stored(&field[data_len..]).unwrap_or(0);
        let computed_crc = code.data_check(code.mark_byte(data_hit.kind), &data);
        let crc_ok = stored_crc == computed_crc;

        let confidence = mean_confidence(stream, hit.sync_bit, header_end)
            * mean_confidence(stream, data_hit.sync_bit, span.end_bit());

        if !crc_ok {
            warn!(%id, stored = stored_crc, computed = computed_crc, "data check mismatch");
        }

        let record = SectorRecord {
            id,
            data,
            stored_crc,
            computed_crc,
            crc_ok,
            corrected:             false,
            corrections_count:     0,
            correction_iterations: 0,
            confidence,
            deleted:               data_hit.kind == MarkKind::DeletedData,
            bit_offset:            hit.sync_bit,
            data_span:             span,
            fault:                 None,
        };
        consumed_until = span.end_bit();
        insert_record(&mut out.sectors, record);
    }

    debug!(
        marks = out.marks,
        sectors = out.sectors.len(),
        issues = out.issues.len(),
        "sector scan complete"
    );
    out
}

fn find_data_mark(rest: &[MarkHit], header_end: usize, window: usize) -> Option<MarkHit> {
    for h in rest {
        if h.sync_bit < header_end {
            continue;
        }
        if h.sync_bit > header_end + window || !h.kind.is_data() {
            return None;
        }
        return Some(*h);
    }
    None
}

/// A repeated sector ID keeps the first verified copy.
fn insert_record(sectors: &mut Vec<SectorRecord>, record: SectorRecord) {
    match sectors.iter_mut().find(|s| s.id == record.id) {
        Some(existing) if !existing.crc_ok && record.crc_ok => *existing = record,
        Some(_) => debug!(id = %record.id, "duplicate sector ignored"),
        None => sectors.push(record),
    }
}

fn not_found(bit_offset: usize, id: Option<SectorId>, reason: &str) -> DecodeError {
    debug!(bit_offset, ?id, reason, "record not found");
    DecodeError::RecordNotFound { bit_offset, id, reason: reason.to_string() }
}
