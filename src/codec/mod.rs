//! Line codes: how sector bytes are laid out as raw bit cells on the track.
//!
//! # Supported encodings
//!
//! | Encoding | Raw bits / byte | Mark detection | Check |
//! |----------|-----------------|----------------|-------|
//! | MFM (IBM System/34) | 16 | `0x4489` sync ×3, then mark byte | CRC-16/CCITT over `A1 A1 A1` + mark + field |
//! | FM (IBM 3740)       | 16 | clock-violating mark patterns     | CRC-16/CCITT over mark + field |
//! | GCR (Commodore)     | 10 | sync run + GCR mark byte          | XOR checksum |
//!
//! Mark detection is fuzzy: a 16-bit window matches when its Hamming distance
//! to the pattern is within the caller's tolerance.  The best of the next two
//! bit positions is kept so a match found early on a noisy edge still lands
//! on the true boundary.
//!
//! # Dispatch
//!
//! The set of line codes is closed.  [`Encoding`] names one and
//! [`get_line_code`] returns its implementation behind the [`LineCode`]
//! trait.  The encoders live next to the decoders so synthetic tracks are
//! always produced by the exact inverse of what is parsed.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::crc::CrcKind;
use crate::recovery::SectorId;

// ── Encoding identity ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Encoding {
    Mfm,
    Fm,
    Gcr,
}

impl Encoding {
    /// Shortest legal run between transitions, in cells.
    pub fn shortest_run(self) -> usize {
        match self {
            Encoding::Mfm => 2,
            Encoding::Fm  => 1,
            Encoding::Gcr => 1,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Encoding::Mfm => "mfm",
            Encoding::Fm  => "fm",
            Encoding::Gcr => "gcr",
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Encoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "mfm" => Ok(Encoding::Mfm),
            "fm"  => Ok(Encoding::Fm),
            "gcr" => Ok(Encoding::Gcr),
            other => Err(format!("unknown encoding '{other}' (expected mfm, fm or gcr)")),
        }
    }
}

// ── Marks ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarkKind {
    Id,
    Data,
    DeletedData,
}

impl MarkKind {
    pub fn is_data(self) -> bool {
        matches!(self, MarkKind::Data | MarkKind::DeletedData)
    }
}

/// One address mark located in a raw bitstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkHit {
    pub kind:      MarkKind,
    /// First bit of the sync run or pattern.
    pub sync_bit:  usize,
    /// First raw bit of the mark byte.
    pub mark_bit:  usize,
    /// First raw bit of the field that follows the mark.
    pub body_bit:  usize,
    /// Summed Hamming distance of the matched patterns.
    pub distance:  u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedHeader {
    pub id:           SectorId,
    pub stored_crc:   u16,
    pub computed_crc: u16,
}

impl ParsedHeader {
    pub fn crc_ok(&self) -> bool {
        self.stored_crc == self.computed_crc
    }
}

// ── Bit writer ───────────────────────────────────────────────────────────────

/// Raw cell sink used by the encoders.
#[derive(Debug, Default, Clone)]
pub struct BitWriter {
    pub bits:  Vec<bool>,
    last_data: bool,
}

impl BitWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bit: bool) {
        self.bits.push(bit);
    }

    /// Append the low `n` bits of `value`, MSB first.
    pub fn push_raw(&mut self, value: u32, n: u32) {
        for i in (0..n).rev() {
            self.bits.push(value >> i & 1 == 1);
        }
    }

    pub fn len(&self) -> usize { self.bits.len() }
    pub fn is_empty(&self) -> bool { self.bits.is_empty() }

    pub fn into_bits(self) -> Vec<bool> {
        self.bits
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn window16(bits: &[bool], at: usize) -> Option<u16> {
    let w = bits.get(at..at + 16)?;
    Some(w.iter().fold(0u16, |acc, &b| acc << 1 | b as u16))
}

fn distance(bits: &[bool], at: usize, pattern: u16) -> Option<u32> {
    window16(bits, at).map(|w| (w ^ pattern).count_ones())
}

/// Among `at..=at+2`, the position closest to `pattern`.
fn refine(bits: &[bool], at: usize, pattern: u16) -> (usize, u32) {
    let mut best = (at, distance(bits, at, pattern).unwrap_or(16));
    for p in at + 1..=at + 2 {
        if let Some(d) = distance(bits, p, pattern) {
            if d < best.1 {
                best = (p, d);
            }
        }
    }
    best
}

/// Walk `bits` with a per-position matcher.  Each match is refined over the
/// next two positions and scanning resumes past the matched pattern.
fn scan_marks<F>(bits: &[bool], matcher: F) -> Vec<(usize, MarkKind, u32)>
where
    F: Fn(usize) -> Option<(MarkKind, u32)>,
{
    let mut found = Vec::new();
    let mut p = 0;
    while p + 16 <= bits.len() {
        let (kind, d) = match matcher(p) {
            Some(m) => m,
            None => {
                p += 1;
                continue;
            }
        };
        let mut best = (p, kind, d);
        for at in p + 1..=p + 2 {
            if let Some((k, d)) = matcher(at) {
                if d < best.2 {
                    best = (at, k, d);
                }
            }
        }
        found.push(best);
        p = best.0 + 16;
    }
    found
}

/// Nearest candidate within `max_distance`; ties resolve to nothing.
fn nearest<T: Copy>(value: u16, candidates: &[(u16, T)], max_distance: u32) -> Option<(T, u32)> {
    let mut best: Option<(T, u32)> = None;
    let mut tie = false;
    for &(pattern, tag) in candidates {
        let d = (value ^ pattern).count_ones();
        match best {
            Some((_, bd)) if d > bd => {}
            Some((_, bd)) if d == bd => tie = true,
            _ => {
                best = Some((tag, d));
                tie = false;
            }
        }
    }
    match best {
        Some((tag, d)) if d <= max_distance && !tie => Some((tag, d)),
        _ => None,
    }
}

// ── Trait ────────────────────────────────────────────────────────────────────

pub trait LineCode: Send + Sync {
    fn encoding(&self) -> Encoding;
    fn crc_kind(&self) -> CrcKind;
    fn raw_bits_per_byte(&self) -> usize;
    /// Whether raw offset `offset` within a field carries data rather than clock.
    fn is_data_bit(&self, offset: usize) -> bool;
    fn decode_byte(&self, bits: &[bool], at: usize) -> Option<u8>;
    /// Every address mark in `bits`, in stream order.
    fn find_marks(&self, bits: &[bool], tolerance: u32) -> Vec<MarkHit>;
    fn mark_byte(&self, kind: MarkKind) -> u8;
    /// Bytes between an ID mark and the end of its check value.
    fn header_body_len(&self) -> usize;
    /// Raw bits after a header in which its data mark must start.
    fn data_window_bits(&self) -> usize;
    /// Bytes covered by the check value ahead of the field itself.
    fn check_preamble(&self, mark: u8) -> Vec<u8>;

    fn write_bytes(&self, w: &mut BitWriter, bytes: &[u8]);
    /// Sync run followed by the mark byte.
    fn write_mark(&self, w: &mut BitWriter, kind: MarkKind);
    fn write_gap(&self, w: &mut BitWriter, bytes: usize);
    /// Gap written between a header and its data mark.
    fn header_gap(&self) -> usize;

    // ── Provided: IBM-style fields ──────────────────────────────────────────

    fn decode_bytes(&self, bits: &[bool], at: usize, count: usize) -> Option<Vec<u8>> {
        let step = self.raw_bits_per_byte();
        (0..count).map(|i| self.decode_byte(bits, at + i * step)).collect()
    }

    /// Payload size for a sector, in bytes.
    fn data_len(&self, id: &SectorId) -> usize {
        id.size_bytes()
    }

    fn data_check(&self, mark: u8, data: &[u8]) -> u16 {
        let kind = self.crc_kind();
        let state = kind.update(kind.init(), &self.check_preamble(mark));
        kind.update(state, data)
    }

    /// `None` when the body is too short or the size code is impossible.
    fn parse_header(&self, body: &[u8]) -> Option<ParsedHeader> {
        let (fields, stored) = (body.get(..4)?, body.get(4..)?);
        if fields[3] > 7 {
            return None;
        }
        let id = SectorId { cylinder: fields[0], head: fields[1], sector: fields[2], size_code: fields[3] };
        let stored_crc = self.crc_kind().read_stored(stored)?;
        let computed_crc = self.data_check(self.mark_byte(MarkKind::Id), fields);
        Some(ParsedHeader { id, stored_crc, computed_crc })
    }

    fn header_body(&self, id: &SectorId) -> Vec<u8> {
        let mut body = vec![id.cylinder, id.head, id.sector, id.size_code];
        let crc = self.data_check(self.mark_byte(MarkKind::Id), &body);
        body.extend(self.crc_kind().to_stored(crc));
        body
    }

    fn data_body(&self, kind: MarkKind, data: &[u8]) -> Vec<u8> {
        let mut body = data.to_vec();
        let crc = self.data_check(self.mark_byte(kind), data);
        body.extend(self.crc_kind().to_stored(crc));
        body
    }

    /// ID field, header gap and data field of one sector.
    fn encode_sector(&self, w: &mut BitWriter, id: &SectorId, data: &[u8], deleted: bool) {
        let kind = if deleted { MarkKind::DeletedData } else { MarkKind::Data };
        self.write_mark(w, MarkKind::Id);
        self.write_bytes(w, &self.header_body(id));
        self.write_gap(w, self.header_gap());
        self.write_mark(w, kind);
        self.write_bytes(w, &self.data_body(kind, data));
    }
}

// ── MFM ──────────────────────────────────────────────────────────────────────

pub const MFM_SYNC: u16 = 0x4489;
const MFM_MARKS: [(u16, MarkKind); 3] =
    [(0xFE, MarkKind::Id), (0xFB, MarkKind::Data), (0xF8, MarkKind::DeletedData)];

pub struct MfmCode;

impl MfmCode {
    fn mark_at(&self, bits: &[bool], at: usize) -> Option<MarkKind> {
        let byte = self.decode_byte(bits, at)?;
        nearest(byte as u16, &MFM_MARKS, 1).map(|(kind, _)| kind)
    }
}

impl LineCode for MfmCode {
    fn encoding(&self) -> Encoding { Encoding::Mfm }
    fn crc_kind(&self) -> CrcKind { CrcKind::Ccitt16 }
    fn raw_bits_per_byte(&self) -> usize { 16 }
    fn is_data_bit(&self, offset: usize) -> bool { offset % 2 == 1 }
    fn header_body_len(&self) -> usize { 6 }
    fn data_window_bits(&self) -> usize { 1024 }
    fn header_gap(&self) -> usize { 22 }

    fn mark_byte(&self, kind: MarkKind) -> u8 {
        match kind {
            MarkKind::Id          => 0xFE,
            MarkKind::Data        => 0xFB,
            MarkKind::DeletedData => 0xF8,
        }
    }

    fn check_preamble(&self, mark: u8) -> Vec<u8> {
        vec![0xA1, 0xA1, 0xA1, mark]
    }

    fn decode_byte(&self, bits: &[bool], at: usize) -> Option<u8> {
        let w = bits.get(at..at + 16)?;
        Some(w.iter().skip(1).step_by(2).fold(0u8, |acc, &b| acc << 1 | b as u8))
    }

    fn find_marks(&self, bits: &[bool], tolerance: u32) -> Vec<MarkHit> {
        let mut hits = Vec::new();
        let mut p = 0;
        while let Some(d) = distance(bits, p, MFM_SYNC) {
            if d > tolerance {
                p += 1;
                continue;
            }
            let (start, first) = refine(bits, p, MFM_SYNC);
            let mut syncs = 1;
            let mut total = first;
            while syncs < 3 {
                match distance(bits, start + 16 * syncs, MFM_SYNC) {
                    Some(d) if d <= tolerance => {
                        total += d;
                        syncs += 1;
                    }
                    _ => break,
                }
            }
            if syncs < 2 {
                p = start + 1;
                continue;
            }
            // A corrupted third sync still leaves the mark at +48.
            let found = (syncs..=3)
                .map(|k| start + 16 * k)
                .find_map(|at| self.mark_at(bits, at).map(|kind| (at, kind)));
            match found {
                Some((mark_bit, kind)) => {
                    hits.push(MarkHit { kind, sync_bit: start, mark_bit, body_bit: mark_bit + 16, distance: total });
                    p = mark_bit + 16;
                }
                None => p = start + 1,
            }
        }
        hits
    }

    fn write_bytes(&self, w: &mut BitWriter, bytes: &[u8]) {
        for &b in bytes {
            for i in (0..8).rev() {
                let d = b >> i & 1 == 1;
                w.push(!(w.last_data || d));
                w.push(d);
                w.last_data = d;
            }
        }
    }

    fn write_mark(&self, w: &mut BitWriter, kind: MarkKind) {
        self.write_bytes(w, &[0x00; 12]);
        for _ in 0..3 {
            w.push_raw(MFM_SYNC as u32, 16);
        }
        w.last_data = true;
        self.write_bytes(w, &[self.mark_byte(kind)]);
    }

    fn write_gap(&self, w: &mut BitWriter, bytes: usize) {
        self.write_bytes(w, &vec![0x4E; bytes]);
    }
}

// ── FM ───────────────────────────────────────────────────────────────────────

const FM_PREAMBLE: u16 = 0xAAAA;
const FM_MARKS: [(u16, MarkKind); 3] =
    [(0xF57E, MarkKind::Id), (0xF56F, MarkKind::Data), (0xF56A, MarkKind::DeletedData)];

pub struct FmCode;

impl FmCode {
    /// The mark pattern must follow a `00` byte (`0xAAAA` raw).
    fn best_at(&self, bits: &[bool], at: usize, tolerance: u32) -> Option<(MarkKind, u32)> {
        let pre = distance(bits, at.checked_sub(16)?, FM_PREAMBLE)?;
        if pre > tolerance {
            return None;
        }
        nearest(window16(bits, at)?, &FM_MARKS, tolerance)
    }
}

impl LineCode for FmCode {
    fn encoding(&self) -> Encoding { Encoding::Fm }
    fn crc_kind(&self) -> CrcKind { CrcKind::Ccitt16 }
    fn raw_bits_per_byte(&self) -> usize { 16 }
    fn is_data_bit(&self, offset: usize) -> bool { offset % 2 == 1 }
    fn header_body_len(&self) -> usize { 6 }
    fn data_window_bits(&self) -> usize { 1024 }
    fn header_gap(&self) -> usize { 11 }

    fn mark_byte(&self, kind: MarkKind) -> u8 {
        match kind {
            MarkKind::Id          => 0xFE,
            MarkKind::Data        => 0xFB,
            MarkKind::DeletedData => 0xF8,
        }
    }

    fn check_preamble(&self, mark: u8) -> Vec<u8> {
        vec![mark]
    }

    fn decode_byte(&self, bits: &[bool], at: usize) -> Option<u8> {
        let w = bits.get(at..at + 16)?;
        Some(w.iter().skip(1).step_by(2).fold(0u8, |acc, &b| acc << 1 | b as u8))
    }

    fn find_marks(&self, bits: &[bool], tolerance: u32) -> Vec<MarkHit> {
        scan_marks(bits, |at| self.best_at(bits, at, tolerance))
            .into_iter()
            .map(|(at, kind, d)| MarkHit { kind, sync_bit: at - 16, mark_bit: at, body_bit: at + 16, distance: d })
            .collect()
    }

    fn write_bytes(&self, w: &mut BitWriter, bytes: &[u8]) {
        for &b in bytes {
            for i in (0..8).rev() {
                w.push(true);
                w.push(b >> i & 1 == 1);
            }
        }
    }

    fn write_mark(&self, w: &mut BitWriter, kind: MarkKind) {
        self.write_bytes(w, &[0x00; 6]);
        let pattern = FM_MARKS
            .iter()
            .find(|(_, k)| *k == kind)
            .map_or(0xF57E, |(p, _)| *p);
        w.push_raw(pattern as u32, 16);
    }

    fn write_gap(&self, w: &mut BitWriter, bytes: usize) {
        self.write_bytes(w, &vec![0xFF; bytes]);
    }
}

// ── Commodore GCR ────────────────────────────────────────────────────────────

const GCR_ENCODE: [u8; 16] = [
    0x0A, 0x0B, 0x12, 0x13, 0x0E, 0x0F, 0x16, 0x17,
    0x09, 0x19, 0x1A, 0x1B, 0x0D, 0x1D, 0x1E, 0x15,
];

static GCR_DECODE: [u8; 32] = build_gcr_decode();

const fn build_gcr_decode() -> [u8; 32] {
    let mut table = [0xFFu8; 32];
    let mut i = 0;
    while i < 16 {
        table[GCR_ENCODE[i] as usize] = i as u8;
        i += 1;
    }
    table
}

const GCR_MARKS: [(u16, MarkKind); 2] = [(0xFD49, MarkKind::Id), (0xFD57, MarkKind::Data)];
const GCR_SYNC_LEAD: usize = 10;
const GCR_HEADER_MARK: u8 = 0x08;
const GCR_DATA_MARK:   u8 = 0x07;
const GCR_SECTOR_BYTES: usize = 256;
/// Disk ID written into synthetic headers.
pub const GCR_DISK_ID: [u8; 2] = [0x30, 0x30];

pub struct GcrCode;

impl GcrCode {
    /// The pattern carries the tail of the sync run; the run must extend at
    /// least `GCR_SYNC_LEAD` more one bits before it.
    fn best_at(&self, bits: &[bool], at: usize, tolerance: u32) -> Option<(MarkKind, u32)> {
        let lead = bits.get(at.checked_sub(GCR_SYNC_LEAD)?..at)?;
        if lead.iter().filter(|&&b| !b).count() as u32 > tolerance {
            return None;
        }
        nearest(window16(bits, at)?, &GCR_MARKS, tolerance)
    }
}

impl LineCode for GcrCode {
    fn encoding(&self) -> Encoding { Encoding::Gcr }
    fn crc_kind(&self) -> CrcKind { CrcKind::Xor8 }
    fn raw_bits_per_byte(&self) -> usize { 10 }
    fn is_data_bit(&self, _offset: usize) -> bool { true }
    fn header_body_len(&self) -> usize { 7 }
    fn data_window_bits(&self) -> usize { 512 }
    fn header_gap(&self) -> usize { 9 }

    fn mark_byte(&self, kind: MarkKind) -> u8 {
        match kind {
            MarkKind::Id => GCR_HEADER_MARK,
            MarkKind::Data | MarkKind::DeletedData => GCR_DATA_MARK,
        }
    }

    fn check_preamble(&self, _mark: u8) -> Vec<u8> {
        Vec::new()
    }

    fn decode_byte(&self, bits: &[bool], at: usize) -> Option<u8> {
        let w = bits.get(at..at + 10)?;
        let group = |s: &[bool]| s.iter().fold(0usize, |acc, &b| acc << 1 | b as usize);
        let hi = GCR_DECODE[group(&w[..5])];
        let lo = GCR_DECODE[group(&w[5..])];
        if hi == 0xFF || lo == 0xFF {
            return None;
        }
        Some(hi << 4 | lo)
    }

    fn find_marks(&self, bits: &[bool], tolerance: u32) -> Vec<MarkHit> {
        scan_marks(bits, |at| self.best_at(bits, at, tolerance))
            .into_iter()
            .map(|(at, kind, d)| MarkHit {
                kind,
                sync_bit: at - GCR_SYNC_LEAD,
                mark_bit: at + 6,
                body_bit: at + 16,
                distance: d,
            })
            .collect()
    }

    fn data_len(&self, _id: &SectorId) -> usize {
        GCR_SECTOR_BYTES
    }

    /// Body: checksum, sector, track, id2, id1, 0x0F, 0x0F.
    fn parse_header(&self, body: &[u8]) -> Option<ParsedHeader> {
        let b = body.get(..5)?;
        let id = SectorId { cylinder: b[2], head: 0, sector: b[1], size_code: 1 };
        Some(ParsedHeader {
            id,
            stored_crc:   b[0] as u16,
            computed_crc: self.crc_kind().checksum(&b[1..5]),
        })
    }

    fn header_body(&self, id: &SectorId) -> Vec<u8> {
        let fields = [id.sector, id.cylinder, GCR_DISK_ID[1], GCR_DISK_ID[0]];
        let mut body = vec![self.crc_kind().checksum(&fields) as u8];
        body.extend_from_slice(&fields);
        body.extend_from_slice(&[0x0F, 0x0F]);
        body
    }

    fn data_body(&self, kind: MarkKind, data: &[u8]) -> Vec<u8> {
        let mut body = data.to_vec();
        body.push(self.data_check(self.mark_byte(kind), data) as u8);
        body.extend_from_slice(&[0x00, 0x00]);
        body
    }

    fn write_bytes(&self, w: &mut BitWriter, bytes: &[u8]) {
        for &b in bytes {
            w.push_raw(GCR_ENCODE[(b >> 4) as usize] as u32, 5);
            w.push_raw(GCR_ENCODE[(b & 0x0F) as usize] as u32, 5);
        }
    }

    fn write_mark(&self, w: &mut BitWriter, kind: MarkKind) {
        for _ in 0..40 {
            w.push(true);
        }
        self.write_bytes(w, &[self.mark_byte(kind)]);
    }

    fn write_gap(&self, w: &mut BitWriter, bytes: usize) {
        for _ in 0..bytes {
            w.push_raw(0x55, 8);
        }
    }
}

// ── Factory ──────────────────────────────────────────────────────────────────

pub fn get_line_code(encoding: Encoding) -> Box<dyn LineCode> {
    match encoding {
        Encoding::Mfm => Box::new(MfmCode),
        Encoding::Fm  => Box::new(FmCode),
        Encoding::Gcr => Box::new(GcrCode),
    }
}
