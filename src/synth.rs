//! Synthetic tracks and flux, for tests, benches and the `synth` command.
//!
//! A [`TrackSpec`] is encoded to raw cells with the line code's own
//! encoder, then [`FluxSynth`] turns the cells into timed transitions.
//! Transition times are computed absolutely and rounded to ticks once, so
//! rounding never accumulates into drift.  Jitter is uniform, seeded and
//! different for every revolution.  Individual transitions can be moved by a
//! fixed amount to plant weak bits.

use crate::codec::{get_line_code, BitWriter, Encoding, LineCode};
use crate::error::Result;
use crate::flux::FluxRevolution;
use crate::recovery::SectorId;

/// Sampling clock used by the bundled generators.
pub const DEFAULT_TICK_HZ: f64 = 72e6;

/// Typical raw cell time for each line code.
pub fn default_cell_ns(encoding: Encoding) -> f64 {
    match encoding {
        Encoding::Mfm => 2000.0,
        Encoding::Fm  => 4000.0,
        Encoding::Gcr => 3250.0,
    }
}

// ── Track layout ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticSector {
    pub id:      SectorId,
    pub data:    Vec<u8>,
    pub deleted: bool,
}

/// Recognisable payload: every sector differs, every byte value occurs.
pub fn pattern_payload(id: &SectorId, len: usize) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(7) ^ id.sector.wrapping_mul(31) ^ id.cylinder).collect()
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrackSpec {
    pub encoding:        Encoding,
    pub cylinder:        u8,
    pub head:            u8,
    pub sectors:         Vec<SyntheticSector>,
    /// Gap bytes ahead of the first sector.
    pub lead_gap:        usize,
    /// Gap bytes after every sector.
    pub sector_gap:      usize,
    /// Pad the tail with gap until the track holds this many transitions.
    pub min_transitions: usize,
}

impl TrackSpec {
    pub fn new(encoding: Encoding, cylinder: u8, head: u8) -> Self {
        Self {
            encoding,
            cylinder,
            head,
            sectors:         Vec::new(),
            lead_gap:        32,
            sector_gap:      24,
            min_transitions: 0,
        }
    }

    /// Append `count` sectors numbered the way the line code numbers them,
    /// carrying [`pattern_payload`] data.
    pub fn with_standard_sectors(mut self, count: u8, size_code: u8) -> Self {
        let code = get_line_code(self.encoding);
        let (first, head, size_code) = match self.encoding {
            Encoding::Gcr => (0, 0, 1),
            _             => (1, self.head, size_code),
        };
        for n in 0..count {
            let id = SectorId { cylinder: self.cylinder, head, sector: first + n, size_code };
            let data = pattern_payload(&id, code.data_len(&id));
            self.sectors.push(SyntheticSector { id, data, deleted: false });
        }
        self
    }

    pub fn with_sector(mut self, sector: SyntheticSector) -> Self {
        self.sectors.push(sector);
        self
    }

    pub fn with_min_transitions(mut self, n: usize) -> Self {
        self.min_transitions = n;
        self
    }

    /// Raw cells of the whole track.
    pub fn encode(&self) -> Vec<bool> {
        let code = get_line_code(self.encoding);
        let mut w = BitWriter::new();
        code.write_gap(&mut w, self.lead_gap);
        for s in &self.sectors {
            code.encode_sector(&mut w, &s.id, &s.data, s.deleted);
            code.write_gap(&mut w, self.sector_gap);
        }
        pad_transitions(code.as_ref(), &mut w, self.min_transitions);
        w.into_bits()
    }
}

fn pad_transitions(code: &dyn LineCode, w: &mut BitWriter, min_transitions: usize) {
    let mut ones = w.bits.iter().filter(|&&b| b).count();
    while ones < min_transitions {
        let before = w.len();
        code.write_gap(w, 1);
        ones += w.bits[before..].iter().filter(|&&b| b).count();
    }
}

// ── Flux ─────────────────────────────────────────────────────────────────────

/// xorshift64*, enough for reproducible jitter.
#[derive(Debug, Clone)]
pub struct XorShift(u64);

impl XorShift {
    pub fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.0 = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    /// Uniform in `[-1, 1)`.
    pub fn next_signed(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 52) as f64 - 1.0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FluxSynth {
    pub tick_hz:   f64,
    pub cell_ns:   f64,
    /// Peak jitter added to every transition.
    pub jitter_ns: f64,
    pub seed:      u64,
}

impl FluxSynth {
    pub fn new(tick_hz: f64, cell_ns: f64) -> Self {
        Self { tick_hz, cell_ns, jitter_ns: 0.0, seed: 0x5EED }
    }

    pub fn for_encoding(encoding: Encoding) -> Self {
        Self::new(DEFAULT_TICK_HZ, default_cell_ns(encoding))
    }

    pub fn with_jitter(mut self, jitter_ns: f64, seed: u64) -> Self {
        self.jitter_ns = jitter_ns;
        self.seed = seed;
        self
    }

    /// Flux for one revolution of `bits`.
    ///
    /// `shifts` moves the transition at the given cell index by the given
    /// number of nanoseconds.  Cells after the last one bit are dropped.
    pub fn revolution(&self, bits: &[bool], revolution: usize, shifts: &[(usize, f64)]) -> Result<FluxRevolution> {
        let mut rng = XorShift::new(self.seed ^ (revolution as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15));
        let ticks_per_ns = self.tick_hz / 1e9;

        let mut intervals = Vec::with_capacity(bits.len() / 2);
        let mut last_tick = 0i64;
        for (p, _) in bits.iter().enumerate().filter(|&(_, &b)| b) {
            let mut t = (p + 1) as f64 * self.cell_ns;
            if self.jitter_ns > 0.0 {
                t += rng.next_signed() * self.jitter_ns;
            }
            t += shifts.iter().filter(|(at, _)| *at == p).map(|(_, ns)| ns).sum::<f64>();
            let tick = (t * ticks_per_ns).round() as i64;
            intervals.push((tick - last_tick).max(1) as u32);
            last_tick = tick.max(last_tick + 1);
        }
        FluxRevolution::new(intervals, self.tick_hz)
    }

    /// Several revolutions of the same track.  `weak` shifts apply to the
    /// revolution with that index only.
    pub fn revolutions(&self, bits: &[bool], count: usize, weak: &[(usize, usize, f64)]) -> Result<Vec<FluxRevolution>> {
        (0..count)
            .map(|r| {
                let shifts: Vec<(usize, f64)> =
                    weak.iter().filter(|(rev, _, _)| *rev == r).map(|&(_, at, ns)| (at, ns)).collect();
                self.revolution(bits, r, &shifts)
            })
            .collect()
    }
}

/// `count` one-bit positions picked pseudo-randomly from `range`.
pub fn pick_transitions(bits: &[bool], range: std::ops::Range<usize>, count: usize, seed: u64) -> Vec<usize> {
    let ones: Vec<usize> = range.filter(|&p| bits.get(p) == Some(&true)).collect();
    if ones.is_empty() {
        return Vec::new();
    }
    let mut rng = XorShift::new(seed);
    let mut picked: Vec<usize> = (0..count).map(|_| ones[(rng.next_u64() % ones.len() as u64) as usize]).collect();
    picked.sort_unstable();
    picked.dedup();
    picked
}
