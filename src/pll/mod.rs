//! Digital phase-locked loop: timed transitions in, bit cells out.
//!
//! # Loop
//!
//! For every interval the loop works out how many cells elapsed
//! (`n = round(adjusted / cell)`, at least 1) and the phase error left over.
//! It emits `n - 1` zero bits followed by a one bit.
//!
//! | Term | Update |
//! |------|--------|
//! | phase | `carry = error × (1 - Kp)`, `Kp = min(1, 2·damping·bandwidth)` |
//! | frequency | `cell += ratio × error / n`, clamped to nominal ± window |
//! | ratio | `fast_correction` until locked, `slow_correction` afterwards |
//!
//! The loop is locked after `lock_runs` consecutive confident runs.  A weak
//! run drops the lock and does not train the frequency term.
//!
//! # Confidence
//!
//! Every bit of a run shares the run's confidence
//! `1 - |error| / (cell / 2)`.  Runs below the weak threshold are flagged weak
//! bit by bit.  Intervals longer than four times the widest legal cell are
//! gaps: their bits carry zero confidence and the loop state is not touched
//! apart from resetting the carried phase.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::flux::NormalizedRevolution;

/// Upper bound on the cells emitted for one gap interval.
const MAX_GAP_CELLS: usize = 1 << 16;

// ── Configuration ────────────────────────────────────────────────────────────

/// Run-length snapping applied before phase error is measured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InterBandRejection {
    None,
    /// Runs of 3 or 5 cells snap to the nearest of 2, 4 or 6.
    Gcr,
    /// Runs snap to 2 or 4 cells.
    Fm,
}

impl InterBandRejection {
    /// `n` is the rounded run length, `exact` the unrounded one.
    fn snap(self, n: usize, exact: f64) -> usize {
        match self {
            InterBandRejection::None => n,
            InterBandRejection::Gcr => match n {
                3 => if exact < 3.0 { 2 } else { 4 },
                5 => if exact < 5.0 { 4 } else { 6 },
                _ => n,
            },
            InterBandRejection::Fm => match n {
                0 | 1 | 2 => 2,
                3 => if exact < 3.0 { 2 } else { 4 },
                _ => 4,
            },
        }
    }
}

impl FromStr for InterBandRejection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(InterBandRejection::None),
            "gcr"  => Ok(InterBandRejection::Gcr),
            "fm"   => Ok(InterBandRejection::Fm),
            other  => Err(format!("unknown rejection mode '{other}' (expected none, gcr or fm)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PllConfig {
    pub nominal_cell_ns: f64,
    pub bandwidth:       f64,
    pub damping:         f64,
    pub fast_correction: f64,
    pub slow_correction: f64,
    /// Allowed cell drift, in percent of nominal.
    pub window_percent:  f64,
    pub lock_runs:       usize,
    pub weak_threshold:  f32,
    pub rejection:       InterBandRejection,
}

impl PllConfig {
    pub fn new(nominal_cell_ns: f64) -> Self {
        Self {
            nominal_cell_ns,
            bandwidth:       0.05,
            damping:         0.707,
            fast_correction: 1.0 / 8.0,
            slow_correction: 1.0 / 32.0,
            window_percent:  18.0,
            lock_runs:       16,
            weak_threshold:  0.5,
            rejection:       InterBandRejection::None,
        }
    }

    pub fn with_loop(mut self, bandwidth: f64, damping: f64) -> Self {
        self.bandwidth = bandwidth;
        self.damping = damping;
        self
    }

    pub fn with_weak_threshold(mut self, threshold: f32) -> Self {
        self.weak_threshold = threshold;
        self
    }

    pub fn with_rejection(mut self, rejection: InterBandRejection) -> Self {
        self.rejection = rejection;
        self
    }

    fn phase_gain(&self) -> f64 {
        (2.0 * self.damping * self.bandwidth).clamp(0.0, 1.0)
    }

    fn cell_bounds(&self) -> (f64, f64) {
        let w = self.window_percent / 100.0;
        (self.nominal_cell_ns * (1.0 - w), self.nominal_cell_ns * (1.0 + w))
    }
}

// ── Output ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BitstreamStats {
    /// Mean per-bit confidence.
    pub average_confidence: f32,
    pub weak_count:         usize,
    pub transitions:        usize,
    pub gap_count:          usize,
    pub final_cell_ns:      f64,
    /// Bit position at which the index pulse fell, if inside the stream.
    pub index_bit:          Option<usize>,
}

/// Bits with parallel confidence and weak flags.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecodedBitstream {
    pub bits:       Vec<bool>,
    pub confidence: Vec<f32>,
    pub weak:       Vec<bool>,
    pub stats:      BitstreamStats,
}

impl DecodedBitstream {
    /// Build from parallel arrays, deriving the confidence summary.
    pub fn from_parts(bits: Vec<bool>, confidence: Vec<f32>, weak: Vec<bool>) -> Self {
        debug_assert_eq!(bits.len(), confidence.len());
        debug_assert_eq!(bits.len(), weak.len());
        let mut s = Self { bits, confidence, weak, stats: BitstreamStats::default() };
        s.stats.transitions = s.bits.iter().filter(|&&b| b).count();
        s.refresh_summary();
        s
    }

    /// Recompute `average_confidence` and `weak_count`.
    pub fn refresh_summary(&mut self) {
        self.stats.weak_count = self.weak.iter().filter(|&&w| w).count();
        self.stats.average_confidence = if self.confidence.is_empty() {
            0.0
        } else {
            (self.confidence.iter().map(|&c| c as f64).sum::<f64>() / self.confidence.len() as f64) as f32
        };
    }

    pub fn len(&self) -> usize { self.bits.len() }
    pub fn is_empty(&self) -> bool { self.bits.is_empty() }

    /// Whether bit `i` is trustworthy under `threshold`.
    pub fn is_suspect(&self, i: usize, threshold: f32) -> bool {
        self.weak.get(i).copied().unwrap_or(true)
            || self.confidence.get(i).map_or(true, |&c| c < threshold)
    }
}

// ── Loop ─────────────────────────────────────────────────────────────────────

struct LoopState {
    cell:   f64,
    carry:  f64,
    streak: usize,
    locked: bool,
}

/// Recover bits from one normalized revolution.
pub fn recover(rev: &NormalizedRevolution, cfg: &PllConfig) -> DecodedBitstream {
    recover_intervals(&rev.intervals_ns, Some(rev.index_ns), cfg)
}

/// Recover bits from raw nanosecond intervals.
pub fn recover_intervals(intervals_ns: &[f64], index_ns: Option<f64>, cfg: &PllConfig) -> DecodedBitstream {
    let (cell_min, cell_max) = cfg.cell_bounds();
    let gap_limit = 4.0 * cell_max;
    let kp = cfg.phase_gain();

    let expected_bits = intervals_ns.len() * 3;
    let mut bits       = Vec::with_capacity(expected_bits);
    let mut confidence = Vec::with_capacity(expected_bits);
    let mut weak       = Vec::with_capacity(expected_bits);

    let mut st = LoopState { cell: cfg.nominal_cell_ns, carry: 0.0, streak: 0, locked: false };
    let mut gaps = 0usize;
    let mut elapsed = 0.0f64;
    let mut index_bit = None;

    for &interval in intervals_ns {
        elapsed += interval;

        let (run, conf, is_weak) = if interval > gap_limit {
            gaps += 1;
            st.carry = 0.0;
            st.streak = 0;
            st.locked = false;
            let n = ((interval / st.cell).round() as usize).clamp(1, MAX_GAP_CELLS);
            (n, 0.0f32, true)
        } else {
            let adjusted = interval + st.carry;
            let exact = adjusted / st.cell;
            let rounded = (exact.round() as usize).max(1);
            let n = cfg.rejection.snap(rounded, exact);
            let err = adjusted - n as f64 * st.cell;
            let conf = (1.0 - err.abs() / (st.cell / 2.0)).clamp(0.0, 1.0) as f32;
            let is_weak = conf < cfg.weak_threshold;

            if is_weak {
                st.streak = 0;
                st.locked = false;
            } else {
                let ratio = if st.locked { cfg.slow_correction } else { cfg.fast_correction };
                st.cell = (st.cell + ratio * err / n as f64).clamp(cell_min, cell_max);
                st.streak += 1;
                if st.streak >= cfg.lock_runs {
                    st.locked = true;
                }
            }
            let half = st.cell / 2.0;
            st.carry = (err * (1.0 - kp)).clamp(-half, half);
            (n, conf, is_weak)
        };

        bits.extend(std::iter::repeat(false).take(run - 1));
        bits.push(true);
        confidence.extend(std::iter::repeat(conf).take(run));
        weak.extend(std::iter::repeat(is_weak).take(run));

        if index_bit.is_none() {
            if let Some(idx) = index_ns {
                if elapsed >= idx {
                    index_bit = Some(bits.len() - 1);
                }
            }
        }
    }

    let mut out = DecodedBitstream::from_parts(bits, confidence, weak);
    out.stats.transitions   = intervals_ns.len();
    out.stats.gap_count     = gaps;
    out.stats.final_cell_ns = st.cell;
    out.stats.index_bit     = index_bit;
    out
}
