//! Multi-revolution fusion.
//!
//! Revolution 0 is the reference timeline.  Every other revolution is first
//! aligned to it, then each reference position is voted on by the
//! revolutions that cover it.
//!
//! # Alignment
//!
//! When both the reference and a revolution carry a known sync position (the
//! first ID mark), their difference is tried first.  Otherwise, or when that
//! offset scores poorly, offsets are searched outward from zero
//! (`0, -1, +1, -2, +2, …`) over a probe window of the reference; the first
//! best score wins.  A revolution whose best score is below
//! [`FusionConfig::min_alignment_score`] is dropped with an
//! `AlignmentFailure`.
//!
//! # Voting
//!
//! | Output | Definition |
//! |--------|------------|
//! | bit | majority by count, ties by summed weight, then the reference |
//! | confidence | weighted majority fraction × mean confidence of the majority |
//! | consistency | fraction of contributor pairs that agree (1.0 for one contributor) |
//! | weak | consistency < `min_consensus`, or weak in every contributor |
//!
//! A contributor's weight is its bit confidence times its alignment score
//! when quality weighting is on, 1.0 otherwise.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::DecodeError;
use crate::pll::DecodedBitstream;

// ── Configuration ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FusionConfig {
    pub min_consensus:       f32,
    pub quality_weighting:   bool,
    pub probe_bits:          usize,
    pub min_alignment_score: f64,
    /// Search range as a fraction of the reference length.
    pub search_fraction:     f64,
    pub min_search:          usize,
    pub max_search:          usize,
    /// Relative length difference above which a revolution is flagged.
    pub length_tolerance:    f64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            min_consensus:       0.7,
            quality_weighting:   true,
            probe_bits:          1024,
            min_alignment_score: 0.7,
            search_fraction:     0.05,
            min_search:          100,
            max_search:          1000,
            length_tolerance:    0.10,
        }
    }
}

impl FusionConfig {
    pub fn with_min_consensus(mut self, min_consensus: f32) -> Self {
        self.min_consensus = min_consensus;
        self
    }

    fn search_range(&self, reference_len: usize) -> usize {
        ((reference_len as f64 * self.search_fraction) as usize).clamp(self.min_search, self.max_search)
    }
}

// ── Output ───────────────────────────────────────────────────────────────────

/// How one revolution fared during alignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevolutionReport {
    pub index:           usize,
    /// Position in this revolution of reference bit 0.
    pub offset:          isize,
    pub score:           f64,
    pub length_bits:     usize,
    pub length_mismatch: bool,
    pub used:            bool,
    pub fault:           Option<DecodeError>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FusionResult {
    pub stream:           DecodedBitstream,
    /// Per-position pairwise agreement.
    pub consistency:      Vec<f32>,
    pub revolutions_used: usize,
    pub alignments:       Vec<RevolutionReport>,
    /// Positions where at least two contributors disagreed.
    pub disagreements:    usize,
}

impl FusionResult {
    pub fn weak_count(&self) -> usize {
        self.stream.stats.weak_count
    }

    /// Offset of every used revolution, indexed like the input.
    pub fn offsets(&self) -> Vec<Option<isize>> {
        self.alignments.iter().map(|a| a.used.then_some(a.offset)).collect()
    }
}

// ── Alignment ────────────────────────────────────────────────────────────────

/// Agreement between `reference[p]` and `rev[p + offset]` over the probe.
fn score_at(reference: &[bool], rev: &[bool], probe: std::ops::Range<usize>, offset: isize) -> f64 {
    let mut compared = 0usize;
    let mut matched = 0usize;
    for p in probe.clone() {
        let q = p as isize + offset;
        if q < 0 {
            continue;
        }
        match (reference.get(p), rev.get(q as usize)) {
            (Some(a), Some(b)) => {
                compared += 1;
                if a == b {
                    matched += 1;
                }
            }
            _ => {}
        }
    }
    if compared * 2 < probe.len() || compared == 0 {
        0.0
    } else {
        matched as f64 / compared as f64
    }
}

/// Best offset of `rev` against `reference`, trying the hint first.
pub fn align(reference: &[bool], rev: &[bool], hint: Option<isize>, cfg: &FusionConfig) -> (isize, f64) {
    let search = cfg.search_range(reference.len()) as isize;
    let probe_len = cfg.probe_bits.min(reference.len());
    let probe_start = (search as usize).min(reference.len() - probe_len);
    let probe = probe_start..probe_start + probe_len;

    if let Some(h) = hint {
        let s = score_at(reference, rev, probe.clone(), h);
        if s >= cfg.min_alignment_score {
            return (h, s);
        }
    }

    let mut best = (0isize, score_at(reference, rev, probe.clone(), 0));
    for k in 1..=search {
        if best.1 >= 1.0 {
            break;
        }
        for off in [-k, k] {
            let s = score_at(reference, rev, probe.clone(), off);
            if s > best.1 {
                best = (off, s);
            }
        }
    }
    best
}

// ── Fusion ───────────────────────────────────────────────────────────────────

struct Contributor<'a> {
    stream: &'a DecodedBitstream,
    offset: isize,
    score:  f64,
}

fn pairs(n: usize) -> f64 {
    (n * n.saturating_sub(1) / 2) as f64
}

/// Fuse revolutions of one track.
///
/// `hints[i]` is the known sync position inside revolution `i`, if any.
/// The first revolution that recovered any bits is the reference timeline.
/// Empty revolutions are reported as unused and never vote.
pub fn fuse(revs: &[Arc<DecodedBitstream>], hints: &[Option<usize>], cfg: &FusionConfig) -> FusionResult {
    if revs.is_empty() {
        return FusionResult {
            stream:           DecodedBitstream::default(),
            consistency:      Vec::new(),
            revolutions_used: 0,
            alignments:       Vec::new(),
            disagreements:    0,
        };
    }
    let ref_index = revs.iter().position(|r| !r.is_empty()).unwrap_or(0);
    let reference = &revs[ref_index];
    let ref_len = reference.len();
    let ref_hint = hints.get(ref_index).copied().flatten();

    let mut alignments = Vec::with_capacity(revs.len());
    let mut contributors = vec![Contributor { stream: reference, offset: 0, score: 1.0 }];

    for (index, rev) in revs.iter().enumerate() {
        if index == ref_index {
            alignments.push(RevolutionReport {
                index,
                offset:          0,
                score:           1.0,
                length_bits:     ref_len,
                length_mismatch: false,
                used:            true,
                fault:           None,
            });
            continue;
        }
        if rev.is_empty() {
            warn!(revolution = index, "revolution dropped: no bits recovered");
            alignments.push(RevolutionReport {
                index,
                offset:          0,
                score:           0.0,
                length_bits:     0,
                length_mismatch: ref_len > 0,
                used:            false,
                fault:           Some(DecodeError::AlignmentFailure { revolution: index, offset: 0, score: 0.0 }),
            });
            continue;
        }

        let hint = match (ref_hint, hints.get(index).copied().flatten()) {
            (Some(r), Some(h)) => Some(h as isize - r as isize),
            _ => None,
        };
        let (offset, score) = align(&reference.bits, &rev.bits, hint, cfg);
        let length_mismatch =
            (rev.len() as f64 - ref_len as f64).abs() / ref_len as f64 > cfg.length_tolerance;
        let used = score >= cfg.min_alignment_score;
        let fault = if used {
            debug!(revolution = index, offset, score, "revolution aligned");
            None
        } else {
            warn!(revolution = index, offset, score, "revolution dropped: alignment failed");
            Some(DecodeError::AlignmentFailure { revolution: index, offset, score })
        };
        if length_mismatch {
            debug!(revolution = index, len = rev.len(), ref_len, "revolution length differs from reference");
        }
        if used {
            contributors.push(Contributor { stream: rev, offset, score });
        }
        alignments.push(RevolutionReport {
            index,
            offset,
            score,
            length_bits: rev.len(),
            length_mismatch,
            used,
            fault,
        });
    }

    if contributors.len() == 1 {
        return FusionResult {
            stream:           (**reference).clone(),
            consistency:      vec![1.0; ref_len],
            revolutions_used: 1,
            alignments,
            disagreements:    0,
        };
    }

    let mut bits        = Vec::with_capacity(ref_len);
    let mut confidence  = Vec::with_capacity(ref_len);
    let mut weak        = Vec::with_capacity(ref_len);
    let mut consistency = Vec::with_capacity(ref_len);
    let mut disagreements = 0usize;

    for p in 0..ref_len {
        let mut n = 0usize;
        let mut ones = 0usize;
        let mut all_weak = true;
        let mut w = [0.0f64; 2];
        let mut conf_sum = [0.0f64; 2];

        for c in &contributors {
            let q = p as isize + c.offset;
            if q < 0 || q as usize >= c.stream.len() {
                continue;
            }
            let q = q as usize;
            let bit = c.stream.bits[q];
            let conf = c.stream.confidence[q] as f64;
            let weight = if cfg.quality_weighting { conf * c.score } else { 1.0 };
            n += 1;
            ones += bit as usize;
            all_weak &= c.stream.weak[q];
            w[bit as usize] += weight;
            conf_sum[bit as usize] += conf;
        }

        let zeros = n - ones;
        let value = if ones != zeros {
            ones > zeros
        } else if w[1] != w[0] {
            w[1] > w[0]
        } else {
            reference.bits[p]
        };
        let agree = if value { ones } else { zeros };
        let idx = value as usize;

        let fraction = if cfg.quality_weighting && w[0] + w[1] > 0.0 {
            w[idx] / (w[0] + w[1])
        } else {
            agree as f64 / n as f64
        };
        let mean_conf = if agree > 0 { conf_sum[idx] / agree as f64 } else { 0.0 };
        let cons = if n <= 1 {
            1.0f32
        } else {
            ((pairs(ones) + pairs(zeros)) / pairs(n)) as f32
        };

        if ones > 0 && zeros > 0 {
            disagreements += 1;
        }
        bits.push(value);
        confidence.push((fraction * mean_conf) as f32);
        weak.push(cons < cfg.min_consensus || all_weak);
        consistency.push(cons);
    }

    let mut stream = DecodedBitstream::from_parts(bits, confidence, weak);
    stream.stats.index_bit     = reference.stats.index_bit;
    stream.stats.final_cell_ns = reference.stats.final_cell_ns;
    stream.stats.gap_count     = reference.stats.gap_count;

    debug!(
        revolutions = contributors.len(),
        disagreements,
        weak = stream.stats.weak_count,
        "fusion complete"
    );

    FusionResult {
        stream,
        consistency,
        revolutions_used: contributors.len(),
        alignments,
        disagreements,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pseudo_random_bits(n: usize, seed: u32) -> Vec<bool> {
        let mut x = seed.max(1);
        (0..n)
            .map(|_| {
                x ^= x << 13;
                x ^= x >> 17;
                x ^= x << 5;
                x & 1 == 1
            })
            .collect()
    }

    fn stream(bits: Vec<bool>) -> Arc<DecodedBitstream> {
        let n = bits.len();
        Arc::new(DecodedBitstream::from_parts(bits, vec![1.0; n], vec![false; n]))
    }

    #[test]
    fn single_revolution_passes_through() {
        let s = stream(pseudo_random_bits(3000, 7));
        let out = fuse(&[s.clone()], &[None], &FusionConfig::default());
        assert_eq!(out.stream, *s);
        assert_eq!(out.revolutions_used, 1);
        assert!(out.consistency.iter().all(|&c| c == 1.0));
    }

    #[test]
    fn identical_revolutions_fuse_to_input() {
        let s = stream(pseudo_random_bits(5000, 11));
        let revs = vec![s.clone(), s.clone(), s.clone(), s.clone()];
        let out = fuse(&revs, &[None; 4], &FusionConfig::default());
        assert_eq!(out.stream.bits, s.bits);
        assert_eq!(out.stream.confidence, s.confidence);
        assert_eq!(out.stream.weak, s.weak);
        assert!(out.consistency.iter().all(|&c| c == 1.0));
        assert_eq!(out.revolutions_used, 4);
        assert_eq!(out.disagreements, 0);
    }

    #[test]
    fn one_disagreement_is_one_weak_bit() {
        let n = 5;
        let base = pseudo_random_bits(4000, 3);
        let mut odd = base.clone();
        odd[2500] = !odd[2500];
        let mut revs = vec![stream(base.clone()); n - 1];
        revs.insert(2, stream(odd));

        let lo = (n - 2) as f32 / n as f32;
        let hi = (n - 1) as f32 / n as f32;
        let cfg = FusionConfig::default().with_min_consensus((lo + hi) / 2.0);
        let out = fuse(&revs, &[None; 5], &cfg);
        assert_eq!(out.weak_count(), 1);
        assert!(out.stream.weak[2500]);
        assert_eq!(out.stream.bits, base);
        assert_eq!(out.disagreements, 1);
        assert!((out.consistency[2500] - lo).abs() < 1e-6);
    }

    #[test]
    fn shifted_revolution_is_aligned_by_search() {
        let base = pseudo_random_bits(6000, 5);
        let shifted: Vec<bool> = pseudo_random_bits(37, 99).into_iter().chain(base.iter().copied()).collect();
        let revs = vec![stream(base.clone()), stream(shifted), stream(base.clone())];
        let out = fuse(&revs, &[None; 3], &FusionConfig::default());
        assert_eq!(out.alignments[1].offset, 37);
        assert!(out.alignments[1].used);
        assert_eq!(out.stream.bits, base);
        assert_eq!(out.weak_count(), 0);
    }

    #[test]
    fn hint_gives_offset_directly() {
        let base = pseudo_random_bits(6000, 21);
        let shifted: Vec<bool> = vec![false; 500].into_iter().chain(base.iter().copied()).collect();
        let (off, score) = align(&base, &shifted, Some(500), &FusionConfig::default());
        assert_eq!(off, 500);
        assert_eq!(score, 1.0);
    }

    #[test]
    fn unrelated_revolution_is_dropped() {
        let a = stream(pseudo_random_bits(4000, 1));
        let b = stream(pseudo_random_bits(4000, 2));
        let out = fuse(&[a.clone(), b, a.clone()], &[None; 3], &FusionConfig::default());
        assert_eq!(out.revolutions_used, 2);
        assert!(!out.alignments[1].used);
        assert!(matches!(out.alignments[1].fault, Some(DecodeError::AlignmentFailure { revolution: 1, .. })));
        assert_eq!(out.stream.bits, a.bits);
    }

    #[test]
    fn short_revolution_votes_only_where_it_covers() {
        let base = pseudo_random_bits(4000, 8);
        let short = stream(base[..3000].to_vec());
        let out = fuse(&[stream(base.clone()), short], &[None; 2], &FusionConfig::default());
        assert!(out.alignments[1].length_mismatch);
        assert_eq!(out.stream.len(), 4000);
        assert_eq!(out.stream.bits, base);
        assert!(out.consistency[3500] == 1.0);
    }

    #[test]
    fn empty_revolution_never_becomes_the_reference() {
        let base = pseudo_random_bits(4000, 13);
        let empty = Arc::new(DecodedBitstream::default());
        let revs = vec![empty.clone(), stream(base.clone()), empty, stream(base.clone())];
        let out = fuse(&revs, &[None; 4], &FusionConfig::default());
        assert_eq!(out.stream.bits, base);
        assert_eq!(out.revolutions_used, 2);
        assert_eq!(out.alignments.len(), 4);
        assert!(out.alignments[1].used && out.alignments[3].used);
        for i in [0, 2] {
            assert!(!out.alignments[i].used);
            assert_eq!(out.alignments[i].index, i);
            assert!(matches!(out.alignments[i].fault, Some(DecodeError::AlignmentFailure { revolution, .. }) if revolution == i));
        }
        assert_eq!(out.offsets(), vec![None, Some(0), None, Some(0)]);
    }

    #[test]
    fn weak_in_every_contributor_stays_weak() {
        let bits = pseudo_random_bits(2000, 4);
        let mut weak = vec![false; 2000];
        weak[100] = true;
        let s = Arc::new(DecodedBitstream::from_parts(bits.clone(), vec![0.9; 2000], weak));
        let out = fuse(&[s.clone(), s.clone(), s], &[None; 3], &FusionConfig::default());
        assert_eq!(out.weak_count(), 1);
        assert!(out.stream.weak[100]);
    }

    #[test]
    fn tie_goes_to_higher_weight() {
        let mut a = DecodedBitstream::from_parts(vec![true; 1200], vec![0.9; 1200], vec![false; 1200]);
        let mut b = a.clone();
        a.confidence[600] = 0.2;
        b.bits[600] = false;
        a.refresh_summary();
        b.refresh_summary();
        let out = fuse(&[Arc::new(a), Arc::new(b)], &[None; 2], &FusionConfig::default());
        assert!(!out.stream.bits[600]);
        assert!(out.stream.weak[600]);
    }
}
