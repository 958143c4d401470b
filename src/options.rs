//! The single immutable options record that drives a track decode.
//!
//! # Presets
//!
//! | Preset | Revolutions | Fusion | Correction | Sync tolerance |
//! |--------|-------------|--------|------------|----------------|
//! | [`DecodeOptions::default`]  | 5  | consensus 0.7 | 8 bits  | 2 |
//! | [`DecodeOptions::paranoid`] | 16 | consensus 0.9 | 16 bits | 1 |
//! | [`DecodeOptions::fast`]     | 1  | off           | off     | 3 |
//!
//! Options are validated synchronously by [`DecodeOptions::validate`] before
//! any work starts; the pipeline never sees an out-of-range value.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{DecodeError, Result};

/// Hard ceiling on revolutions fused per track.
pub const MAX_REVOLUTIONS: usize = 16;
/// Hard ceiling on the corrector's total flipped-bit budget.
pub const MAX_CORRECTION_BITS: usize = 16;
/// Largest accepted Hamming tolerance for a 16-bit mark pattern.
pub const MAX_SYNC_TOLERANCE: u32 = 8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecodeOptions {
    // ── Pre-analysis ────────────────────────────────────────────────────────
    /// Intervals shorter than `min_cell_ratio × cell_time` count as spikes.
    pub min_cell_ratio:         f64,
    /// Intervals longer than `max_cell_ratio × cell_time` count as dropouts.
    pub max_cell_ratio:         f64,

    // ── PLL ─────────────────────────────────────────────────────────────────
    pub pll_bandwidth:          f64,
    pub pll_damping:            f64,
    /// Runs whose confidence falls below this are flagged weak.
    pub weak_threshold:         f32,

    // ── Fusion ──────────────────────────────────────────────────────────────
    pub enable_fusion:          bool,
    pub fusion_min_consensus:   f32,
    pub max_revolutions:        usize,

    // ── Sector recovery ─────────────────────────────────────────────────────
    pub sync_hamming_tolerance: u32,
    pub enable_correction:      bool,
    pub max_correction_bits:    usize,

    // ── Output ──────────────────────────────────────────────────────────────
    pub keep_raw_bits:          bool,
    pub keep_confidence:        bool,
    pub enable_audit:           bool,
}

impl Default for DecodeOptions {
    fn default() -> Self {
        Self {
            min_cell_ratio:         0.5,
            max_cell_ratio:         2.5,
            pll_bandwidth:          0.05,
            pll_damping:            0.707,
            weak_threshold:         0.5,
            enable_fusion:          true,
            fusion_min_consensus:   0.7,
            max_revolutions:        5,
            sync_hamming_tolerance: 2,
            enable_correction:      true,
            max_correction_bits:    8,
            keep_raw_bits:          false,
            keep_confidence:        false,
            enable_audit:           false,
        }
    }
}

impl DecodeOptions {
    /// Maximum revolutions, maximum correction budget, tightest consensus.
    pub fn paranoid() -> Self {
        Self {
            pll_bandwidth:          0.02,
            fusion_min_consensus:   0.9,
            max_revolutions:        MAX_REVOLUTIONS,
            sync_hamming_tolerance: 1,
            max_correction_bits:    MAX_CORRECTION_BITS,
            keep_raw_bits:          true,
            keep_confidence:        true,
            enable_audit:           true,
            ..Self::default()
        }
    }

    /// Single revolution, no correction, coarse sync tolerance.
    pub fn fast() -> Self {
        Self {
            pll_bandwidth:          0.1,
            enable_fusion:          false,
            max_revolutions:        1,
            sync_hamming_tolerance: 3,
            enable_correction:      false,
            ..Self::default()
        }
    }

    /// Resolve a preset by its CLI name.
    pub fn preset(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "default"  => Some(Self::default()),
            "paranoid" => Some(Self::paranoid()),
            "fast"     => Some(Self::fast()),
            _          => None,
        }
    }

    /// Reject malformed configuration before any work is done.
    pub fn validate(&self) -> Result<()> {
        let bad = |msg: String| Err(DecodeError::InvalidConfiguration(msg));

        if self.max_revolutions < 1 || self.max_revolutions > MAX_REVOLUTIONS {
            return bad(format!(
                "max_revolutions must be within 1..={MAX_REVOLUTIONS}, got {}",
                self.max_revolutions
            ));
        }
        if !(0.0..=1.0).contains(&self.fusion_min_consensus) {
            return bad(format!(
                "fusion_min_consensus must be within [0, 1], got {}",
                self.fusion_min_consensus
            ));
        }
        if !(0.0..=1.0).contains(&self.weak_threshold) {
            return bad(format!("weak_threshold must be within [0, 1], got {}", self.weak_threshold));
        }
        if !(self.min_cell_ratio > 0.0 && self.min_cell_ratio < self.max_cell_ratio) {
            return bad(format!(
                "cell ratio bounds must satisfy 0 < min < max, got {} / {}",
                self.min_cell_ratio, self.max_cell_ratio
            ));
        }
        if !(self.pll_bandwidth > 0.0 && self.pll_bandwidth <= 1.0) {
            return bad(format!("pll_bandwidth must be within (0, 1], got {}", self.pll_bandwidth));
        }
        if !(self.pll_damping > 0.0) || !self.pll_damping.is_finite() {
            return bad(format!("pll_damping must be positive, got {}", self.pll_damping));
        }
        if self.sync_hamming_tolerance > MAX_SYNC_TOLERANCE {
            return bad(format!(
                "sync_hamming_tolerance must be at most {MAX_SYNC_TOLERANCE}, got {}",
                self.sync_hamming_tolerance
            ));
        }
        if self.max_correction_bits > MAX_CORRECTION_BITS {
            return bad(format!(
                "max_correction_bits must be at most {MAX_CORRECTION_BITS}, got {}",
                self.max_correction_bits
            ));
        }
        Ok(())
    }

    /// Revolutions the pipeline will actually use out of `available`.
    pub fn revolutions_to_use(&self, available: usize) -> usize {
        let cap = if self.enable_fusion { self.max_revolutions } else { 1 };
        available.min(cap)
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        let opts: Self = serde_json::from_str(s)
            .map_err(|e| DecodeError::InvalidConfiguration(e.to_string()))?;
        opts.validate()?;
        Ok(opts)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            DecodeError::InvalidConfiguration(format!("{}: {e}", path.display()))
        })?;
        Self::from_json_str(&text)
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets_validate() {
        DecodeOptions::default().validate().unwrap();
        DecodeOptions::paranoid().validate().unwrap();
        DecodeOptions::fast().validate().unwrap();
    }

    #[test]
    fn paranoid_is_strictest() {
        let d = DecodeOptions::default();
        let p = DecodeOptions::paranoid();
        assert_eq!(p.max_revolutions, MAX_REVOLUTIONS);
        assert_eq!(p.max_correction_bits, MAX_CORRECTION_BITS);
        assert!(p.fusion_min_consensus > d.fusion_min_consensus);
    }

    #[test]
    fn fast_uses_one_revolution() {
        let f = DecodeOptions::fast();
        assert_eq!(f.revolutions_to_use(8), 1);
        assert!(!f.enable_correction);
        assert!(f.sync_hamming_tolerance > DecodeOptions::default().sync_hamming_tolerance);
    }

    #[test]
    fn rejects_zero_revolutions() {
        let opts = DecodeOptions { max_revolutions: 0, ..Default::default() };
        assert!(matches!(opts.validate(), Err(DecodeError::InvalidConfiguration(_))));
    }

    #[test]
    fn rejects_consensus_out_of_range() {
        let opts = DecodeOptions { fusion_min_consensus: 1.5, ..Default::default() };
        assert!(matches!(opts.validate(), Err(DecodeError::InvalidConfiguration(_))));
        let opts = DecodeOptions { fusion_min_consensus: -0.1, ..Default::default() };
        assert!(matches!(opts.validate(), Err(DecodeError::InvalidConfiguration(_))));
    }

    #[test]
    fn rejects_inverted_cell_ratios() {
        let opts = DecodeOptions { min_cell_ratio: 3.0, max_cell_ratio: 2.0, ..Default::default() };
        assert!(opts.validate().is_err());
    }

    #[test]
    fn json_roundtrip_and_partial_fields() {
        let json = DecodeOptions::paranoid().to_json();
        assert_eq!(DecodeOptions::from_json_str(&json).unwrap(), DecodeOptions::paranoid());

        let partial = DecodeOptions::from_json_str(r#"{ "max_revolutions": 3 }"#).unwrap();
        assert_eq!(partial.max_revolutions, 3);
        assert_eq!(partial.sync_hamming_tolerance, 2);

        assert!(DecodeOptions::from_json_str(r#"{ "max_revolutions": 40 }"#).is_err());
    }

    #[test]
    fn preset_lookup_by_name() {
        assert_eq!(DecodeOptions::preset("FAST"), Some(DecodeOptions::fast()));
        assert!(DecodeOptions::preset("turbo").is_none());
    }
}
