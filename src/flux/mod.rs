//! Flux capture model and normalization.
//!
//! A [`FluxRevolution`] is exactly what the capture hardware hands over: one
//! rotation's worth of transition intervals in sample-clock ticks.  Everything
//! downstream of the bitrate estimator works in nanoseconds, so each used
//! revolution is converted once into a [`NormalizedRevolution`].
//!
//! [`PreAnalysis`] is a cheap statistical pass over the normalized intervals
//! that flags spikes (intervals far shorter than a cell) and dropouts
//! (intervals far longer than the longest legal run) and rates the capture.

pub mod histogram;

use serde::{Deserialize, Serialize};

use crate::error::{DecodeError, Result};

// ── Raw capture ──────────────────────────────────────────────────────────────

/// One revolution of captured flux.  Every interval is strictly positive.
#[derive(Debug, Clone, PartialEq)]
pub struct FluxRevolution {
    intervals:    Vec<u32>,
    tick_hz:      f64,
    index_offset: u64,
    duration:     u64,
}

impl FluxRevolution {
    pub fn new(intervals: Vec<u32>, tick_hz: f64) -> Result<Self> {
        if !(tick_hz.is_finite() && tick_hz > 0.0) {
            return Err(DecodeError::MalformedCapture(format!("tick frequency {tick_hz} is not positive")));
        }
        if let Some(pos) = intervals.iter().position(|&t| t == 0) {
            return Err(DecodeError::MalformedCapture(format!("zero-length interval at position {pos}")));
        }
        let duration = intervals.iter().map(|&t| t as u64).sum();
        Ok(Self { intervals, tick_hz, index_offset: 0, duration })
    }

    /// Tick offset of the index pulse from the start of the revolution.
    pub fn with_index_offset(mut self, ticks: u64) -> Self {
        self.index_offset = ticks;
        self
    }

    pub fn intervals(&self) -> &[u32] { &self.intervals }
    pub fn tick_hz(&self) -> f64 { self.tick_hz }
    pub fn index_offset(&self) -> u64 { self.index_offset }
    /// Revolution duration in ticks.
    pub fn duration(&self) -> u64 { self.duration }
    pub fn len(&self) -> usize { self.intervals.len() }
    pub fn is_empty(&self) -> bool { self.intervals.is_empty() }

    pub fn ns_per_tick(&self) -> f64 {
        1e9 / self.tick_hz
    }

    /// Convert to the nanosecond domain.
    pub fn normalize(&self) -> NormalizedRevolution {
        let scale = self.ns_per_tick();
        NormalizedRevolution {
            intervals_ns: self.intervals.iter().map(|&t| t as f64 * scale).collect(),
            index_ns:     self.index_offset as f64 * scale,
            duration_ns:  self.duration as f64 * scale,
        }
    }
}

/// A revolution in the nanosecond domain.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRevolution {
    pub intervals_ns: Vec<f64>,
    pub index_ns:     f64,
    pub duration_ns:  f64,
}

impl NormalizedRevolution {
    pub fn rpm(&self) -> f64 {
        if self.duration_ns <= 0.0 { 0.0 } else { 60e9 / self.duration_ns }
    }
}

// ── Pre-analysis ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PreAnalysis {
    pub transitions:    usize,
    pub min_ns:         f64,
    pub max_ns:         f64,
    pub mean_ns:        f64,
    pub stddev_ns:      f64,
    /// Average across revolutions.
    pub rpm:            f64,
    pub spike_count:    usize,
    pub dropout_count:  usize,
    pub anomaly_count:  usize,
    /// 1.0 is a textbook capture, 0.0 is noise.
    pub quality:        f64,
}

impl PreAnalysis {
    /// Spikes are intervals below `min_ratio × cell_ns`, dropouts are above
    /// `max_ratio × cell_ns`, where `cell_ns` is the first histogram peak.
    pub fn compute(revs: &[NormalizedRevolution], cell_ns: f64, min_ratio: f64, max_ratio: f64) -> Self {
        let transitions: usize = revs.iter().map(|r| r.intervals_ns.len()).sum();
        if transitions == 0 {
            return Self::default();
        }

        let spike_limit   = cell_ns * min_ratio;
        let dropout_limit = cell_ns * max_ratio;

        let mut min   = f64::INFINITY;
        let mut max   = 0.0f64;
        let mut sum   = 0.0;
        let mut sum2  = 0.0;
        let mut spikes   = 0;
        let mut dropouts = 0;
        for &ns in revs.iter().flat_map(|r| r.intervals_ns.iter()) {
            min = min.min(ns);
            max = max.max(ns);
            sum += ns;
            sum2 += ns * ns;
            if ns < spike_limit { spikes += 1; }
            if ns > dropout_limit { dropouts += 1; }
        }

        let n    = transitions as f64;
        let mean = sum / n;
        let var  = (sum2 / n - mean * mean).max(0.0);
        let stddev = var.sqrt();
        let cv = if mean > 0.0 { stddev / mean } else { 0.0 };
        let anomalies = spikes + dropouts;
        let anomaly_rate = anomalies as f64 / n;
        let quality = (1.0 - (anomaly_rate * 10.0 + cv * 2.0).min(1.0)).clamp(0.0, 1.0);
        let spinning: Vec<f64> = revs
            .iter()
            .filter(|r| !r.intervals_ns.is_empty())
            .map(NormalizedRevolution::rpm)
            .collect();
        let rpm = spinning.iter().sum::<f64>() / spinning.len() as f64;

        Self {
            transitions,
            min_ns:        min,
            max_ns:        max,
            mean_ns:       mean,
            stddev_ns:     stddev,
            rpm,
            spike_count:   spikes,
            dropout_count: dropouts,
            anomaly_count: anomalies,
            quality,
        }
    }
}
