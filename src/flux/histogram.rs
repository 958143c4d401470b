//! Interval histogram and bitrate estimation.
//!
//! Every interval of every used revolution is dropped into one of 65 536
//! tick-wide buckets.  The nominal cell time is taken from the *first*
//! dominant peak: later peaks are multiples of it and are often taller.
//!
//! A bucket clears the noise floor when it holds more than 2 % of the
//! tallest bucket.  Runs of clearing buckets separated by at most two quiet
//! buckets are one peak.  A run is noise rather than a peak when it is wider
//! than 60 % of its own position or holds under 2 % of all samples, so
//! scattered one-off intervals never pass for a signal however few samples
//! the histogram holds.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::codec::Encoding;
use crate::error::{DecodeError, Result};
use crate::flux::FluxRevolution;

pub const BUCKETS: usize = 65_536;
const FLOOR_FRACTION:  f64 = 0.02;
const MIN_PEAK_SHARE:  f64 = 0.02;
const MERGE_GAP:       usize = 2;
const MAX_PEAK_SPREAD: f64 = 0.6;

// ── Density class ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DensityClass {
    Dd250,
    Dd300,
    Hd500,
    Ed1000,
}

impl DensityClass {
    pub const ALL: [DensityClass; 4] =
        [DensityClass::Dd250, DensityClass::Dd300, DensityClass::Hd500, DensityClass::Ed1000];

    pub fn bits_per_second(self) -> f64 {
        match self {
            DensityClass::Dd250  => 250_000.0,
            DensityClass::Dd300  => 300_000.0,
            DensityClass::Hd500  => 500_000.0,
            DensityClass::Ed1000 => 1_000_000.0,
        }
    }

    /// Nearest class to a measured rate.
    pub fn classify(rate: f64) -> Self {
        let mut best = DensityClass::Dd250;
        let mut best_d = f64::INFINITY;
        for class in Self::ALL {
            let d = (class.bits_per_second() - rate).abs();
            if d < best_d {
                best = class;
                best_d = d;
            }
        }
        best
    }
}

// ── Histogram ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Peak {
    /// Bucket with the most samples.
    pub centre:   usize,
    /// Sample-weighted mean of the run, in ticks.
    pub centroid: f64,
    pub count:    u64,
    pub low:      usize,
    pub high:     usize,
}

pub struct Histogram {
    buckets:  Vec<u32>,
    total:    u64,
    overflow: u64,
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

impl Histogram {
    pub fn new() -> Self {
        Self { buckets: vec![0; BUCKETS], total: 0, overflow: 0 }
    }

    pub fn from_revolutions(revs: &[FluxRevolution]) -> Self {
        let mut h = Self::new();
        for rev in revs {
            h.extend(rev.intervals());
        }
        h
    }

    pub fn add(&mut self, ticks: u32) {
        self.total += 1;
        match self.buckets.get_mut(ticks as usize) {
            Some(b) => *b = b.saturating_add(1),
            None    => self.overflow += 1,
        }
    }

    pub fn extend(&mut self, ticks: &[u32]) {
        for &t in ticks {
            self.add(t);
        }
    }

    pub fn total(&self) -> u64 { self.total }
    pub fn overflow(&self) -> u64 { self.overflow }
    pub fn count(&self, bucket: usize) -> u32 {
        self.buckets.get(bucket).copied().unwrap_or(0)
    }

    pub fn noise_floor(&self) -> u32 {
        let max = self.buckets.iter().copied().max().unwrap_or(0);
        (max as f64 * FLOOR_FRACTION) as u32
    }

    /// Peaks in increasing tick order.
    pub fn peaks(&self) -> Vec<Peak> {
        let floor = self.noise_floor();
        let mut runs: Vec<(usize, usize)> = Vec::new();
        for (i, &c) in self.buckets.iter().enumerate() {
            if c <= floor {
                continue;
            }
            match runs.last_mut() {
                Some((_, high)) if i - *high <= MERGE_GAP + 1 => *high = i,
                _ => runs.push((i, i)),
            }
        }

        runs.into_iter()
            .filter_map(|(low, high)| {
                let mut count = 0u64;
                let mut weighted = 0.0;
                let mut centre = low;
                for b in low..=high {
                    let c = self.buckets[b];
                    count += c as u64;
                    weighted += b as f64 * c as f64;
                    if c > self.buckets[centre] {
                        centre = b;
                    }
                }
                let spread = (high - low) as f64;
                if spread > (centre as f64 * MAX_PEAK_SPREAD).max(4.0) {
                    return None;
                }
                if (count as f64) < self.total as f64 * MIN_PEAK_SHARE {
                    return None;
                }
                Some(Peak { centre, centroid: weighted / count as f64, count, low, high })
            })
            .collect()
    }
}

// ── Estimation ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BitrateEstimate {
    /// Shortest dominant interval, in ticks.
    pub cell_ticks:   f64,
    /// Shortest dominant interval, in nanoseconds.
    pub cell_time_ns: f64,
    pub density:      DensityClass,
    /// Line code suggested by the peak spacing.
    pub encoding:     Encoding,
    pub peaks:        Vec<Peak>,
    pub samples:      u64,
    pub overflow:     u64,
}

impl BitrateEstimate {
    pub fn data_rate(&self) -> f64 {
        1e9 / self.cell_time_ns
    }
}

/// Estimate the nominal cell time of a track.
///
/// All revolutions must share one tick frequency.
pub fn estimate(revs: &[FluxRevolution]) -> Result<BitrateEstimate> {
    let tick_hz = match revs.first() {
        Some(r) => r.tick_hz(),
        None    => return Err(DecodeError::EmptyCapture),
    };
    if revs.iter().any(|r| (r.tick_hz() - tick_hz).abs() > f64::EPSILON * tick_hz) {
        return Err(DecodeError::MalformedCapture("revolutions use different tick frequencies".into()));
    }

    let hist = Histogram::from_revolutions(revs);
    estimate_from_histogram(&hist, tick_hz)
}

pub fn estimate_from_histogram(hist: &Histogram, tick_hz: f64) -> Result<BitrateEstimate> {
    let peaks = hist.peaks();
    let first = match peaks.first() {
        Some(p) => *p,
        None    => return Err(DecodeError::InsufficientSignal { samples: hist.total() as usize }),
    };

    let cell_ticks   = first.centroid;
    let cell_time_ns = cell_ticks * 1e9 / tick_hz;
    let density      = DensityClass::classify(1e9 / cell_time_ns);
    let encoding     = detect_encoding(&peaks);

    debug!(
        cell_ticks,
        cell_time_ns,
        ?density,
        ?encoding,
        peaks = peaks.len(),
        "bitrate estimated"
    );

    Ok(BitrateEstimate {
        cell_ticks,
        cell_time_ns,
        density,
        encoding,
        peaks,
        samples:  hist.total(),
        overflow: hist.overflow(),
    })
}

/// Guess the line code from peak spacing: MFM runs are 2/3/4 cells, FM runs
/// 1/2 cells and Commodore GCR runs 1/2/3 cells.
pub fn detect_encoding(peaks: &[Peak]) -> Encoding {
    let (p1, p2) = match peaks {
        [a, b, ..] => (a.centroid, b.centroid),
        _ => return Encoding::Mfm,
    };
    let r2 = p2 / p1;
    if (r2 - 1.5).abs() < 0.2 {
        return Encoding::Mfm;
    }
    if (r2 - 2.0).abs() < 0.25 {
        let has_triple = peaks.get(2).map_or(false, |p| (p.centroid / p1 - 3.0).abs() < 0.3);
        return if has_triple { Encoding::Gcr } else { Encoding::Fm };
    }
    Encoding::Mfm
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rev(ticks: Vec<u32>) -> FluxRevolution {
        FluxRevolution::new(ticks, 72e6).unwrap()
    }

    fn mfm_like() -> Vec<u32> {
        let mut v = Vec::new();
        for i in 0..3000u32 {
            let base = [288, 432, 576][(i % 3) as usize];
            v.push(base + (i % 5) - 2);
        }
        v
    }

    #[test]
    fn single_clean_peak() {
        let est = estimate(&[rev(vec![300; 1000])]).unwrap();
        assert!((est.cell_ticks - 300.0).abs() <= 1.0);
        assert_eq!(est.peaks.len(), 1);
    }

    #[test]
    fn first_peak_wins_over_taller_harmonic() {
        let mut v = vec![288; 100];
        v.extend(vec![576; 2000]);
        let est = estimate(&[rev(v)]).unwrap();
        assert!((est.cell_ticks - 288.0).abs() <= 1.0);
    }

    #[test]
    fn mfm_dd_classification() {
        let est = estimate(&[rev(mfm_like())]).unwrap();
        assert!((est.cell_ticks - 288.0).abs() <= 1.0);
        assert!((est.cell_time_ns - 4000.0).abs() < 20.0);
        assert_eq!(est.density, DensityClass::Dd250);
        assert_eq!(est.encoding, Encoding::Mfm);
        assert_eq!(est.peaks.len(), 3);
    }

    #[test]
    fn fm_and_gcr_detection() {
        let fm: Vec<u32> = (0..2000).map(|i| if i % 2 == 0 { 200 } else { 400 }).collect();
        assert_eq!(estimate(&[rev(fm)]).unwrap().encoding, Encoding::Fm);

        let gcr: Vec<u32> = (0..3000).map(|i| [200, 400, 600][i % 3]).collect();
        assert_eq!(estimate(&[rev(gcr)]).unwrap().encoding, Encoding::Gcr);
    }

    #[test]
    fn flat_histogram_is_insufficient() {
        let flat: Vec<u32> = (1..4000).collect();
        let err = estimate(&[rev(flat)]).unwrap_err();
        assert!(matches!(err, DecodeError::InsufficientSignal { .. }));
    }

    #[test]
    fn wide_smear_is_not_a_peak() {
        let smear: Vec<u32> = (0..20_000).map(|i| 100 + (i % 900)).collect();
        assert!(matches!(estimate(&[rev(smear)]), Err(DecodeError::InsufficientSignal { .. })));
    }

    #[test]
    fn tiny_clean_peak_is_found() {
        let mut h = Histogram::new();
        for _ in 0..4 {
            h.add(300);
        }
        let est = estimate_from_histogram(&h, 72e6).unwrap();
        assert_eq!(est.cell_ticks, 300.0);

        let mut one = Histogram::new();
        one.add(812);
        assert_eq!(estimate_from_histogram(&one, 72e6).unwrap().cell_ticks, 812.0);
    }

    #[test]
    fn scattered_singles_are_insufficient() {
        let scatter: Vec<u32> = (0..400).map(|i| 100 + i * 37 % 5000).collect();
        assert!(matches!(estimate(&[rev(scatter)]), Err(DecodeError::InsufficientSignal { .. })));
    }

    #[test]
    fn overflow_counted() {
        let mut h = Histogram::new();
        h.add(70_000);
        h.add(10);
        assert_eq!(h.overflow(), 1);
        assert_eq!(h.total(), 2);
    }

    #[test]
    fn mixed_tick_rates_rejected() {
        let a = FluxRevolution::new(vec![100; 10], 24e6).unwrap();
        let b = FluxRevolution::new(vec![100; 10], 72e6).unwrap();
        assert!(matches!(estimate(&[a, b]), Err(DecodeError::MalformedCapture(_))));
    }

    #[test]
    fn density_nearest_match() {
        assert_eq!(DensityClass::classify(480_000.0), DensityClass::Hd500);
        assert_eq!(DensityClass::classify(290_000.0), DensityClass::Dd300);
        assert_eq!(DensityClass::classify(2_000_000.0), DensityClass::Ed1000);
    }
}
