//! Fan-out helpers: per-revolution bit recovery, per-sector correction and
//! whole-track batches.
//!
//! # Parallelism
//!
//! Each helper runs its items concurrently on Rayon's global pool when the
//! `parallel` feature is enabled and sequentially otherwise.  Items share no
//! mutable state: revolutions are decoded independently, and each sector
//! record is only ever touched by the task that owns it.
//!
//! # Cancellation
//!
//! The cancel token is checked once per item, before the item starts.  An
//! item that has started always runs to completion.

use std::sync::Arc;

use crate::codec::LineCode;
use crate::correct::{correct_from_revolutions, correct_sector, CorrectionOutcome, CorrectorConfig};
use crate::error::{DecodeError, Result};
use crate::flux::{FluxRevolution, NormalizedRevolution};
use crate::pipeline::{CancelToken, TrackDecoder, TrackRequest, TrackResult};
use crate::pll::{self, DecodedBitstream, PllConfig};
use crate::recovery::SectorRecord;

// ── Bit recovery ─────────────────────────────────────────────────────────────

/// Run the PLL over every revolution.  Output order matches input order.
pub fn recover_revolutions(
    revs:   &[NormalizedRevolution],
    cfg:    &PllConfig,
    cancel: &CancelToken,
) -> Result<Vec<Arc<DecodedBitstream>>> {
    let run = |rev: &NormalizedRevolution| -> Result<Arc<DecodedBitstream>> {
        cancel.check()?;
        Ok(Arc::new(pll::recover(rev, cfg)))
    };

    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;
        revs.par_iter().map(run).collect()
    }

    #[cfg(not(feature = "parallel"))]
    {
        revs.iter().map(run).collect()
    }
}

// ── Correction ───────────────────────────────────────────────────────────────

/// Shared inputs for correcting the sectors of one track.
pub struct CorrectionContext<'a> {
    pub fused:   &'a DecodedBitstream,
    pub revs:    &'a [Arc<DecodedBitstream>],
    pub offsets: &'a [Option<isize>],
    pub code:    &'a dyn LineCode,
    pub cfg:     &'a CorrectorConfig,
}

impl CorrectionContext<'_> {
    /// Bit-flip search first, then the per-revolution fallback.
    pub fn correct(&self, record: &mut SectorRecord) -> CorrectionOutcome {
        let outcome = correct_sector(record, self.fused, self.code, self.cfg);
        if !matches!(outcome, CorrectionOutcome::Exhausted { .. }) || self.revs.len() < 2 {
            return outcome;
        }
        let fault = record.fault.take();
        match correct_from_revolutions(record, self.revs, self.offsets, self.code) {
            Some(recovered) => recovered,
            None => {
                record.fault = fault;
                outcome
            }
        }
    }
}

/// Correct every failing sector.  Good sectors are left alone.
pub fn correct_sectors(
    sectors: &mut [SectorRecord],
    ctx:     &CorrectionContext<'_>,
    cancel:  &CancelToken,
) -> Result<Vec<CorrectionOutcome>> {
    let run = |record: &mut SectorRecord| -> Result<CorrectionOutcome> {
        if record.crc_ok {
            return Ok(CorrectionOutcome::AlreadyGood);
        }
        cancel.check()?;
        Ok(ctx.correct(record))
    };

    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;
        sectors.par_iter_mut().map(run).collect()
    }

    #[cfg(not(feature = "parallel"))]
    {
        sectors.iter_mut().map(run).collect()
    }
}

// ── Track batches ────────────────────────────────────────────────────────────

/// One track's worth of input for [`decode_tracks`].
pub struct TrackJob {
    pub revolutions: Vec<FluxRevolution>,
    pub request:     TrackRequest,
}

/// Decode many tracks with one decoder.  Per-track failures stay per-track.
pub fn decode_tracks(decoder: &TrackDecoder, jobs: &[TrackJob]) -> Vec<Result<TrackResult>> {
    let run = |job: &TrackJob| -> Result<TrackResult> {
        if decoder.is_cancelled() {
            return Err(DecodeError::Cancelled);
        }
        decoder.decode(&job.revolutions, &job.request)
    };

    #[cfg(feature = "parallel")]
    {
        use rayon::prelude::*;
        jobs.par_iter().map(run).collect()
    }

    #[cfg(not(feature = "parallel"))]
    {
        jobs.iter().map(run).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revolutions_keep_input_order() {
        let revs: Vec<NormalizedRevolution> = [4000.0, 6000.0]
            .iter()
            .map(|&ns| NormalizedRevolution { intervals_ns: vec![ns; 100], index_ns: 0.0, duration_ns: ns * 100.0 })
            .collect();
        let out = recover_revolutions(&revs, &PllConfig::new(2000.0), &CancelToken::new()).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].len(), 200);
        assert_eq!(out[1].len(), 300);
    }

    #[test]
    fn cancelled_before_start() {
        let revs = vec![NormalizedRevolution { intervals_ns: vec![4000.0; 10], index_ns: 0.0, duration_ns: 4e4 }];
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = recover_revolutions(&revs, &PllConfig::new(2000.0), &cancel).unwrap_err();
        assert_eq!(err, DecodeError::Cancelled);
    }
}
