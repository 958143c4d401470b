//! Track decoder: flux revolutions in, sector records out.
//!
//! # Stages
//!
//! | # | Stage | Output |
//! |---|-------|--------|
//! | 1 | Bitrate estimate | nominal cell time, density, suggested line code |
//! | 2 | Normalize + pre-analysis | ns intervals, anomaly statistics |
//! | 3 | PLL (per revolution, parallel) | one [`DecodedBitstream`] per revolution |
//! | 4 | Fusion | consensus stream with weak-bit map |
//! | 5 | Sector scan | [`SectorRecord`]s and `RecordNotFound` issues |
//! | 6 | Correction (per sector, parallel) | repaired records or `CrcMismatchUncorrectable` |
//!
//! Only a wholly empty capture, a malformed one, a failed bitrate estimate
//! without a fallback, or cancellation abort the track.  Everything else is
//! recorded in the [`TrackResult`] and decoding carries on.
//!
//! Each stage owns its output and hands it to the next stage by value or
//! behind an `Arc`; nothing is mutated after it has been handed on except
//! sector records, which only the corrector touches.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::codec::{get_line_code, Encoding, LineCode, MarkKind};
use crate::correct::{CorrectionOutcome, CorrectorConfig};
use crate::error::{DecodeError, Result};
use crate::flux::histogram::{self, BitrateEstimate};
use crate::flux::{FluxRevolution, NormalizedRevolution, PreAnalysis};
use crate::fusion::{fuse, FusionConfig, RevolutionReport};
use crate::options::DecodeOptions;
use crate::perf::{correct_sectors, recover_revolutions, CorrectionContext};
use crate::pll::{DecodedBitstream, InterBandRejection, PllConfig};
use crate::recovery::{scan_sectors, SectorRecord, TrackSummary};
use crate::session::DecodeSession;

// ── Cancellation ─────────────────────────────────────────────────────────────

/// Shared stop flag.  Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// `Err(Cancelled)` once the flag is set.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(DecodeError::Cancelled)
        } else {
            Ok(())
        }
    }
}

// ── Request / result ─────────────────────────────────────────────────────────

/// Which physical track is being decoded, plus optional overrides.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackRequest {
    pub cylinder:          u8,
    pub head:              u8,
    /// Forces a line code instead of the one suggested by the histogram.
    pub encoding:          Option<Encoding>,
    /// Shortest-interval time used when the histogram finds no peak.
    pub cell_time_hint_ns: Option<f64>,
    /// Run-length snapping for the PLL.  Off unless requested: Commodore GCR
    /// has legal 3-cell runs at the PLL's nominal cell.
    pub rejection:         Option<InterBandRejection>,
}

impl TrackRequest {
    pub fn new(cylinder: u8, head: u8) -> Self {
        Self { cylinder, head, encoding: None, cell_time_hint_ns: None, rejection: None }
    }

    pub fn with_encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = Some(encoding);
        self
    }

    pub fn with_cell_time_hint(mut self, ns: f64) -> Self {
        self.cell_time_hint_ns = Some(ns);
        self
    }

    pub fn with_rejection(mut self, rejection: InterBandRejection) -> Self {
        self.rejection = Some(rejection);
        self
    }
}

/// Everything known about one decoded track.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackResult {
    pub cylinder:     u8,
    pub head:         u8,
    pub encoding:     Encoding,
    /// Shortest-interval time the PLL was seeded from.
    pub cell_time_ns: f64,
    /// `None` when the caller's hint stood in for a failed estimate.
    pub bitrate:      Option<BitrateEstimate>,
    pub preanalysis:  PreAnalysis,
    pub revolutions:  Vec<RevolutionReport>,
    pub sectors:      Vec<SectorRecord>,
    pub issues:       Vec<DecodeError>,
    pub summary:      TrackSummary,
    /// Fused bits, when `keep_raw_bits` is set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fused_bits:   Option<Vec<bool>>,
    /// Fused confidence map, when `keep_confidence` is set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence:   Option<Vec<f32>>,
    /// BLAKE3 over the payloads of every verified sector, in track order.
    pub digest:       String,
}

impl TrackResult {
    /// Sector `n`, if recovered.
    pub fn sector(&self, n: u8) -> Option<&SectorRecord> {
        self.sectors.iter().find(|s| s.id.sector == n)
    }
}

// ── Decoder ──────────────────────────────────────────────────────────────────

/// Validated options plus optional session and cancel flag.  Decoding takes
/// `&self`, so one decoder can serve several tracks at once.
#[derive(Debug, Clone)]
pub struct TrackDecoder {
    options: DecodeOptions,
    session: Option<Arc<DecodeSession>>,
    cancel:  CancelToken,
}

impl TrackDecoder {
    pub fn new(options: DecodeOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self { options, session: None, cancel: CancelToken::new() })
    }

    pub fn with_session(mut self, session: Arc<DecodeSession>) -> Self {
        self.session = Some(session);
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn options(&self) -> &DecodeOptions {
        &self.options
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn pll_config(&self, cell_time_ns: f64, encoding: Encoding, request: &TrackRequest) -> PllConfig {
        PllConfig::new(cell_time_ns / encoding.shortest_run() as f64)
            .with_loop(self.options.pll_bandwidth, self.options.pll_damping)
            .with_weak_threshold(self.options.weak_threshold)
            .with_rejection(request.rejection.unwrap_or(InterBandRejection::None))
    }

    /// Decode one track from its captured revolutions.
    pub fn decode(&self, revs: &[FluxRevolution], request: &TrackRequest) -> Result<TrackResult> {
        let opts = &self.options;
        self.cancel.check()?;
        if revs.iter().all(FluxRevolution::is_empty) {
            return Err(DecodeError::EmptyCapture);
        }
        let revs = select_revolutions(revs, opts.revolutions_to_use(revs.iter().filter(|r| !r.is_empty()).count()));

        // ── Bitrate ─────────────────────────────────────────────────────────
        let bitrate = match histogram::estimate(revs) {
            Ok(b) => Some(b),
            Err(DecodeError::InsufficientSignal { samples }) if request.cell_time_hint_ns.is_some() => {
                warn!(samples, hint = ?request.cell_time_hint_ns, "no histogram peak, using cell time hint");
                None
            }
            Err(e) => return Err(e),
        };
        let cell_time_ns = match (&bitrate, request.cell_time_hint_ns) {
            (Some(b), _)     => b.cell_time_ns,
            (None, Some(ns)) if ns.is_finite() && ns > 0.0 => ns,
            (None, Some(ns)) => {
                return Err(DecodeError::InvalidConfiguration(format!("cell time hint {ns} ns is not positive")))
            }
            (None, None)     => return Err(DecodeError::InsufficientSignal { samples: 0 }),
        };
        let encoding = request
            .encoding
            .or_else(|| bitrate.as_ref().map(|b| b.encoding))
            .unwrap_or(Encoding::Mfm);
        let code = get_line_code(encoding);

        // ── Normalize ───────────────────────────────────────────────────────
        let normalized: Vec<NormalizedRevolution> = revs.iter().map(FluxRevolution::normalize).collect();
        let preanalysis =
            PreAnalysis::compute(&normalized, cell_time_ns, opts.min_cell_ratio, opts.max_cell_ratio);
        debug!(
            transitions = preanalysis.transitions,
            rpm = preanalysis.rpm,
            anomalies = preanalysis.anomaly_count,
            quality = preanalysis.quality,
            "pre-analysis done"
        );

        // ── PLL ─────────────────────────────────────────────────────────────
        let pll_cfg = self.pll_config(cell_time_ns, encoding, request);
        let streams = recover_revolutions(&normalized, &pll_cfg, &self.cancel)?;
        for (i, s) in streams.iter().enumerate() {
            debug!(
                revolution = i,
                bits = s.len(),
                avg_confidence = s.stats.average_confidence,
                weak = s.stats.weak_count,
                gaps = s.stats.gap_count,
                "revolution recovered"
            );
        }

        // ── Fusion ──────────────────────────────────────────────────────────
        self.cancel.check()?;
        let tolerance = opts.sync_hamming_tolerance;
        let hints: Vec<Option<usize>> = if streams.len() > 1 {
            streams.iter().map(|s| first_id_mark(s, code.as_ref(), tolerance)).collect()
        } else {
            Vec::new()
        };
        let fusion_cfg = FusionConfig::default().with_min_consensus(opts.fusion_min_consensus);
        let fusion = fuse(&streams, &hints, &fusion_cfg);
        let offsets = fusion.offsets();
        info!(
            cylinder = request.cylinder,
            head = request.head,
            %encoding,
            revolutions = fusion.revolutions_used,
            weak = fusion.weak_count(),
            disagreements = fusion.disagreements,
            "revolutions fused"
        );

        // ── Sectors ─────────────────────────────────────────────────────────
        self.cancel.check()?;
        let scan = scan_sectors(&fusion.stream, code.as_ref(), tolerance, request.cylinder, request.head);
        let mut sectors = scan.sectors;
        let issues = scan.issues;

        if opts.enable_correction && sectors.iter().any(|s| !s.crc_ok) {
            let corrector = CorrectorConfig::new(opts.max_correction_bits, opts.weak_threshold);
            let ctx = CorrectionContext {
                fused:   &fusion.stream,
                revs:    &streams,
                offsets: &offsets,
                code:    code.as_ref(),
                cfg:     &corrector,
            };
            let outcomes = correct_sectors(&mut sectors, &ctx, &self.cancel)?;
            log_outcomes(&sectors, &outcomes);
        }

        // ── Result ──────────────────────────────────────────────────────────
        let summary = TrackSummary::from_sectors(&sectors, &issues, fusion.weak_count());
        let digest = evidence_digest(&sectors);
        info!(cylinder = request.cylinder, head = request.head, "{summary}");

        let result = TrackResult {
            cylinder: request.cylinder,
            head: request.head,
            encoding,
            cell_time_ns,
            bitrate,
            preanalysis,
            revolutions: fusion.alignments,
            sectors,
            issues,
            summary,
            fused_bits: opts.keep_raw_bits.then(|| fusion.stream.bits.clone()),
            confidence: opts.keep_confidence.then(|| fusion.stream.confidence.clone()),
            digest,
        };
        if let Some(session) = &self.session {
            session.record_track(&result);
        }
        Ok(result)
    }
}

/// Shortest prefix of `revs` holding `limit` non-empty revolutions.  Empty
/// ones inside it are kept so reports stay indexed like the capture.
fn select_revolutions(revs: &[FluxRevolution], limit: usize) -> &[FluxRevolution] {
    let mut seen = 0usize;
    let end = revs
        .iter()
        .position(|r| {
            if !r.is_empty() {
                seen += 1;
            }
            seen > limit
        })
        .unwrap_or(revs.len());
    &revs[..end]
}

fn first_id_mark(stream: &DecodedBitstream, code: &dyn LineCode, tolerance: u32) -> Option<usize> {
    code.find_marks(&stream.bits, tolerance)
        .into_iter()
        .find(|h| h.kind == MarkKind::Id)
        .map(|h| h.sync_bit)
}

fn log_outcomes(sectors: &[SectorRecord], outcomes: &[CorrectionOutcome]) {
    for (record, outcome) in sectors.iter().zip(outcomes) {
        match outcome {
            CorrectionOutcome::AlreadyGood => {}
            CorrectionOutcome::Corrected { positions, iterations } => {
                info!(sector = %record.id, flipped = positions.len(), iterations, "sector corrected")
            }
            CorrectionOutcome::FromRevolution { revolution, changed_bits } => {
                info!(sector = %record.id, revolution, changed_bits, "sector recovered from single revolution")
            }
            CorrectionOutcome::Exhausted { candidates, iterations } => {
                warn!(sector = %record.id, candidates, iterations, "sector uncorrectable")
            }
        }
    }
}

/// Hex BLAKE3 over the payloads of every verified sector.
pub fn evidence_digest(sectors: &[SectorRecord]) -> String {
    let mut hasher = blake3::Hasher::new();
    for s in sectors.iter().filter(|s| s.is_good()) {
        hasher.update(&s.data);
    }
    hex::encode(hasher.finalize().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_is_shared() {
        let a = CancelToken::new();
        let b = a.clone();
        assert!(a.check().is_ok());
        b.cancel();
        assert_eq!(a.check(), Err(DecodeError::Cancelled));
    }

    #[test]
    fn invalid_options_rejected_up_front() {
        let opts = DecodeOptions { max_revolutions: 0, ..DecodeOptions::default() };
        assert!(matches!(TrackDecoder::new(opts), Err(DecodeError::InvalidConfiguration(_))));
    }

    #[test]
    fn empty_capture_is_fatal() {
        let decoder = TrackDecoder::new(DecodeOptions::default()).unwrap();
        let req = TrackRequest::new(0, 0);
        assert_eq!(decoder.decode(&[], &req).unwrap_err(), DecodeError::EmptyCapture);
        let empty = FluxRevolution::new(Vec::new(), 72e6).unwrap();
        assert_eq!(decoder.decode(&[empty], &req).unwrap_err(), DecodeError::EmptyCapture);
    }

    #[test]
    fn flat_histogram_without_hint_is_insufficient_signal() {
        let decoder = TrackDecoder::new(DecodeOptions::default()).unwrap();
        let ticks: Vec<u32> = (0..400).map(|i| 100 + i * 37 % 5000).collect();
        let rev = FluxRevolution::new(ticks, 72e6).unwrap();
        let err = decoder.decode(&[rev], &TrackRequest::new(0, 0)).unwrap_err();
        assert!(matches!(err, DecodeError::InsufficientSignal { .. }));
    }

    #[test]
    fn cancelled_decoder_does_no_work() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let decoder = TrackDecoder::new(DecodeOptions::default()).unwrap().with_cancel(cancel);
        let rev = FluxRevolution::new(vec![288; 100], 72e6).unwrap();
        assert_eq!(decoder.decode(&[rev], &TrackRequest::new(0, 0)).unwrap_err(), DecodeError::Cancelled);
    }

    #[test]
    fn pll_follows_options_and_request() {
        let opts = DecodeOptions { pll_bandwidth: 0.03, weak_threshold: 0.4, ..DecodeOptions::default() };
        let decoder = TrackDecoder::new(opts).unwrap();

        let plain = decoder.pll_config(4000.0, Encoding::Mfm, &TrackRequest::new(0, 0));
        assert_eq!(plain.nominal_cell_ns, 2000.0);
        assert_eq!(plain.bandwidth, 0.03);
        assert_eq!(plain.weak_threshold, 0.4);
        assert_eq!(plain.rejection, InterBandRejection::None);

        let req = TrackRequest::new(0, 0).with_rejection(InterBandRejection::Gcr);
        let snapped = decoder.pll_config(3250.0, Encoding::Gcr, &req);
        assert_eq!(snapped.nominal_cell_ns, 3250.0);
        assert_eq!(snapped.rejection, InterBandRejection::Gcr);
    }

    #[test]
    fn revolution_limit_counts_only_non_empty_captures() {
        let empty = FluxRevolution::new(Vec::new(), 72e6).unwrap();
        let full = FluxRevolution::new(vec![288; 10], 72e6).unwrap();
        let revs = vec![empty.clone(), full.clone(), empty, full.clone(), full];
        assert_eq!(select_revolutions(&revs, 1).len(), 2);
        assert_eq!(select_revolutions(&revs, 2).len(), 4);
        assert_eq!(select_revolutions(&revs, 16).len(), 5);
    }

    #[test]
    fn digest_covers_only_verified_payloads() {
        assert_eq!(evidence_digest(&[]), hex::encode(blake3::hash(b"").as_bytes()));
    }
}
