use std::sync::Arc;

use fluxfuse::codec::{LineCode, MarkKind, MfmCode};
use fluxfuse::flux::FluxRevolution;
use fluxfuse::fusion::{fuse, FusionConfig};
use fluxfuse::io_stream::FluxDump;
use fluxfuse::perf::{decode_tracks, TrackJob};
use fluxfuse::pll::{self, PllConfig};
use fluxfuse::synth::{pattern_payload, FluxSynth, SyntheticSector, TrackSpec};
use fluxfuse::{
    DecodeError, DecodeOptions, DecodeSession, Encoding, SectorId, TrackDecoder, TrackQuality, TrackRequest,
};

const CELL_NS: f64 = 2000.0;

fn decoder(opts: DecodeOptions) -> TrackDecoder {
    TrackDecoder::new(opts).unwrap()
}

/// First one bit at least `skip` cells into the first data field.
fn data_transition(bits: &[bool], skip: usize) -> usize {
    let hit = MfmCode
        .find_marks(bits, 0)
        .into_iter()
        .find(|h| h.kind == MarkKind::Data)
        .unwrap();
    (hit.body_bit + skip..).find(|&p| bits[p]).unwrap()
}

fn one_sector_track() -> (Vec<bool>, SectorId) {
    let spec = TrackSpec::new(Encoding::Mfm, 2, 0)
        .with_standard_sectors(1, 1)
        .with_min_transitions(5000);
    let id = spec.sectors[0].id;
    (spec.encode(), id)
}

#[test]
fn weak_bit_in_one_revolution_is_outvoted() {
    let (bits, id) = one_sector_track();
    let p = data_transition(&bits, 800);
    let synth = FluxSynth::new(72e6, CELL_NS);
    let revs = synth.revolutions(&bits, 3, &[(1, p, 0.55 * CELL_NS)]).unwrap();
    assert!(revs[0].len() >= 5000);

    // Stage by stage: the displaced transition is weak in revolution 2 only.
    let cfg = PllConfig::new(CELL_NS);
    let streams: Vec<_> = revs.iter().map(|r| Arc::new(pll::recover(&r.normalize(), &cfg))).collect();
    assert!(streams[1].confidence[p] < 0.5);
    assert!(streams[1].weak[p]);
    assert!(!streams[0].weak[p] && !streams[2].weak[p]);
    assert_ne!(streams[1].bits[p], streams[0].bits[p]);

    let fused = fuse(&streams, &[], &FusionConfig::default());
    assert_eq!(fused.revolutions_used, 3);
    assert_eq!(fused.stream.bits[p], streams[0].bits[p]);
    assert_eq!(fused.stream.bits[p], streams[2].bits[p]);
    assert!(fused.stream.weak[p]);

    // Whole pipeline: the sector verifies without any correction.
    let opts = DecodeOptions { keep_raw_bits: true, keep_confidence: true, ..DecodeOptions::default() };
    let result = decoder(opts).decode(&revs, &TrackRequest::new(2, 0)).unwrap();
    assert_eq!(result.encoding, Encoding::Mfm);
    assert_eq!(result.sectors.len(), 1);
    let sector = &result.sectors[0];
    assert_eq!(sector.id, id);
    assert!(sector.crc_ok);
    assert!(!sector.corrected);
    assert_eq!(sector.corrections_count, 0);
    assert_eq!(sector.correction_iterations, 0);
    assert_eq!(sector.data, pattern_payload(&id, 256));
    assert_eq!(result.summary.quality, TrackQuality::Clean);
    assert!(result.summary.weak_bits >= 1);

    let fused_bits = result.fused_bits.as_ref().unwrap();
    assert!(fused_bits[p]);
    assert_eq!(result.confidence.as_ref().map(Vec::len), Some(fused_bits.len()));
}

#[test]
fn clean_track_with_jitter_decodes_every_sector() {
    let spec = TrackSpec::new(Encoding::Mfm, 10, 1).with_standard_sectors(9, 2);
    let bits = spec.encode();
    let revs = FluxSynth::new(72e6, CELL_NS).with_jitter(100.0, 42).revolutions(&bits, 3, &[]).unwrap();

    let result = decoder(DecodeOptions::default()).decode(&revs, &TrackRequest::new(10, 1)).unwrap();
    assert_eq!(result.summary.sector_count, 9);
    assert_eq!(result.summary.crc_ok_count, 9);
    assert_eq!(result.summary.quality, TrackQuality::Clean);
    assert!(result.issues.is_empty());
    for s in &spec.sectors {
        assert_eq!(result.sector(s.id.sector).unwrap().data, s.data);
    }
    assert!(result.revolutions.iter().all(|r| r.used));
    assert_eq!(result.preanalysis.dropout_count, 0);
}

#[test]
fn empty_revolutions_are_skipped_not_fatal() {
    let spec = TrackSpec::new(Encoding::Mfm, 4, 0).with_standard_sectors(3, 2);
    let bits = spec.encode();
    let revs = FluxSynth::new(72e6, CELL_NS).with_jitter(80.0, 9).revolutions(&bits, 2, &[]).unwrap();
    let empty = FluxRevolution::new(Vec::new(), 72e6).unwrap();
    let req = TrackRequest::new(4, 0);

    let baseline = decoder(DecodeOptions::default()).decode(&revs, &req).unwrap();
    assert_eq!(baseline.summary.crc_ok_count, 3);

    let padded = vec![empty.clone(), revs[0].clone(), empty, revs[1].clone()];
    let result = decoder(DecodeOptions::default()).decode(&padded, &req).unwrap();
    assert_eq!(result.summary.sector_count, 3);
    assert_eq!(result.summary.crc_ok_count, 3);
    assert_eq!(result.summary.quality, TrackQuality::Clean);
    assert_eq!(result.digest, baseline.digest);
    assert!((result.preanalysis.rpm - baseline.preanalysis.rpm).abs() < 1e-6);

    assert_eq!(result.revolutions.len(), 4);
    assert_eq!(result.revolutions.iter().filter(|r| r.used).count(), 2);
    for i in [0, 2] {
        let report = &result.revolutions[i];
        assert_eq!(report.index, i);
        assert!(!report.used);
        assert_eq!(report.length_bits, 0);
        assert!(matches!(report.fault, Some(DecodeError::AlignmentFailure { .. })));
    }

    // A single-revolution preset still reaches past a leading empty capture.
    let fast = decoder(DecodeOptions::fast()).decode(&padded, &req).unwrap();
    assert_eq!(fast.summary.crc_ok_count, 3);
    assert_eq!(fast.revolutions.len(), 2);
    assert!(fast.revolutions[1].used);
}

#[test]
fn single_revolution_flip_is_corrected() {
    let (bits, id) = one_sector_track();
    let p = data_transition(&bits, 800);
    let rev = FluxSynth::new(72e6, CELL_NS).revolution(&bits, 0, &[(p, 0.55 * CELL_NS)]).unwrap();

    let result = decoder(DecodeOptions::default()).decode(&[rev], &TrackRequest::new(2, 0)).unwrap();
    let sector = &result.sectors[0];
    assert!(sector.crc_ok);
    assert!(sector.corrected);
    assert_eq!(sector.corrections_count, 1);
    assert!(sector.correction_iterations >= 1);
    assert!(sector.fault.is_none());
    assert_eq!(sector.data, pattern_payload(&id, 256));
    assert_eq!(result.summary.quality, TrackQuality::Recovered);
}

#[test]
fn damage_beyond_budget_is_left_untouched() {
    let (bits, id) = one_sector_track();
    let p1 = data_transition(&bits, 800);
    let p2 = data_transition(&bits, 2400);
    let shift = 0.55 * CELL_NS;
    let rev = FluxSynth::new(72e6, CELL_NS).revolution(&bits, 0, &[(p1, shift), (p2, shift)]).unwrap();
    let req = TrackRequest::new(2, 0);

    let raw = decoder(DecodeOptions { enable_correction: false, ..DecodeOptions::default() })
        .decode(std::slice::from_ref(&rev), &req)
        .unwrap();
    let tight = decoder(DecodeOptions { max_correction_bits: 1, ..DecodeOptions::default() })
        .decode(std::slice::from_ref(&rev), &req)
        .unwrap();

    let before = &raw.sectors[0];
    let after = &tight.sectors[0];
    assert!(!before.crc_ok);
    assert!(!after.crc_ok);
    assert!(!after.corrected);
    assert_eq!(after.data, before.data);
    assert_ne!(after.data, pattern_payload(&id, 256));
    assert!(matches!(after.fault, Some(DecodeError::CrcMismatchUncorrectable { .. })));
    assert_eq!(tight.summary.quality, TrackQuality::Partial);
    assert!(tight.summary.needs_recapture());
}

#[test]
fn fm_track_is_detected_and_decoded() {
    let spec = TrackSpec::new(Encoding::Fm, 0, 0).with_standard_sectors(4, 0);
    let bits = spec.encode();
    let revs = FluxSynth::for_encoding(Encoding::Fm).revolutions(&bits, 2, &[]).unwrap();

    let result = decoder(DecodeOptions::default()).decode(&revs, &TrackRequest::new(0, 0)).unwrap();
    assert_eq!(result.encoding, Encoding::Fm);
    assert_eq!(result.summary.crc_ok_count, 4);
    assert_eq!(result.sector(3).unwrap().data, spec.sectors[2].data);
}

#[test]
fn gcr_track_is_detected_and_decoded() {
    let spec = TrackSpec::new(Encoding::Gcr, 17, 0).with_standard_sectors(5, 1);
    let bits = spec.encode();
    let revs = FluxSynth::for_encoding(Encoding::Gcr).revolutions(&bits, 2, &[]).unwrap();

    let result = decoder(DecodeOptions::default()).decode(&revs, &TrackRequest::new(17, 0)).unwrap();
    assert_eq!(result.encoding, Encoding::Gcr);
    assert_eq!(result.summary.crc_ok_count, 5);
    assert_eq!(result.sector(0).unwrap().id.cylinder, 17);
    assert_eq!(result.sector(4).unwrap().data, spec.sectors[4].data);
}

#[test]
fn deleted_data_mark_is_reported() {
    let id = SectorId { cylinder: 1, head: 0, sector: 1, size_code: 1 };
    let spec = TrackSpec::new(Encoding::Mfm, 1, 0).with_sector(SyntheticSector {
        id,
        data:    vec![0xE5; 256],
        deleted: true,
    });
    let rev = FluxSynth::new(72e6, CELL_NS).revolution(&spec.encode(), 0, &[]).unwrap();
    let result = decoder(DecodeOptions::fast()).decode(&[rev], &TrackRequest::new(1, 0)).unwrap();
    assert!(result.sectors[0].deleted);
    assert!(result.sectors[0].crc_ok);
}

#[test]
fn forced_encoding_overrides_detection() {
    let bits = TrackSpec::new(Encoding::Mfm, 0, 0).with_standard_sectors(2, 1).encode();
    let rev = FluxSynth::new(72e6, CELL_NS).revolution(&bits, 0, &[]).unwrap();
    let req = TrackRequest::new(0, 0).with_encoding(Encoding::Gcr);
    let result = decoder(DecodeOptions::default()).decode(&[rev], &req).unwrap();
    assert_eq!(result.encoding, Encoding::Gcr);
    assert_eq!(result.summary.crc_ok_count, 0);
}

#[test]
fn cell_hint_rescues_a_flat_histogram() {
    let ticks: Vec<u32> = (0..400).map(|i| 100 + i * 37 % 5000).collect();
    let rev = FluxRevolution::new(ticks, 72e6).unwrap();
    let d = decoder(DecodeOptions::default());

    let err = d.decode(std::slice::from_ref(&rev), &TrackRequest::new(0, 0)).unwrap_err();
    assert!(matches!(err, DecodeError::InsufficientSignal { .. }));

    let req = TrackRequest::new(0, 0).with_cell_time_hint(4000.0);
    let result = d.decode(&[rev], &req).unwrap();
    assert!(result.bitrate.is_none());
    assert_eq!(result.cell_time_ns, 4000.0);
    assert_eq!(result.summary.quality, TrackQuality::Unreadable);
}

#[test]
fn session_accumulates_across_tracks() {
    let session = Arc::new(DecodeSession::new(true));
    let d = decoder(DecodeOptions::default()).with_session(Arc::clone(&session));
    let jobs: Vec<TrackJob> = (0..2u8)
        .map(|c| {
            let bits = TrackSpec::new(Encoding::Mfm, c, 0).with_standard_sectors(3, 1).encode();
            TrackJob {
                revolutions: FluxSynth::new(72e6, CELL_NS).revolutions(&bits, 2, &[]).unwrap(),
                request:     TrackRequest::new(c, 0),
            }
        })
        .chain(std::iter::once(TrackJob { revolutions: Vec::new(), request: TrackRequest::new(9, 0) }))
        .collect();

    let results = decode_tracks(&d, &jobs);
    assert_eq!(results.len(), 3);
    assert!(results[0].is_ok() && results[1].is_ok());
    assert_eq!(results[2].as_ref().unwrap_err(), &DecodeError::EmptyCapture);

    let stats = session.stats();
    assert_eq!(stats.tracks_processed, 2);
    assert_eq!(stats.sectors_decoded, 6);
    assert_eq!(stats.total_corrections, 0);
    assert!(session.entries().iter().any(|e| e.message.contains("digest=")));

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("audit.txt");
    session.export_audit(&path).unwrap();
    assert!(std::fs::read_to_string(&path).unwrap().contains("tracks=2"));
}

#[test]
fn dump_file_round_trips_through_the_decoder() {
    let spec = TrackSpec::new(Encoding::Mfm, 5, 1).with_standard_sectors(2, 2);
    let revs = FluxSynth::new(72e6, CELL_NS).revolutions(&spec.encode(), 2, &[]).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("t05.1.flxd");
    FluxDump::new(72e6, 5, 1, revs).save(&path).unwrap();

    let dump = FluxDump::load(&path).unwrap();
    let result = decoder(DecodeOptions::paranoid())
        .decode(&dump.revolutions, &TrackRequest::new(dump.cylinder, dump.head))
        .unwrap();
    assert_eq!(result.summary.crc_ok_count, 2);

    let again = decoder(DecodeOptions::default())
        .decode(&dump.revolutions, &TrackRequest::new(dump.cylinder, dump.head))
        .unwrap();
    assert_eq!(again.digest, result.digest);

    let json = serde_json::to_value(&result).unwrap();
    assert_eq!(json["summary"]["crc_ok_count"], 2);
    assert!(json.get("fused_bits").is_some());
}
