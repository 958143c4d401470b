use criterion::{black_box, criterion_group, criterion_main, Criterion};
use fluxfuse::codec::Encoding;
use fluxfuse::flux::histogram;
use fluxfuse::pll::{self, PllConfig};
use fluxfuse::synth::{FluxSynth, TrackSpec};
use fluxfuse::{DecodeOptions, TrackDecoder, TrackRequest};

fn mfm_track(revolutions: usize) -> Vec<fluxfuse::FluxRevolution> {
    let bits = TrackSpec::new(Encoding::Mfm, 0, 0).with_standard_sectors(18, 2).encode();
    FluxSynth::new(72e6, 1000.0)
        .with_jitter(60.0, 3)
        .revolutions(&bits, revolutions, &[])
        .unwrap()
}

fn bench_stages(c: &mut Criterion) {
    let revs = mfm_track(1);
    let normalized = revs[0].normalize();

    c.bench_function("histogram_estimate_hd_track", |b| {
        b.iter(|| histogram::estimate(black_box(&revs)).unwrap())
    });
    c.bench_function("pll_recover_hd_track", |b| {
        b.iter(|| pll::recover(black_box(&normalized), &PllConfig::new(1000.0)))
    });
}

fn bench_pipeline(c: &mut Criterion) {
    let revs = mfm_track(5);
    let req = TrackRequest::new(0, 0);

    let fast = TrackDecoder::new(DecodeOptions::fast()).unwrap();
    c.bench_function("decode_hd_track_fast", |b| {
        b.iter(|| fast.decode(black_box(&revs), &req).unwrap())
    });

    let default = TrackDecoder::new(DecodeOptions::default()).unwrap();
    c.bench_function("decode_hd_track_5_revolutions", |b| {
        b.iter(|| default.decode(black_box(&revs), &req).unwrap())
    });
}

criterion_group!(benches, bench_stages, bench_pipeline);
criterion_main!(benches);
