use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use fluxfuse::codec::Encoding;
use fluxfuse::flux::histogram;
use fluxfuse::flux::{FluxRevolution, PreAnalysis};
use fluxfuse::io_stream::FluxDump;
use fluxfuse::pll::InterBandRejection;
use fluxfuse::synth::{default_cell_ns, pick_transitions, FluxSynth, TrackSpec, DEFAULT_TICK_HZ};
use fluxfuse::{DecodeOptions, DecodeSession, TrackDecoder, TrackRequest};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "fluxfuse", about = "Forensic floppy flux decoder", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Estimate bitrate and report flux statistics of a dump
    Analyze {
        input: PathBuf,
    },
    /// Decode the sectors of a dump
    Decode {
        input: PathBuf,
        /// default, paranoid or fast
        #[arg(short, long, default_value = "default")]
        preset: String,
        /// JSON options file; overrides --preset
        #[arg(long)]
        config: Option<PathBuf>,
        /// mfm, fm or gcr (detected when omitted)
        #[arg(short, long)]
        encoding: Option<Encoding>,
        #[arg(long)]
        cylinder: Option<u8>,
        #[arg(long)]
        head: Option<u8>,
        /// Shortest-interval time in ns, used when no histogram peak is found
        #[arg(long)]
        cell_hint: Option<f64>,
        /// PLL run snapping: none, gcr or fm
        #[arg(long)]
        rejection: Option<InterBandRejection>,
        /// Print the full result as JSON
        #[arg(long)]
        json: bool,
        /// Write an audit log to this path
        #[arg(long)]
        audit: Option<PathBuf>,
    },
    /// Write a synthetic track dump
    Synth {
        #[arg(short, long)]
        output: PathBuf,
        #[arg(short, long, default_value = "mfm")]
        encoding: Encoding,
        #[arg(short, long, default_value = "3")]
        revolutions: usize,
        #[arg(short, long, default_value = "9")]
        sectors: u8,
        /// 128 << size_code bytes per sector (ignored for gcr)
        #[arg(long, default_value = "2")]
        size_code: u8,
        /// Transitions to displace in the second revolution
        #[arg(short, long, default_value = "0")]
        weak: usize,
        /// Peak timing jitter in ns
        #[arg(long, default_value = "0")]
        jitter: f64,
        #[arg(long, default_value = "0")]
        cylinder: u8,
        #[arg(long, default_value = "0")]
        head: u8,
        #[arg(long, default_value = "1")]
        seed: u64,
    },
    /// Print the built-in option presets as JSON
    Presets,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match Cli::parse().command {

        // ── Analyze ──────────────────────────────────────────────────────────
        Commands::Analyze { input } => {
            let dump = FluxDump::load(&input)?;
            let est = histogram::estimate(&dump.revolutions)?;
            let normalized: Vec<_> = dump.revolutions.iter().map(FluxRevolution::normalize).collect();
            let opts = DecodeOptions::default();
            let pre = PreAnalysis::compute(&normalized, est.cell_time_ns, opts.min_cell_ratio, opts.max_cell_ratio);

            println!("── Flux dump ────────────────────────────────────────────");
            println!("  Path           {}", input.display());
            println!("  Capture        {}", dump.capture_id);
            println!("  Track          {}.{}", dump.cylinder, dump.head);
            println!("  Tick rate      {:.3} MHz", dump.tick_hz / 1e6);
            println!("  Revolutions    {}", dump.revolutions.len());
            println!("  Transitions    {}", pre.transitions);
            println!("  RPM            {:.2}", pre.rpm);
            println!("  Cell time      {:.1} ns ({:.1} ticks)", est.cell_time_ns, est.cell_ticks);
            println!("  Density        {:?} ({:.0} bit/s)", est.density, est.data_rate());
            println!("  Encoding       {}", est.encoding);
            println!("  Interval ns    min {:.0}  max {:.0}  mean {:.1}  sd {:.1}",
                     pre.min_ns, pre.max_ns, pre.mean_ns, pre.stddev_ns);
            println!("  Anomalies      {} spikes, {} dropouts", pre.spike_count, pre.dropout_count);
            println!("  Quality        {:.3}", pre.quality);
            println!("  Peaks ({}):", est.peaks.len());
            for p in &est.peaks {
                println!("    {:>6.1} ticks  x{:<8} [{}..{}]", p.centroid, p.count, p.low, p.high);
            }
        }

        // ── Decode ───────────────────────────────────────────────────────────
        Commands::Decode { input, preset, config, encoding, cylinder, head, cell_hint, rejection, json, audit } => {
            let mut opts = match &config {
                Some(path) => DecodeOptions::from_json_file(path)?,
                None => DecodeOptions::preset(&preset).ok_or_else(|| format!("unknown preset '{preset}'"))?,
            };
            if audit.is_some() {
                opts.enable_audit = true;
            }
            let dump = FluxDump::load(&input)?;
            let session = Arc::new(DecodeSession::new(opts.enable_audit));
            session.log(format!("decoding {} (capture {})", input.display(), dump.capture_id));
            let decoder = TrackDecoder::new(opts)?.with_session(Arc::clone(&session));

            let mut request = TrackRequest::new(cylinder.unwrap_or(dump.cylinder), head.unwrap_or(dump.head));
            request.encoding = encoding;
            request.cell_time_hint_ns = cell_hint;
            request.rejection = rejection;
            let result = decoder.decode(&dump.revolutions, &request)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                println!("Track {}.{} ({}, cell {:.1} ns)", result.cylinder, result.head, result.encoding, result.cell_time_ns);
                for r in &result.revolutions {
                    let state = if r.used { "used" } else { "dropped" };
                    println!("  rev {:>2}  offset {:>6}  score {:.3}  {:>6} bits  {}",
                             r.index, r.offset, r.score, r.length_bits, state);
                }
                println!("{:<28} {:>6} {:>7} {:>9} {:>10}", "Sector", "CRC", "Fixed", "Conf", "Stored");
                for s in &result.sectors {
                    println!("{:<28} {:>6} {:>7} {:>9.3} {:>10}",
                             s.id.to_string(),
                             if s.crc_ok { "ok" } else { "BAD" },
                             s.corrections_count,
                             s.confidence,
                             format!("{:04x}", s.stored_crc));
                }
                for issue in &result.issues {
                    println!("  ! {issue}");
                }
                println!("{}", result.summary);
                println!("Digest {}", result.digest);
            }

            match audit {
                Some(path) => {
                    session.export_audit(&path)?;
                    eprintln!("Audit log written to {}", path.display());
                }
                None if session.audit_enabled() => {
                    for e in session.entries() {
                        eprintln!("{} {}", e.timestamp.to_rfc3339(), e.message);
                    }
                }
                None => {}
            }
        }

        // ── Synth ────────────────────────────────────────────────────────────
        Commands::Synth { output, encoding, revolutions, sectors, size_code, weak, jitter, cylinder, head, seed } => {
            let bits = TrackSpec::new(encoding, cylinder, head)
                .with_standard_sectors(sectors, size_code)
                .encode();
            let cell_ns = default_cell_ns(encoding);
            let target = revolutions.min(2).saturating_sub(1);
            let shifts: Vec<(usize, usize, f64)> = pick_transitions(&bits, 0..bits.len(), weak, seed)
                .into_iter()
                .map(|at| (target, at, 0.55 * cell_ns))
                .collect();
            let synth = FluxSynth::new(DEFAULT_TICK_HZ, cell_ns).with_jitter(jitter, seed);
            let revs = synth.revolutions(&bits, revolutions, &shifts)?;
            FluxDump::new(DEFAULT_TICK_HZ, cylinder, head, revs).save(&output)?;
            println!("Wrote {} revolution(s), {} cells, {} weak transition(s) to {}",
                     revolutions, bits.len(), shifts.len(), output.display());
        }

        // ── Presets ──────────────────────────────────────────────────────────
        Commands::Presets => {
            for name in ["default", "paranoid", "fast"] {
                if let Some(opts) = DecodeOptions::preset(name) {
                    println!("// {name}\n{}", opts.to_json());
                }
            }
        }
    }

    Ok(())
}
