use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};

use earsim_core::{rms, AncEngine, Config, SAMPLE_RATE};

mod fxlms;

use fxlms::FxLms;

#[derive(Parser)]
#[command(author, version, about = "ANC simulation harness for in-ear devices", long_about = None)]
struct Args {
    /// Run the FxLMS demo against the synthetic noise plant (default mode)
    #[arg(long)]
    demo: bool,

    /// Use a WAV file as the ambient noise instead of the synthetic generator
    #[arg(long, value_name = "FILE")]
    wav: Option<PathBuf>,

    /// Record the in-ear signal (what the listener hears) to this WAV file
    #[arg(long, value_name = "FILE")]
    out: Option<PathBuf>,

    /// Record both microphones (ANC bypassed) to <PREFIX>_outside.wav and
    /// <PREFIX>_inear.wav
    #[arg(long, value_name = "PREFIX")]
    write_mics: Option<String>,

    /// How long to run, in seconds
    #[arg(long, default_value_t = 10)]
    seconds: u64,

    /// System latency in blocks (speaker command to audible effect)
    #[arg(long, default_value_t = 3)]
    latency: usize,

    /// RNG seed for reproducible runs
    #[arg(long)]
    seed: Option<u64>,

    /// FxLMS adaptation step size
    #[arg(long, default_value_t = 1e-4)]
    mu: f32,

    /// Load the engine configuration from a JSON file
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    #[arg(short, long)]
    verbose: bool,
}

/// Shared run statistics updated from the controller callback.
#[derive(Default)]
struct RunStats {
    blocks: AtomicU64,
    inear_rms_bits: AtomicU32,
    initial_rms_bits: AtomicU32,
}

impl RunStats {
    fn record(&self, inear_rms: f32) {
        self.blocks.fetch_add(1, Ordering::Relaxed);
        self.inear_rms_bits
            .store(inear_rms.to_bits(), Ordering::Relaxed);
        // First observed block sets the baseline.
        let _ = self.initial_rms_bits.compare_exchange(
            0,
            inear_rms.to_bits(),
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
    }

    fn blocks(&self) -> u64 {
        self.blocks.load(Ordering::Relaxed)
    }

    fn inear_rms(&self) -> f32 {
        f32::from_bits(self.inear_rms_bits.load(Ordering::Relaxed))
    }

    fn reduction_db(&self) -> f32 {
        let initial = f32::from_bits(self.initial_rms_bits.load(Ordering::Relaxed));
        let current = self.inear_rms();
        if initial > 1e-12 && current > 1e-12 {
            20.0 * (current / initial).log10()
        } else {
            0.0
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("earsim={level},earsim_core={level}"))
        .init();

    info!(
        sample_rate = SAMPLE_RATE,
        block_size = earsim_core::BLOCK_SIZE,
        block_period_us = earsim_core::BLOCK_PERIOD_US,
        "earsim"
    );

    let mut config = match &args.config {
        Some(path) => Config::load(path)?,
        None => {
            let mut config = Config::default();
            config.apply_env_overrides();
            config
        }
    };
    config.timing.system_latency_blocks = args.latency;
    if args.seed.is_some() {
        config.seed = args.seed;
    }

    if let Some(prefix) = &args.write_mics {
        return write_mics_run(config, prefix, args.seconds);
    }

    if let Some(input) = &args.wav {
        let mut wav_config = Config::wav_playback(input.clone(), args.out.clone());
        wav_config.timing = config.timing.clone();
        wav_config.seed = config.seed;
        return fxlms_run(wav_config, args.seconds, args.mu, true);
    }

    // Default mode: FxLMS against the synthetic plant.
    if !args.demo {
        info!("no mode flag given, running the FxLMS demo");
    }
    fxlms_run(config, args.seconds, args.mu, false)
}

/// Run the engine with the FxLMS controller attached and report progress
/// once a second. In WAV mode the run also ends when the file does.
fn fxlms_run(config: Config, seconds: u64, mu: f32, until_source_ends: bool) -> Result<()> {
    let s_hat = config.state.s.clone();
    let fxlms = Arc::new(Mutex::new(
        FxLms::new(&s_hat, mu).context("failed to build FxLMS controller")?,
    ));
    let stats = Arc::new(RunStats::default());

    let mut engine = AncEngine::new(config)?;
    engine.set_process_mics({
        let fxlms = Arc::clone(&fxlms);
        let stats = Arc::clone(&stats);
        move |mics, control| {
            let mut fxlms = match fxlms.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Err(e) = fxlms.process_block(&mics.outside, &mics.inear, control) {
                warn!("controller step failed: {e:#}");
                control.fill(0.0);
            }
            stats.record(rms(&mics.inear));
        }
    });
    engine.start()?;

    info!(seconds, mu, "FxLMS running");
    let started = Instant::now();
    let mut last_report = 0;

    while started.elapsed() < Duration::from_secs(seconds) {
        if until_source_ends && !engine.is_running() {
            info!("audio source finished");
            break;
        }
        std::thread::sleep(Duration::from_millis(100));

        let elapsed = started.elapsed().as_secs();
        if elapsed > last_report {
            last_report = elapsed;
            let weight_norm = match fxlms.lock() {
                Ok(guard) => guard.weight_norm(),
                Err(poisoned) => poisoned.into_inner().weight_norm(),
            };
            info!(
                t = elapsed,
                blocks = stats.blocks(),
                inear_rms = stats.inear_rms(),
                reduction_db = stats.reduction_db(),
                weight_norm,
                "progress"
            );
        }
    }

    engine.stop();

    info!(
        blocks = stats.blocks(),
        inear_rms = stats.inear_rms(),
        reduction_db = stats.reduction_db(),
        "run complete"
    );
    Ok(())
}

/// Record both microphones to WAV with the controller bypassed.
fn write_mics_run(config: Config, prefix: &str, seconds: u64) -> Result<()> {
    let outside_path = format!("{prefix}_outside.wav");
    let inear_path = format!("{prefix}_inear.wav");

    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE,
        bits_per_sample: 32,
        sample_format: hound::SampleFormat::Float,
    };
    let mut outside_writer = hound::WavWriter::create(&outside_path, spec)
        .with_context(|| format!("failed to create {outside_path}"))?;
    let mut inear_writer = hound::WavWriter::create(&inear_path, spec)
        .with_context(|| format!("failed to create {inear_path}"))?;

    let mut engine = AncEngine::new(config)?;
    engine.set_process_mics(|_mics, control| control.fill(0.0));
    engine.start()?;

    info!(
        outside = %outside_path,
        inear = %inear_path,
        seconds,
        "recording microphones"
    );
    let started = Instant::now();
    let mut blocks_written = 0u64;

    while started.elapsed() < Duration::from_secs(seconds) {
        if let Some(mics) = engine.get_mics() {
            for &sample in mics.outside.iter() {
                outside_writer.write_sample(sample)?;
            }
            for &sample in mics.inear.iter() {
                inear_writer.write_sample(sample)?;
            }
            blocks_written += 1;
        }
        std::thread::sleep(Duration::from_micros(500));
    }

    engine.stop();
    outside_writer.finalize()?;
    inear_writer.finalize()?;

    info!(
        blocks_written,
        duration_s = blocks_written as f32 * earsim_core::BLOCK_SIZE as f32 / SAMPLE_RATE as f32,
        "recording complete"
    );
    Ok(())
}
