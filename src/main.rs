use std::path::PathBuf;
use std::sync::Arc;

use alsa::nix::errno::Errno;
use alsa::pcm::{Access, Format, Frames, HwParams, IO, PCM};
use alsa::{Direction, ValueOr};
use ancguard::{
    AlgorithmVariant, AncEngine, AudioChunk, EngineConfig, SessionConfig, SessionRegistry,
};
use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::info;

const SESSION_ID: &str = "live";
const STATS_EVERY: u64 = 500;

/// Captures ambient sound and plays back its anti-noise.
#[derive(Parser, Debug)]
#[command(name = "ancguard")]
struct Args {
    /// Engine configuration file (TOML).
    #[arg(long)]
    config: Option<PathBuf>,
    /// Samples per chunk.
    #[arg(long, default_value_t = 512)]
    chunk: usize,
    #[arg(long)]
    order: Option<usize>,
    #[arg(long)]
    mu: Option<f64>,
    #[arg(long, default_value_t = 1.0)]
    intensity: f32,
    /// Use the lightweight preset.
    #[arg(long)]
    lightweight: bool,
}

fn main() -> Result<()> {
    ancguard::init_logging();
    let args = Args::parse();
    run(args)
}

fn run(args: Args) -> Result<()> {
    let engine_config = match &args.config {
        Some(path) => EngineConfig::from_path(path)
            .with_context(|| format!("load engine config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    if args.chunk == 0 || args.chunk > engine_config.max_chunk_samples {
        bail!(
            "chunk size must be within 1..={}",
            engine_config.max_chunk_samples
        );
    }
    let sample_rate = engine_config.sample_rate;

    let capture = open_pcm(Direction::Capture, sample_rate, args.chunk)
        .context("failed to open capture PCM")?;
    let playback = open_pcm(Direction::Playback, sample_rate, args.chunk)
        .context("failed to open playback PCM")?;

    let capture_io = capture.io_i16().context("capture IO handle")?;
    let playback_io = playback.io_i16().context("playback IO handle")?;

    let engine = AncEngine::new(engine_config, Arc::new(SessionRegistry::new()))?;
    let mut session_config = SessionConfig::preset(if args.lightweight {
        AlgorithmVariant::NlmsLightweight
    } else {
        AlgorithmVariant::NlmsFull
    });
    session_config.sample_rate = sample_rate;
    session_config.intensity = args.intensity;
    // Nothing classifies the live stream here.
    session_config.bypass_ml = true;
    if let Some(order) = args.order {
        session_config.filter_order = order;
    }
    if let Some(mu) = args.mu {
        session_config.mu = mu;
    }
    engine.create_session(SESSION_ID, session_config)?;

    let mut input = vec![0i16; args.chunk];
    let mut output = vec![0i16; args.chunk];
    let mut sequence = 0u64;

    loop {
        read_chunk(&capture_io, &capture, &mut input)?;
        let samples = input.iter().map(|&s| s as f32 / i16::MAX as f32).collect();
        let result =
            engine.process_chunk(SESSION_ID, sequence, &AudioChunk::new(sample_rate, samples), None)?;

        for (dst, &src) in output.iter_mut().zip(&result.output) {
            *dst = (src * i16::MAX as f32) as i16;
        }
        write_chunk(&playback_io, &playback, &output)?;

        sequence += 1;
        if sequence % STATS_EVERY == 0 {
            let stats = engine.get_stats(SESSION_ID)?;
            info!(
                chunks = stats.chunks_processed,
                avg_cancellation_db = stats.avg_cancellation_db,
                avg_latency_ms = stats.avg_latency_ms,
                resets = stats.filter_resets,
                "live stats"
            );
        }
    }
}

fn open_pcm(direction: Direction, rate: u32, chunk: usize) -> Result<PCM> {
    let pcm = PCM::new("default", direction, false)
        .with_context(|| format!("open {:?} PCM", direction))?;

    {
        let hwp = HwParams::any(&pcm)?;
        hwp.set_access(Access::RWInterleaved)?;
        hwp.set_format(Format::s16())?;
        hwp.set_channels(1)?;
        hwp.set_rate(rate, ValueOr::Nearest)?;
        hwp.set_period_size_near(chunk as Frames, ValueOr::Nearest)?;
        hwp.set_buffer_size_near((chunk * 2) as Frames)?;
        pcm.hw_params(&hwp)?;
    }

    pcm.prepare()?;
    Ok(pcm)
}

fn read_chunk(io: &IO<i16>, pcm: &PCM, buffer: &mut [i16]) -> Result<()> {
    let mut offset = 0;
    while offset < buffer.len() {
        match io.readi(&mut buffer[offset..]) {
            Ok(frames) => offset += frames,
            Err(err) if err.errno() == Errno::EPIPE => {
                pcm.prepare()?;
            }
            Err(err) if err.errno() == Errno::EAGAIN => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn write_chunk(io: &IO<i16>, pcm: &PCM, buffer: &[i16]) -> Result<()> {
    let mut offset = 0;
    while offset < buffer.len() {
        match io.writei(&buffer[offset..]) {
            Ok(frames) => offset += frames,
            Err(err) if err.errno() == Errno::EPIPE => {
                pcm.prepare()?;
            }
            Err(err) if err.errno() == Errno::EAGAIN => continue,
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}
