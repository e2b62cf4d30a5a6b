use std::f32::consts::PI;
use std::path::PathBuf;
use std::sync::Arc;

use ancguard::{
    AlgorithmVariant, AncEngine, AudioChunk, ClassificationResult, EngineConfig, SessionConfig,
    SessionRegistry,
};
use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::info;

const ALARM_FREQ: f32 = 3_000.0;
const ALARM_RATIO: f32 = 0.3;

/// Feeds a synthetic ambient tone, with optional alarm bursts, through the
/// engine and reports the session stats.
#[derive(Parser, Debug)]
#[command(name = "anc-sim")]
struct Args {
    /// Engine configuration file (TOML).
    #[arg(long)]
    config: Option<PathBuf>,
    /// nlms-full or nlms-lightweight.
    #[arg(long, default_value = "nlms-full", value_parser = parse_algorithm)]
    algorithm: AlgorithmVariant,
    #[arg(long)]
    order: Option<usize>,
    #[arg(long)]
    mu: Option<f64>,
    #[arg(long, default_value_t = 1.0)]
    intensity: f32,
    /// Frequency of the ambient tone in Hz.
    #[arg(long, default_value_t = 440.0)]
    tone_hz: f32,
    #[arg(long, default_value_t = 0.5)]
    amplitude: f32,
    /// Samples per chunk.
    #[arg(long, default_value_t = 512)]
    chunk: usize,
    /// Number of chunks to run.
    #[arg(long, default_value_t = 200)]
    chunks: usize,
    /// Mix an alarm tone into every Nth chunk.
    #[arg(long)]
    alarm_every: Option<usize>,
    /// Never consult the classifier.
    #[arg(long)]
    bypass_ml: bool,
    /// Print final stats as JSON.
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    ancguard::init_logging();
    let args = Args::parse();
    run(args)
}

fn run(args: Args) -> Result<()> {
    if args.chunk == 0 {
        bail!("chunk size must be positive");
    }
    let engine_config = match &args.config {
        Some(path) => EngineConfig::from_path(path)
            .with_context(|| format!("load engine config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    let sample_rate = engine_config.sample_rate;

    let engine = AncEngine::new(engine_config, Arc::new(SessionRegistry::new()))?
        .with_classifier(move |samples: &[f32]| tone_classifier(samples, sample_rate));

    let mut session_config = SessionConfig::preset(args.algorithm);
    session_config.sample_rate = sample_rate;
    session_config.intensity = args.intensity;
    session_config.bypass_ml = args.bypass_ml;
    if let Some(order) = args.order {
        session_config.filter_order = order;
    }
    if let Some(mu) = args.mu {
        session_config.mu = mu;
    }
    engine
        .create_session("sim", session_config)
        .context("start session")?;

    let mut tone_phase = 0.0f32;
    let mut alarm_phase = 0.0f32;
    let mut samples = vec![0.0f32; args.chunk];
    for sequence in 0..args.chunks as u64 {
        synthesize_chunk(&mut samples, args.tone_hz, &mut tone_phase, args.amplitude, sample_rate);
        let alarm = args
            .alarm_every
            .is_some_and(|every| every > 0 && sequence % every as u64 == every as u64 - 1);
        if alarm {
            mix_alarm(&mut samples, &mut alarm_phase, sample_rate);
        }

        let chunk = AudioChunk::new(sample_rate, samples.clone());
        let result = engine.process_chunk_classified("sim", sequence, &chunk)?;
        if result.is_emergency || sequence % 50 == 0 {
            info!(
                sequence,
                cancellation_db = result.cancellation_db,
                emergency = result.is_emergency,
                degraded = result.degraded,
                "chunk"
            );
        }
    }

    let stats = engine.end_session("sim")?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        println!(
            "chunks={} avg_cancellation={:.1}dB avg_latency={:.3}ms emergencies={} degraded={}",
            stats.chunks_processed,
            stats.avg_cancellation_db,
            stats.avg_latency_ms,
            stats.emergency_count,
            stats.degraded_count
        );
    }
    Ok(())
}

fn parse_algorithm(value: &str) -> Result<AlgorithmVariant, String> {
    match value {
        "nlms-full" => Ok(AlgorithmVariant::NlmsFull),
        "nlms-lightweight" => Ok(AlgorithmVariant::NlmsLightweight),
        other => Err(format!("unknown algorithm {other}")),
    }
}

fn synthesize_chunk(buffer: &mut [f32], freq: f32, phase: &mut f32, gain: f32, sample_rate: u32) {
    let phase_step = 2.0 * PI * freq / sample_rate as f32;
    for sample in buffer.iter_mut() {
        *sample = gain * phase.sin();
        *phase += phase_step;
        if *phase > 2.0 * PI {
            *phase -= 2.0 * PI;
        }
    }
}

fn mix_alarm(buffer: &mut [f32], phase: &mut f32, sample_rate: u32) {
    let phase_step = 2.0 * PI * ALARM_FREQ / sample_rate as f32;
    for sample in buffer.iter_mut() {
        *sample = (*sample + 0.4 * phase.sin()).clamp(-1.0, 1.0);
        *phase += phase_step;
        if *phase > 2.0 * PI {
            *phase -= 2.0 * PI;
        }
    }
}

/// Stand-in for a trained model: reports "alarm" when the alarm tone
/// carries a large share of the chunk energy (Goertzel at `ALARM_FREQ`).
fn tone_classifier(samples: &[f32], sample_rate: u32) -> Option<ClassificationResult> {
    if samples.is_empty() {
        return None;
    }
    let coeff = 2.0 * (2.0 * PI * ALARM_FREQ / sample_rate as f32).cos();
    let (mut s1, mut s2) = (0.0f32, 0.0f32);
    let mut energy = 0.0f32;
    for &x in samples {
        let s0 = x + coeff * s1 - s2;
        s2 = s1;
        s1 = s0;
        energy += x * x;
    }
    if energy <= f32::EPSILON {
        return None;
    }
    let tone_power = s1 * s1 + s2 * s2 - coeff * s1 * s2;
    let ratio = (2.0 * tone_power / (samples.len() as f32 * energy)).min(1.0);
    let (label, confidence) = if ratio >= ALARM_RATIO {
        ("alarm", (0.5 + ratio).min(1.0))
    } else {
        ("ambient", 1.0 - ratio)
    };
    Some(ClassificationResult::new(label, confidence))
}
