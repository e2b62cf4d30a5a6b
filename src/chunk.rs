//! Chunk-level processing: validation, block filtering, intensity
//! scaling, output clamping and the chunk cancellation estimate.

use nlms_core::{NlmsFilter, NumericInstability};
use serde::{Deserialize, Serialize};

use crate::config::SessionConfig;
use crate::error::{AncError, Result};

const RMS_FLOOR: f64 = 1e-10;

/// A block of mono samples with its declared sample rate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioChunk {
    pub sample_rate: u32,
    pub samples: Vec<f32>,
}

impl AudioChunk {
    pub fn new(sample_rate: u32, samples: Vec<f32>) -> Self {
        Self {
            sample_rate,
            samples,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// What the engine hands back for every accepted chunk.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkResult {
    pub sequence: u64,
    /// Anti-noise, or the untouched input when `is_emergency` is set.
    pub output: Vec<f32>,
    pub residual_rms: f64,
    pub cancellation_db: f64,
    pub latency_ms: f64,
    pub is_emergency: bool,
    /// The filter reset itself at least once while producing this chunk.
    pub degraded: bool,
}

/// Output of running the filter over one chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct FilteredChunk {
    pub output: Vec<f32>,
    pub residual_rms: f64,
    pub cancellation_db: f64,
    pub instabilities: usize,
    pub last_instability: Option<NumericInstability>,
}

impl FilteredChunk {
    pub fn degraded(&self) -> bool {
        self.instabilities > 0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ChunkProcessor {
    max_chunk_samples: usize,
}

impl ChunkProcessor {
    pub fn new(max_chunk_samples: usize) -> Self {
        Self { max_chunk_samples }
    }

    pub fn max_chunk_samples(&self) -> usize {
        self.max_chunk_samples
    }

    /// Checks the chunk against the size limit and the session rate.
    pub fn validate(&self, chunk: &AudioChunk, config: &SessionConfig) -> Result<()> {
        if chunk.len() > self.max_chunk_samples {
            return Err(AncError::ChunkSize {
                len: chunk.len(),
                max: self.max_chunk_samples,
            });
        }
        if chunk.sample_rate != config.sample_rate {
            return Err(AncError::SampleRateMismatch {
                expected: config.sample_rate,
                actual: chunk.sample_rate,
            });
        }
        Ok(())
    }

    /// Runs every sample through `filter` as both reference and desired
    /// signal. The filter is untouched when validation fails.
    pub fn process(
        &self,
        filter: &mut NlmsFilter,
        config: &SessionConfig,
        chunk: &AudioChunk,
    ) -> Result<FilteredChunk> {
        self.validate(chunk, config)?;

        let mut output = vec![0.0f32; chunk.len()];
        let mut errors = vec![0.0f64; chunk.len()];
        let report = filter.process_block(&chunk.samples, &chunk.samples, &mut output, &mut errors);
        for sample in output.iter_mut() {
            *sample = (*sample * config.intensity).clamp(-1.0, 1.0);
        }

        let (residual_rms, cancellation_db) = if chunk.is_empty() {
            (0.0, 0.0)
        } else {
            let error_energy = errors.iter().map(|e| e * e).sum::<f64>();
            let residual_rms = (error_energy / chunk.len() as f64).sqrt();
            (residual_rms, cancellation_db(rms_level(&chunk.samples), residual_rms))
        };

        Ok(FilteredChunk {
            output,
            residual_rms,
            cancellation_db,
            instabilities: report.instabilities,
            last_instability: report.last_instability,
        })
    }
}

/// `20 * log10(input / (residual + floor))`; silent input counts as 0 dB.
pub fn cancellation_db(input_rms: f64, residual_rms: f64) -> f64 {
    if input_rms <= 0.0 {
        return 0.0;
    }
    20.0 * (input_rms / (residual_rms + RMS_FLOOR)).log10()
}

/// Root-mean-square of finite samples, non-finite ones counted as silence.
pub fn rms_level(samples: &[f32]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }

    let sum = samples
        .iter()
        .filter(|s| s.is_finite())
        .map(|&s| {
            let v = s as f64;
            v * v
        })
        .sum::<f64>();
    (sum / samples.len() as f64).sqrt()
}
