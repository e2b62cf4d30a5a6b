//! Session and engine configuration.
//!
//! `SessionConfig` travels with create requests from the transport layer and
//! uses camelCase field names. `EngineConfig` is read once at startup from a
//! TOML file.

use std::path::Path;
use std::time::Duration;

use nlms_core::{NlmsOptions, PowerMode};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{AncError, Result};

pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;
pub const MAX_CHUNK_SAMPLES: usize = 4096;
pub const MAX_FILTER_ORDER: usize = 4096;
pub const DEFAULT_EPSILON: f64 = nlms_core::DEFAULT_EPSILON;
pub const DEFAULT_NORM_CEILING: f64 = nlms_core::DEFAULT_NORM_CEILING;
pub const DEFAULT_HAZARD_THRESHOLD: f32 = 0.70;
pub const DEFAULT_METRICS_WINDOW: usize = 100;

/// Filter presets. Both run the same NLMS update; they differ in default
/// order and step size, and in how the history power is obtained.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AlgorithmVariant {
    NlmsLightweight,
    #[default]
    NlmsFull,
}

impl AlgorithmVariant {
    pub fn default_order(self) -> usize {
        match self {
            Self::NlmsLightweight => 128,
            Self::NlmsFull => 256,
        }
    }

    pub fn default_mu(self) -> f64 {
        match self {
            Self::NlmsLightweight => 0.05,
            Self::NlmsFull => 0.01,
        }
    }

    pub fn power_mode(self) -> PowerMode {
        match self {
            Self::NlmsLightweight => PowerMode::Running,
            Self::NlmsFull => PowerMode::Exact,
        }
    }
}

/// Per-session configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "RawSessionConfig")]
pub struct SessionConfig {
    pub sample_rate: u32,
    /// Number of taps. Fixed for the lifetime of the session.
    pub filter_order: usize,
    pub mu: f64,
    pub epsilon: f64,
    /// Scale applied to the anti-noise before emission, 0.0 to 1.0.
    pub intensity: f32,
    pub algorithm: AlgorithmVariant,
    /// Skip the hazard policy and always cancel.
    pub bypass_ml: bool,
    pub weight_norm_ceiling: f64,
}

impl SessionConfig {
    pub fn preset(algorithm: AlgorithmVariant) -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            filter_order: algorithm.default_order(),
            mu: algorithm.default_mu(),
            epsilon: DEFAULT_EPSILON,
            intensity: 1.0,
            algorithm,
            bypass_ml: false,
            weight_norm_ceiling: DEFAULT_NORM_CEILING,
        }
    }

    pub fn validate(&self, engine_rate: u32) -> Result<()> {
        if self.sample_rate != engine_rate {
            return Err(AncError::invalid_config(format!(
                "sample rate {}Hz differs from engine rate {}Hz",
                self.sample_rate, engine_rate
            )));
        }
        if self.filter_order == 0 || self.filter_order > MAX_FILTER_ORDER {
            return Err(AncError::invalid_config(format!(
                "filter order {} outside 1..={}",
                self.filter_order, MAX_FILTER_ORDER
            )));
        }
        validate_mu(self.mu)?;
        validate_intensity(self.intensity)?;
        if !self.epsilon.is_finite() || self.epsilon < 0.0 {
            return Err(AncError::invalid_config(format!(
                "epsilon {} must be finite and non-negative",
                self.epsilon
            )));
        }
        if !self.weight_norm_ceiling.is_finite() || self.weight_norm_ceiling <= 0.0 {
            return Err(AncError::invalid_config(format!(
                "weight norm ceiling {} must be finite and positive",
                self.weight_norm_ceiling
            )));
        }
        Ok(())
    }

    /// Returns the configuration with `update` applied.
    ///
    /// Order and sample rate may be repeated but not changed. A new algorithm
    /// brings its step-size preset unless the update also sets `mu`.
    pub fn apply(&self, update: &SettingsUpdate) -> Result<SessionConfig> {
        if update.filter_order.is_some_and(|n| n != self.filter_order) {
            return Err(AncError::ImmutableConfig {
                field: "filterOrder",
            });
        }
        if update.sample_rate.is_some_and(|r| r != self.sample_rate) {
            return Err(AncError::ImmutableConfig {
                field: "sampleRate",
            });
        }

        let mut next = self.clone();
        if let Some(algorithm) = update.algorithm {
            if algorithm != next.algorithm {
                next.algorithm = algorithm;
                next.mu = algorithm.default_mu();
            }
        }
        if let Some(mu) = update.mu {
            validate_mu(mu)?;
            next.mu = mu;
        }
        if let Some(intensity) = update.intensity {
            validate_intensity(intensity)?;
            next.intensity = intensity;
        }
        if let Some(bypass_ml) = update.bypass_ml {
            next.bypass_ml = bypass_ml;
        }
        Ok(next)
    }

    pub(crate) fn filter_options(&self) -> NlmsOptions {
        NlmsOptions::new(self.filter_order, self.mu)
            .epsilon(self.epsilon)
            .norm_ceiling(self.weight_norm_ceiling)
            .power(self.algorithm.power_mode())
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::preset(AlgorithmVariant::default())
    }
}

/// Wire form of [`SessionConfig`]; absent fields come from the preset of the
/// requested algorithm rather than from a fixed default.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawSessionConfig {
    sample_rate: Option<u32>,
    filter_order: Option<usize>,
    mu: Option<f64>,
    epsilon: Option<f64>,
    intensity: Option<f32>,
    algorithm: Option<AlgorithmVariant>,
    bypass_ml: Option<bool>,
    weight_norm_ceiling: Option<f64>,
}

impl From<RawSessionConfig> for SessionConfig {
    fn from(raw: RawSessionConfig) -> Self {
        let preset = SessionConfig::preset(raw.algorithm.unwrap_or_default());
        Self {
            sample_rate: raw.sample_rate.unwrap_or(preset.sample_rate),
            filter_order: raw.filter_order.unwrap_or(preset.filter_order),
            mu: raw.mu.unwrap_or(preset.mu),
            epsilon: raw.epsilon.unwrap_or(preset.epsilon),
            intensity: raw.intensity.unwrap_or(preset.intensity),
            algorithm: preset.algorithm,
            bypass_ml: raw.bypass_ml.unwrap_or(preset.bypass_ml),
            weight_norm_ceiling: raw.weight_norm_ceiling.unwrap_or(preset.weight_norm_ceiling),
        }
    }
}

/// Partial settings change for a live session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SettingsUpdate {
    pub intensity: Option<f32>,
    pub bypass_ml: Option<bool>,
    pub mu: Option<f64>,
    pub algorithm: Option<AlgorithmVariant>,
    pub filter_order: Option<usize>,
    pub sample_rate: Option<u32>,
}

fn validate_mu(mu: f64) -> Result<()> {
    if !mu.is_finite() || mu <= 0.0 {
        return Err(AncError::invalid_config(format!(
            "mu {mu} must be finite and positive"
        )));
    }
    Ok(())
}

fn validate_intensity(intensity: f32) -> Result<()> {
    if !(0.0..=1.0).contains(&intensity) {
        return Err(AncError::invalid_config(format!(
            "intensity {intensity} outside 0.0..=1.0"
        )));
    }
    Ok(())
}

/// Engine-wide settings shared by every session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Operating rate; every session must match it.
    pub sample_rate: u32,
    pub max_chunk_samples: usize,
    /// Classifier labels that trigger a hazard bypass.
    pub hazard_labels: Vec<String>,
    pub hazard_threshold: f32,
    /// Upper bound on waiting for a classification. When unset the real-time
    /// duration of the chunk is used.
    pub classification_deadline_ms: Option<u64>,
    /// Number of recent chunks averaged in stats.
    pub metrics_window: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            max_chunk_samples: MAX_CHUNK_SAMPLES,
            hazard_labels: vec!["alarm".to_string(), "siren".to_string()],
            hazard_threshold: DEFAULT_HAZARD_THRESHOLD,
            classification_deadline_ms: None,
            metrics_window: DEFAULT_METRICS_WINDOW,
        }
    }
}

impl EngineConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: EngineConfig = toml::from_str(content)
            .map_err(|e| AncError::Config(format!("Parse TOML failed: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        info!(path = %path.display(), "loaded engine configuration");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 {
            return Err(AncError::Config("sample_rate must be positive".into()));
        }
        if self.max_chunk_samples == 0 || self.max_chunk_samples > MAX_CHUNK_SAMPLES {
            return Err(AncError::Config(format!(
                "max_chunk_samples {} outside 1..={}",
                self.max_chunk_samples, MAX_CHUNK_SAMPLES
            )));
        }
        if !(0.0..=1.0).contains(&self.hazard_threshold) {
            return Err(AncError::Config(format!(
                "hazard_threshold {} outside 0.0..=1.0",
                self.hazard_threshold
            )));
        }
        if self.metrics_window == 0 {
            return Err(AncError::Config("metrics_window must be positive".into()));
        }
        Ok(())
    }

    /// How long the audio path may wait for a classification of a chunk of
    /// `chunk_len` samples.
    pub fn classification_deadline(&self, chunk_len: usize) -> Duration {
        match self.classification_deadline_ms {
            Some(ms) => Duration::from_millis(ms),
            None => Duration::from_secs_f64(chunk_len as f64 / self.sample_rate as f64),
        }
    }
}
