//! Adaptive noise-cancellation engine with hazard bypass.
//!
//! Callers create a session per audio stream, feed it numbered chunks and get
//! anti-noise back. When an external classifier reports an alarm or siren the
//! chunk is passed through untouched instead of being cancelled.
//!
//! ```no_run
//! use std::sync::Arc;
//! use ancguard::{AncEngine, AudioChunk, EngineConfig, SessionConfig, SessionRegistry};
//!
//! let engine = AncEngine::new(EngineConfig::default(), Arc::new(SessionRegistry::new()))?;
//! engine.create_session("client-1", SessionConfig::default())?;
//! let chunk = AudioChunk::new(48_000, vec![0.0; 512]);
//! let result = engine.process_chunk("client-1", 0, &chunk, None)?;
//! assert_eq!(result.output.len(), 512);
//! let stats = engine.end_session("client-1")?;
//! # let _ = stats;
//! # Ok::<(), ancguard::AncError>(())
//! ```

pub mod chunk;
pub mod config;
pub mod engine;
pub mod error;
pub mod hazard;
pub mod metrics;
pub mod session;

pub use chunk::{AudioChunk, ChunkProcessor, ChunkResult};
pub use config::{AlgorithmVariant, EngineConfig, SessionConfig, SettingsUpdate};
pub use engine::{AncEngine, SessionInfo};
pub use error::{AncError, Result};
pub use hazard::{
    BypassDecision, ClassificationResult, ClassifierWorker, HazardClassifier, HazardPolicy,
};
pub use metrics::{FinalStats, SessionStats};
pub use session::{SessionRegistry, SessionState};

/// Installs a `tracing` subscriber filtered by `ANCGUARD_LOG`, defaulting to
/// `info`. Meant for binaries; calling it twice is harmless.
pub fn init_logging() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_env("ANCGUARD_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
