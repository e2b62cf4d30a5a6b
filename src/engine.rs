//! The engine's public API, consumed by transport-layer handlers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info};

use crate::chunk::{AudioChunk, ChunkProcessor, ChunkResult};
use crate::config::{EngineConfig, SessionConfig, SettingsUpdate};
use crate::error::{AncError, Result};
use crate::hazard::{ClassificationResult, ClassifierWorker, HazardClassifier, HazardPolicy};
use crate::metrics::{FinalStats, SessionStats};
use crate::session::{Session, SessionRegistry, SessionSlot, SessionState};

/// Returned from [`AncEngine::create_session`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub config: SessionConfig,
    pub state: SessionState,
}

pub struct AncEngine {
    config: EngineConfig,
    registry: Arc<SessionRegistry>,
    policy: HazardPolicy,
    processor: ChunkProcessor,
    classifier: Option<Arc<dyn HazardClassifier>>,
}

impl AncEngine {
    pub fn new(config: EngineConfig, registry: Arc<SessionRegistry>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            policy: HazardPolicy::from_config(&config),
            processor: ChunkProcessor::new(config.max_chunk_samples),
            config,
            registry,
            classifier: None,
        })
    }

    /// Attaches the classifier consulted by
    /// [`process_chunk_classified`](Self::process_chunk_classified). Each
    /// session created afterwards runs it on a worker thread of its own.
    pub fn with_classifier(mut self, classifier: impl HazardClassifier + 'static) -> Self {
        let classifier: Arc<dyn HazardClassifier> = Arc::new(classifier);
        self.classifier = Some(classifier);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn create_session(&self, session_id: &str, config: SessionConfig) -> Result<SessionInfo> {
        config.validate(self.config.sample_rate)?;
        let mut session = Session::new(session_id, config.clone(), self.config.metrics_window);
        if let Some(classifier) = &self.classifier {
            let worker =
                ClassifierWorker::spawn(&format!("classify-{session_id}"), Arc::clone(classifier))?;
            session = session.with_classifier(worker);
        }
        self.registry.insert(session)?;
        info!(
            session_id,
            filter_order = config.filter_order,
            algorithm = ?config.algorithm,
            bypass_ml = config.bypass_ml,
            "session created"
        );
        Ok(SessionInfo {
            session_id: session_id.to_string(),
            config,
            state: SessionState::Created,
        })
    }

    /// Processes one chunk with a classification the caller already holds.
    pub fn process_chunk(
        &self,
        session_id: &str,
        sequence: u64,
        chunk: &AudioChunk,
        classification: Option<&ClassificationResult>,
    ) -> Result<ChunkResult> {
        let received = Instant::now();
        let slot = self.slot(session_id)?;
        let mut session = slot.lock();
        session.process_chunk(
            sequence,
            chunk,
            classification,
            &self.policy,
            &self.processor,
            received,
        )
    }

    /// Asks the session's classifier about the chunk, waiting no longer than
    /// the classification deadline, then processes it. Reported latency
    /// includes the wait.
    ///
    /// Chunks that would be rejected are rejected before the classifier is
    /// consulted. Without a classifier, or for `bypass_ml` sessions, this is
    /// [`process_chunk`](Self::process_chunk) with no classification.
    pub fn process_chunk_classified(
        &self,
        session_id: &str,
        sequence: u64,
        chunk: &AudioChunk,
    ) -> Result<ChunkResult> {
        let received = Instant::now();
        let slot = self.slot(session_id)?;
        let worker = {
            let session = slot.lock();
            session.admit(sequence, chunk, &self.processor)?;
            if session.config().bypass_ml {
                None
            } else {
                session.classifier()
            }
        };

        let classification = worker.and_then(|worker| {
            let deadline = self.config.classification_deadline(chunk.len());
            let verdict = worker.classify(&chunk.samples, deadline);
            if verdict.is_none() {
                debug!(session_id, sequence, "no classification, cancelling by default");
            }
            verdict
        });

        let mut session = slot.lock();
        session.process_chunk(
            sequence,
            chunk,
            classification.as_ref(),
            &self.policy,
            &self.processor,
            received,
        )
    }

    /// Changes intensity, step size, algorithm preset or the ML bypass of a
    /// live session.
    pub fn update_settings(
        &self,
        session_id: &str,
        update: &SettingsUpdate,
    ) -> Result<SessionConfig> {
        let slot = self.slot(session_id)?;
        let config = slot.lock().update_settings(update)?;
        info!(session_id, ?update, "session settings updated");
        Ok(config)
    }

    /// Ends the session after any in-flight chunk and returns its final stats.
    pub fn end_session(&self, session_id: &str) -> Result<FinalStats> {
        let slot = self.slot(session_id)?;
        let stats = slot.end()?;
        info!(
            session_id,
            chunks = stats.chunks_processed,
            avg_cancellation_db = stats.avg_cancellation_db,
            emergencies = stats.emergency_count,
            "session ended"
        );
        Ok(stats)
    }

    /// Current stats, or the frozen final stats of an ended session.
    pub fn get_stats(&self, session_id: &str) -> Result<SessionStats> {
        Ok(self.slot(session_id)?.lock().stats())
    }

    /// Copy of the session's current filter weights.
    pub fn filter_weights(&self, session_id: &str) -> Result<Vec<f64>> {
        let slot = self.slot(session_id)?;
        let session = slot.lock();
        session
            .filter()
            .map(|f| f.weights().to_vec())
            .ok_or_else(|| AncError::session_ended(session_id))
    }

    /// Ends every live session idle for at least `max_idle`.
    pub fn sweep_idle(&self, max_idle: Duration) -> Vec<(String, FinalStats)> {
        let mut ended = Vec::new();
        for (id, slot) in self.registry.slots() {
            if slot.is_ended() {
                continue;
            }
            if let Some(stats) = slot.end_if_idle(max_idle) {
                info!(session_id = %id, "idle session ended");
                ended.push((id, stats));
            }
        }
        ended
    }

    /// Drops ended sessions from the registry; their stats are no longer
    /// retrievable afterwards.
    pub fn purge_ended(&self) -> usize {
        let removed = self.registry.remove_ended();
        if removed > 0 {
            debug!(removed, "purged ended sessions");
        }
        removed
    }

    pub fn session_count(&self) -> usize {
        self.registry.len()
    }

    fn slot(&self, session_id: &str) -> Result<Arc<SessionSlot>> {
        self.registry
            .get(session_id)
            .ok_or_else(|| AncError::unknown_session(session_id))
    }
}
