//! Sessions and the registry that owns them.
//!
//! The registry lock only guards the id map and is never held while a chunk
//! is processed. Each session sits behind its own lock, which serialises
//! chunk processing, settings changes and ending for that session.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use nlms_core::NlmsFilter;
use parking_lot::{Mutex, MutexGuard};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::chunk::{AudioChunk, ChunkProcessor, ChunkResult, rms_level};
use crate::config::{SessionConfig, SettingsUpdate};
use crate::error::{AncError, Result};
use crate::hazard::{ClassificationResult, ClassifierWorker, HazardPolicy};
use crate::metrics::{FinalStats, MetricsWindow, SessionStats};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Created,
    Active,
    Ended,
}

/// One client stream: its configuration, filter and counters.
#[derive(Debug)]
pub struct Session {
    id: String,
    config: SessionConfig,
    state: SessionState,
    /// Released when the session ends.
    filter: Option<NlmsFilter>,
    metrics: Option<MetricsWindow>,
    classifier: Option<Arc<ClassifierWorker>>,
    last_sequence: Option<u64>,
    chunks_processed: u64,
    emergency_count: u64,
    degraded_count: u64,
    gap_count: u64,
    filter_resets: u64,
    last_activity: Instant,
    final_stats: Option<FinalStats>,
}

impl Session {
    /// Allocates a zeroed filter of `config.filter_order` taps. The
    /// configuration is expected to be validated already.
    pub fn new(id: impl Into<String>, config: SessionConfig, metrics_window: usize) -> Self {
        let filter = NlmsFilter::with_options(config.filter_options());
        Self {
            id: id.into(),
            config,
            state: SessionState::Created,
            filter: Some(filter),
            metrics: Some(MetricsWindow::new(metrics_window)),
            classifier: None,
            last_sequence: None,
            chunks_processed: 0,
            emergency_count: 0,
            degraded_count: 0,
            gap_count: 0,
            filter_resets: 0,
            last_activity: Instant::now(),
            final_stats: None,
        }
    }

    /// Gives the session a classifier worker of its own.
    pub fn with_classifier(mut self, worker: ClassifierWorker) -> Self {
        self.classifier = Some(Arc::new(worker));
        self
    }

    /// The session's worker, unless the session ended or has none.
    pub fn classifier(&self) -> Option<Arc<ClassifierWorker>> {
        self.classifier.clone()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn filter(&self) -> Option<&NlmsFilter> {
        self.filter.as_ref()
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    /// Checks that the session is live, the chunk is acceptable and
    /// `sequence` follows the last accepted one. Returns whether a gap
    /// precedes `sequence`. Nothing is mutated.
    pub fn admit(
        &self,
        sequence: u64,
        chunk: &AudioChunk,
        processor: &ChunkProcessor,
    ) -> Result<bool> {
        if self.state == SessionState::Ended {
            return Err(AncError::session_ended(&self.id));
        }
        processor.validate(chunk, &self.config)?;
        let Some(last) = self.last_sequence else {
            return Ok(false);
        };
        if sequence <= last {
            warn!(session_id = %self.id, last, sequence, "rejecting out-of-order chunk");
            return Err(AncError::OutOfOrderChunk {
                last,
                got: sequence,
            });
        }
        Ok(sequence > last + 1)
    }

    /// Validates, sequences and processes one chunk. Latency is measured
    /// from `received`.
    ///
    /// Any error leaves the session exactly as it was.
    pub fn process_chunk(
        &mut self,
        sequence: u64,
        chunk: &AudioChunk,
        classification: Option<&ClassificationResult>,
        policy: &HazardPolicy,
        processor: &ChunkProcessor,
        received: Instant,
    ) -> Result<ChunkResult> {
        let gap = self.admit(sequence, chunk, processor)?;
        let (Some(filter), Some(metrics)) = (self.filter.as_mut(), self.metrics.as_mut()) else {
            return Err(AncError::session_ended(&self.id));
        };
        if gap {
            if let Some(last) = self.last_sequence {
                warn!(session_id = %self.id, missing = sequence - last - 1, "sequence gap");
            }
        }

        let decision = policy.decide(&self.config, classification);
        let result = if decision.apply_anc {
            let filtered = processor.process(filter, &self.config, chunk)?;
            if let Some(instability) = filtered.last_instability {
                warn!(
                    session_id = %self.id,
                    sequence,
                    resets = filtered.instabilities,
                    %instability,
                    "filter reset during chunk"
                );
            }
            ChunkResult {
                sequence,
                degraded: filtered.degraded(),
                output: filtered.output,
                residual_rms: filtered.residual_rms,
                cancellation_db: filtered.cancellation_db,
                latency_ms: elapsed_ms(received),
                is_emergency: false,
            }
        } else {
            info!(
                session_id = %self.id,
                sequence,
                label = classification.map(|c| c.label.as_str()).unwrap_or_default(),
                "hazard detected, passing chunk through"
            );
            ChunkResult {
                sequence,
                output: chunk.samples.clone(),
                residual_rms: rms_level(&chunk.samples),
                cancellation_db: 0.0,
                latency_ms: elapsed_ms(received),
                is_emergency: true,
                degraded: false,
            }
        };

        metrics.record(
            (!result.is_emergency).then_some(result.cancellation_db),
            result.latency_ms,
        );
        self.last_sequence = Some(sequence);
        self.chunks_processed += 1;
        if gap {
            self.gap_count += 1;
        }
        if result.is_emergency {
            self.emergency_count += 1;
        }
        if result.degraded {
            self.degraded_count += 1;
        }
        self.filter_resets = filter.resets();
        self.state = SessionState::Active;
        self.last_activity = Instant::now();

        debug!(
            session_id = %self.id,
            sequence,
            samples = chunk.len(),
            cancellation_db = result.cancellation_db,
            latency_ms = result.latency_ms,
            "chunk processed"
        );
        Ok(result)
    }

    /// Applies a live settings change without reallocating the filter.
    pub fn update_settings(&mut self, update: &SettingsUpdate) -> Result<SessionConfig> {
        let Some(filter) = self.filter.as_mut() else {
            return Err(AncError::session_ended(&self.id));
        };
        let next = self.config.apply(update)?;
        if next.mu != self.config.mu {
            filter.set_mu(next.mu);
        }
        if next.algorithm != self.config.algorithm {
            filter.set_power_mode(next.algorithm.power_mode());
        }
        self.config = next;
        self.last_activity = Instant::now();
        Ok(self.config.clone())
    }

    pub fn stats(&self) -> SessionStats {
        if let Some(stats) = &self.final_stats {
            return stats.clone();
        }
        let (avg_cancellation_db, avg_latency_ms) = self
            .metrics
            .as_ref()
            .map(|m| (m.avg_cancellation_db(), m.avg_latency_ms()))
            .unwrap_or_default();
        SessionStats {
            chunks_processed: self.chunks_processed,
            avg_cancellation_db,
            avg_latency_ms,
            emergency_count: self.emergency_count,
            degraded_count: self.degraded_count,
            gap_count: self.gap_count,
            filter_resets: self.filter_resets,
            state: self.state,
        }
    }

    /// Freezes the stats and releases the filter and metrics window.
    pub fn end(&mut self) -> Result<FinalStats> {
        if self.state == SessionState::Ended {
            return Err(AncError::session_ended(&self.id));
        }
        self.state = SessionState::Ended;
        let stats = self.stats();
        self.final_stats = Some(stats.clone());
        self.filter = None;
        self.metrics = None;
        self.classifier = None;
        Ok(stats)
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1e3
}

/// Registry entry. The ended flag is readable without the session lock so
/// lookups never wait behind an in-flight chunk.
#[derive(Debug)]
pub struct SessionSlot {
    ended: AtomicBool,
    session: Mutex<Session>,
}

impl SessionSlot {
    fn new(session: Session) -> Self {
        Self {
            ended: AtomicBool::new(session.state() == SessionState::Ended),
            session: Mutex::new(session),
        }
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    /// Exclusive access to the session. Held for the whole of a chunk.
    pub fn lock(&self) -> MutexGuard<'_, Session> {
        self.session.lock()
    }

    /// Ends the session once any in-flight chunk has finished.
    pub fn end(&self) -> Result<FinalStats> {
        let mut session = self.session.lock();
        self.finish(&mut session)
    }

    /// Ends the session if it has been idle for at least `max_idle`.
    pub fn end_if_idle(&self, max_idle: Duration) -> Option<FinalStats> {
        let mut session = self.session.lock();
        if session.state() == SessionState::Ended || session.idle_for() < max_idle {
            return None;
        }
        self.finish(&mut session).ok()
    }

    fn finish(&self, session: &mut Session) -> Result<FinalStats> {
        let stats = session.end()?;
        self.ended.store(true, Ordering::Release);
        Ok(stats)
    }
}

/// Shared id → session map.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<SessionSlot>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `session`, replacing an ended session with the same id.
    pub fn insert(&self, session: Session) -> Result<Arc<SessionSlot>> {
        let mut sessions = self.sessions.lock();
        if let Some(existing) = sessions.get(session.id()) {
            if !existing.is_ended() {
                return Err(AncError::DuplicateSession {
                    id: session.id().to_string(),
                });
            }
        }
        let id = session.id().to_string();
        let slot = Arc::new(SessionSlot::new(session));
        sessions.insert(id, Arc::clone(&slot));
        Ok(slot)
    }

    pub fn get(&self, id: &str) -> Option<Arc<SessionSlot>> {
        self.sessions.lock().get(id).cloned()
    }

    /// All live and ended slots, cloned out so the registry lock is released.
    pub fn slots(&self) -> Vec<(String, Arc<SessionSlot>)> {
        self.sessions
            .lock()
            .iter()
            .map(|(id, slot)| (id.clone(), Arc::clone(slot)))
            .collect()
    }

    /// Forgets ended sessions and returns how many were dropped.
    pub fn remove_ended(&self) -> usize {
        let mut sessions = self.sessions.lock();
        let before = sessions.len();
        sessions.retain(|_, slot| !slot.is_ended());
        before - sessions.len()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    fn session(id: &str) -> Session {
        Session::new(id, SessionConfig::default(), 10)
    }

    fn tools() -> (HazardPolicy, ChunkProcessor) {
        let config = EngineConfig::default();
        (
            HazardPolicy::from_config(&config),
            ChunkProcessor::new(config.max_chunk_samples),
        )
    }

    fn chunk(len: usize) -> AudioChunk {
        AudioChunk::new(48_000, (0..len).map(|n| (n as f32 * 0.05).sin() * 0.4).collect())
    }

    #[test]
    fn first_chunk_activates_session() {
        let (policy, processor) = tools();
        let mut session = session("a");
        assert_eq!(session.state(), SessionState::Created);
        session
            .process_chunk(7, &chunk(256), None, &policy, &processor, Instant::now())
            .unwrap();
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(session.stats().chunks_processed, 1);
    }

    #[test]
    fn admit_checks_without_advancing() {
        let (policy, processor) = tools();
        let mut session = session("a");
        assert!(!session.admit(4, &chunk(64), &processor).unwrap());
        session
            .process_chunk(4, &chunk(64), None, &policy, &processor, Instant::now())
            .unwrap();

        assert!(!session.admit(5, &chunk(64), &processor).unwrap());
        assert!(session.admit(9, &chunk(64), &processor).unwrap());
        assert!(matches!(
            session.admit(4, &chunk(64), &processor),
            Err(AncError::OutOfOrderChunk { last: 4, got: 4 })
        ));
        assert!(matches!(
            session.admit(5, &chunk(5000), &processor),
            Err(AncError::ChunkSize { .. })
        ));
        assert_eq!(session.stats().chunks_processed, 1);

        session.end().unwrap();
        assert!(session.classifier().is_none());
        assert!(matches!(
            session.admit(5, &chunk(64), &processor),
            Err(AncError::SessionEnded { .. })
        ));
    }

    #[test]
    fn stale_sequence_is_rejected_without_side_effects() {
        let (policy, processor) = tools();
        let mut session = session("a");
        session
            .process_chunk(1, &chunk(128), None, &policy, &processor, Instant::now())
            .unwrap();
        let weights = session.filter().unwrap().weights().to_vec();

        for stale in [0, 1] {
            let err = session
                .process_chunk(stale, &chunk(128), None, &policy, &processor, Instant::now())
                .unwrap_err();
            assert!(matches!(err, AncError::OutOfOrderChunk { last: 1, .. }));
        }
        assert_eq!(session.filter().unwrap().weights(), weights.as_slice());
        assert_eq!(session.stats().chunks_processed, 1);
    }

    #[test]
    fn gaps_are_accepted_and_counted() {
        let (policy, processor) = tools();
        let mut session = session("a");
        for sequence in [0, 1, 5, 6] {
            session
                .process_chunk(sequence, &chunk(64), None, &policy, &processor, Instant::now())
                .unwrap();
        }
        let stats = session.stats();
        assert_eq!(stats.chunks_processed, 4);
        assert_eq!(stats.gap_count, 1);
    }

    #[test]
    fn live_mu_change_keeps_filter_state() {
        let (policy, processor) = tools();
        let mut session = session("a");
        session
            .process_chunk(0, &chunk(512), None, &policy, &processor, Instant::now())
            .unwrap();
        let weights = session.filter().unwrap().weights().to_vec();

        let config = session
            .update_settings(&SettingsUpdate {
                mu: Some(0.2),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(config.mu, 0.2);
        assert_eq!(session.filter().unwrap().mu(), 0.2);
        assert_eq!(session.filter().unwrap().weights(), weights.as_slice());
    }

    #[test]
    fn end_releases_filter_and_freezes_stats() {
        let (policy, processor) = tools();
        let mut session = session("a");
        session
            .process_chunk(0, &chunk(256), None, &policy, &processor, Instant::now())
            .unwrap();
        let stats = session.end().unwrap();
        assert_eq!(stats.state, SessionState::Ended);
        assert!(session.filter().is_none());
        assert_eq!(session.stats(), stats);
        assert!(matches!(session.end(), Err(AncError::SessionEnded { .. })));
        assert!(matches!(
            session.process_chunk(1, &chunk(16), None, &policy, &processor, Instant::now()),
            Err(AncError::SessionEnded { .. })
        ));
    }

    #[test]
    fn registry_rejects_live_duplicates_but_reuses_ended_ids() {
        let registry = SessionRegistry::new();
        let first = registry.insert(session("a")).unwrap();
        assert!(matches!(
            registry.insert(session("a")),
            Err(AncError::DuplicateSession { .. })
        ));

        first.end().unwrap();
        let second = registry.insert(session("a")).unwrap();
        assert!(!second.is_ended());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn remove_ended_drops_only_ended_slots() {
        let registry = SessionRegistry::new();
        registry.insert(session("a")).unwrap().end().unwrap();
        registry.insert(session("b")).unwrap();
        assert_eq!(registry.remove_ended(), 1);
        assert!(registry.get("a").is_none());
        assert!(registry.get("b").is_some());
    }
}
