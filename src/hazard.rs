//! Hazard bypass policy and the bounded-wait classifier seam.
//!
//! The classifier itself lives outside this crate. The engine only sees its
//! verdict, and never waits for it longer than the configured deadline.

use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{EngineConfig, SessionConfig};

/// Verdict produced by an external sound classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub label: String,
    pub confidence: f32,
    pub timestamp: SystemTime,
}

impl ClassificationResult {
    pub fn new(label: impl Into<String>, confidence: f32) -> Self {
        Self {
            label: label.into(),
            confidence,
            timestamp: SystemTime::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BypassDecision {
    pub apply_anc: bool,
    pub is_emergency: bool,
}

impl BypassDecision {
    pub const CANCEL: Self = Self {
        apply_anc: true,
        is_emergency: false,
    };
    pub const PASS_THROUGH: Self = Self {
        apply_anc: false,
        is_emergency: true,
    };
}

/// Decides per chunk whether cancellation is suppressed so a hazard stays audible.
#[derive(Debug, Clone)]
pub struct HazardPolicy {
    labels: Vec<String>,
    threshold: f32,
}

impl HazardPolicy {
    pub fn new(labels: Vec<String>, threshold: f32) -> Self {
        Self { labels, threshold }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.hazard_labels.clone(), config.hazard_threshold)
    }

    pub fn is_hazard(&self, classification: &ClassificationResult) -> bool {
        classification.confidence >= self.threshold
            && self
                .labels
                .iter()
                .any(|l| l.eq_ignore_ascii_case(&classification.label))
    }

    /// `bypass_ml` sessions always cancel. Otherwise a hazard label at or
    /// above the threshold passes the chunk through; a missing
    /// classification cancels.
    pub fn decide(
        &self,
        config: &SessionConfig,
        classification: Option<&ClassificationResult>,
    ) -> BypassDecision {
        if config.bypass_ml {
            return BypassDecision::CANCEL;
        }
        match classification {
            Some(c) if self.is_hazard(c) => BypassDecision::PASS_THROUGH,
            _ => BypassDecision::CANCEL,
        }
    }
}

/// External sound classifier, shared by every session's worker. Calls may
/// block; callers bound the wait through [`ClassifierWorker`].
pub trait HazardClassifier: Send + Sync {
    fn classify(&self, samples: &[f32]) -> Option<ClassificationResult>;
}

impl<F> HazardClassifier for F
where
    F: Fn(&[f32]) -> Option<ClassificationResult> + Send + Sync,
{
    fn classify(&self, samples: &[f32]) -> Option<ClassificationResult> {
        self(samples)
    }
}

struct Request {
    samples: Vec<f32>,
    deadline: Instant,
    reply: Sender<Option<ClassificationResult>>,
}

/// Runs a classifier on its own thread and answers within a deadline.
///
/// The engine gives every session its own worker, so a slow verdict for one
/// stream never holds up another. Dropping the worker closes its queue; the
/// thread exits once any call in progress returns and is never joined.
#[derive(Debug)]
pub struct ClassifierWorker {
    requests: Sender<Request>,
}

impl ClassifierWorker {
    pub fn spawn(name: &str, classifier: Arc<dyn HazardClassifier>) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel();
        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || run_classifier(classifier, rx))?;
        Ok(Self { requests: tx })
    }

    /// Returns the classifier's verdict, or `None` if it does not arrive
    /// within `timeout`.
    pub fn classify(&self, samples: &[f32], timeout: Duration) -> Option<ClassificationResult> {
        let (reply_tx, reply_rx) = mpsc::channel();
        let request = Request {
            samples: samples.to_vec(),
            deadline: Instant::now() + timeout,
            reply: reply_tx,
        };
        if self.requests.send(request).is_err() {
            warn!("classifier thread has stopped");
            return None;
        }

        match reply_rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                warn!(timeout_ms = timeout.as_secs_f64() * 1e3, "classification missed deadline");
                None
            }
            Err(RecvTimeoutError::Disconnected) => None,
        }
    }
}

fn run_classifier(classifier: Arc<dyn HazardClassifier>, requests: Receiver<Request>) {
    for request in requests {
        if Instant::now() >= request.deadline {
            debug!("dropping stale classification request");
            continue;
        }
        let result = classifier.classify(&request.samples);
        // The caller may have given up already.
        let _ = request.reply.send(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> HazardPolicy {
        HazardPolicy::from_config(&EngineConfig::default())
    }

    #[test]
    fn confident_alarm_passes_through() {
        let decision = policy().decide(
            &SessionConfig::default(),
            Some(&ClassificationResult::new("alarm", 0.85)),
        );
        assert_eq!(decision, BypassDecision::PASS_THROUGH);
    }

    #[test]
    fn threshold_is_inclusive() {
        let policy = policy();
        let config = SessionConfig::default();
        let at = ClassificationResult::new("siren", 0.70);
        let below = ClassificationResult::new("siren", 0.69);
        assert!(policy.decide(&config, Some(&at)).is_emergency);
        assert!(policy.decide(&config, Some(&below)).apply_anc);
    }

    #[test]
    fn labels_match_case_insensitively() {
        let policy = HazardPolicy::new(vec!["Alarm".into()], 0.5);
        assert!(policy.is_hazard(&ClassificationResult::new("ALARM", 0.9)));
        assert!(!policy.is_hazard(&ClassificationResult::new("speech", 0.99)));
    }

    #[test]
    fn bypass_ml_ignores_classifier() {
        let mut config = SessionConfig::default();
        config.bypass_ml = true;
        let decision = policy().decide(&config, Some(&ClassificationResult::new("alarm", 1.0)));
        assert_eq!(decision, BypassDecision::CANCEL);
    }

    #[test]
    fn missing_classification_cancels() {
        assert_eq!(
            policy().decide(&SessionConfig::default(), None),
            BypassDecision::CANCEL
        );
    }

    #[test]
    fn worker_answers_within_deadline() {
        let worker = ClassifierWorker::spawn("peak", Arc::new(|samples: &[f32]| {
            let peak = samples.iter().fold(0.0f32, |m, s| m.max(s.abs()));
            Some(ClassificationResult::new(
                if peak > 0.5 { "alarm" } else { "ambient" },
                0.9,
            ))
        }))
        .unwrap();

        let loud = worker.classify(&[0.9; 64], Duration::from_secs(1)).unwrap();
        assert_eq!(loud.label, "alarm");
        let quiet = worker.classify(&[0.1; 64], Duration::from_secs(1)).unwrap();
        assert_eq!(quiet.label, "ambient");
    }

    #[test]
    fn slow_classifier_times_out() {
        let worker = ClassifierWorker::spawn("slow", Arc::new(|_: &[f32]| {
            thread::sleep(Duration::from_millis(200));
            Some(ClassificationResult::new("alarm", 1.0))
        }))
        .unwrap();

        let started = Instant::now();
        assert!(worker.classify(&[0.0; 16], Duration::from_millis(10)).is_none());
        assert!(started.elapsed() < Duration::from_millis(150));
    }

    #[test]
    fn dropping_worker_does_not_wait_for_hung_classifier() {
        let worker = ClassifierWorker::spawn("hung", Arc::new(|_: &[f32]| {
            thread::sleep(Duration::from_secs(5));
            None
        }))
        .unwrap();
        assert!(worker.classify(&[0.0; 16], Duration::from_millis(10)).is_none());

        let started = Instant::now();
        drop(worker);
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn workers_sharing_a_classifier_answer_independently() {
        let classifier: Arc<dyn HazardClassifier> = Arc::new(|samples: &[f32]| {
            if samples.first() == Some(&0.25) {
                thread::sleep(Duration::from_secs(2));
            }
            Some(ClassificationResult::new("alarm", 0.9))
        });
        let stuck = ClassifierWorker::spawn("stuck", Arc::clone(&classifier)).unwrap();
        let free = ClassifierWorker::spawn("free", classifier).unwrap();

        assert!(stuck.classify(&[0.25; 8], Duration::from_millis(10)).is_none());
        let verdict = free.classify(&[0.5; 8], Duration::from_millis(500));
        assert_eq!(verdict.map(|c| c.label), Some("alarm".to_string()));
    }
}
