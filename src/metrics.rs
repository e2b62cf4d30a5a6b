//! Per-session rolling metrics.
//!
//! Recording writes into storage allocated once at session creation;
//! averages are only computed when stats are requested.

use serde::Serialize;

use crate::session::SessionState;

#[derive(Debug, Clone, Copy, Default)]
struct Sample {
    cancellation_db: Option<f64>,
    latency_ms: f64,
}

/// Fixed-capacity ring of the most recent chunk measurements.
#[derive(Debug, Clone)]
pub struct MetricsWindow {
    samples: Vec<Sample>,
    next: usize,
    filled: usize,
}

impl MetricsWindow {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "metrics window must hold at least one chunk");
        Self {
            samples: vec![Sample::default(); capacity],
            next: 0,
            filled: 0,
        }
    }

    /// Records one chunk. Passed-through chunks carry no cancellation value.
    pub fn record(&mut self, cancellation_db: Option<f64>, latency_ms: f64) {
        self.samples[self.next] = Sample {
            cancellation_db,
            latency_ms,
        };
        self.next = (self.next + 1) % self.samples.len();
        if self.filled < self.samples.len() {
            self.filled += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.filled
    }

    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    pub fn capacity(&self) -> usize {
        self.samples.len()
    }

    pub fn avg_cancellation_db(&self) -> f64 {
        let (sum, count) = self.recorded().fold((0.0, 0usize), |(sum, count), s| {
            match s.cancellation_db {
                Some(db) => (sum + db, count + 1),
                None => (sum, count),
            }
        });
        if count == 0 { 0.0 } else { sum / count as f64 }
    }

    pub fn avg_latency_ms(&self) -> f64 {
        if self.filled == 0 {
            return 0.0;
        }
        self.recorded().map(|s| s.latency_ms).sum::<f64>() / self.filled as f64
    }

    fn recorded(&self) -> impl Iterator<Item = &Sample> {
        // Until the ring wraps, only the first `filled` slots hold data.
        self.samples.iter().take(self.filled)
    }
}

/// Snapshot of a session's counters and window averages.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub chunks_processed: u64,
    pub avg_cancellation_db: f64,
    pub avg_latency_ms: f64,
    pub emergency_count: u64,
    pub degraded_count: u64,
    pub gap_count: u64,
    pub filter_resets: u64,
    pub state: SessionState,
}

/// Stats frozen when a session ends.
pub type FinalStats = SessionStats;
