//! Transaction metrics.
//!
//! Counts operations per `(operation, outcome)` and tracks latency per
//! operation. [`MetricsObserver`] records into a shared
//! [`TransactionMetrics`]; exporting the numbers is left to the host.
//!
//! ```rust
//! use shardline::metrics::{MetricsObserver, TransactionMetrics};
//! use std::sync::Arc;
//!
//! let metrics = Arc::new(TransactionMetrics::new());
//! let observer = MetricsObserver::new(metrics.clone());
//! // register `observer` with ShardedDatabase::add_observer
//! # let _ = observer;
//! assert_eq!(metrics.snapshot().total(), 0);
//! ```

use crate::error::Result;
use crate::execution::{Next, ObserverContext, TransactionObserver};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Latency buckets for store transactions (in seconds).
pub const TRANSACTION_LATENCY_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0,
];

/// Outcome label for a successful operation.
pub const OUTCOME_OK: &str = "ok";
/// Outcome label for a failed operation.
pub const OUTCOME_ERROR: &str = "error";

/// Latency distribution of one operation.
#[derive(Debug)]
pub struct LatencyHistogram {
    buckets: &'static [f64],
    bucket_counts: Vec<AtomicU64>,
    sum_micros: AtomicU64,
    count: AtomicU64,
}

impl LatencyHistogram {
    pub fn new(buckets: &'static [f64]) -> Self {
        Self {
            buckets,
            bucket_counts: buckets.iter().map(|_| AtomicU64::new(0)).collect(),
            sum_micros: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, duration: Duration) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum_micros
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);

        // Cumulative buckets
        let secs = duration.as_secs_f64();
        for (i, &upper) in self.buckets.iter().enumerate() {
            if secs <= upper {
                self.bucket_counts[i].fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn snapshot(&self) -> LatencySnapshot {
        LatencySnapshot {
            buckets: self.buckets.to_vec(),
            bucket_counts: self
                .bucket_counts
                .iter()
                .map(|c| c.load(Ordering::Relaxed))
                .collect(),
            sum: Duration::from_micros(self.sum_micros.load(Ordering::Relaxed)),
            count: self.count.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of a [`LatencyHistogram`].
#[derive(Debug, Clone, PartialEq)]
pub struct LatencySnapshot {
    pub buckets: Vec<f64>,
    pub bucket_counts: Vec<u64>,
    pub sum: Duration,
    pub count: u64,
}

impl LatencySnapshot {
    /// Mean latency, zero when nothing was observed.
    pub fn mean(&self) -> Duration {
        if self.count == 0 {
            return Duration::ZERO;
        }
        let micros = self.sum.as_micros() / self.count as u128;
        Duration::from_micros(micros as u64)
    }
}

/// Outcome counts and latency of one operation name.
#[derive(Debug)]
struct OperationStats {
    succeeded: AtomicU64,
    failed: AtomicU64,
    latency: LatencyHistogram,
}

impl OperationStats {
    fn new() -> Self {
        Self {
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            latency: LatencyHistogram::new(TRANSACTION_LATENCY_BUCKETS),
        }
    }

    fn outcome(&self, outcome: &str) -> Option<&AtomicU64> {
        match outcome {
            OUTCOME_OK => Some(&self.succeeded),
            OUTCOME_ERROR => Some(&self.failed),
            _ => None,
        }
    }
}

/// Metrics for all transactional operations of a database.
#[derive(Debug, Default)]
pub struct TransactionMetrics {
    operations: RwLock<HashMap<&'static str, Arc<OperationStats>>>,
}

impl TransactionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one finished operation.
    pub fn record(&self, operation: &'static str, success: bool, duration: Duration) {
        let stats = self.stats(operation);
        let counter = if success { &stats.succeeded } else { &stats.failed };
        counter.fetch_add(1, Ordering::Relaxed);
        stats.latency.observe(duration);
    }

    /// Number of operations with the given outcome label.
    pub fn count(&self, operation: &str, outcome: &str) -> u64 {
        self.operations
            .read()
            .get(operation)
            .and_then(|stats| stats.outcome(outcome).map(|c| c.load(Ordering::Relaxed)))
            .unwrap_or(0)
    }

    pub fn latency_snapshot(&self, operation: &str) -> Option<LatencySnapshot> {
        self.operations
            .read()
            .get(operation)
            .map(|stats| stats.latency.snapshot())
    }

    pub fn snapshot(&self) -> TransactionMetricsSnapshot {
        let mut operations = Vec::new();
        for (&operation, stats) in self.operations.read().iter() {
            for outcome in [OUTCOME_OK, OUTCOME_ERROR] {
                let count = stats.outcome(outcome).map_or(0, |c| c.load(Ordering::Relaxed));
                if count > 0 {
                    operations.push((operation.to_string(), outcome.to_string(), count));
                }
            }
        }
        operations.sort();
        TransactionMetricsSnapshot { operations }
    }

    pub fn reset(&self) {
        self.operations.write().clear();
    }

    fn stats(&self, operation: &'static str) -> Arc<OperationStats> {
        if let Some(stats) = self.operations.read().get(operation) {
            return stats.clone();
        }
        self.operations
            .write()
            .entry(operation)
            .or_insert_with(|| Arc::new(OperationStats::new()))
            .clone()
    }
}

/// Sorted `(operation, outcome, count)` triples.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransactionMetricsSnapshot {
    pub operations: Vec<(String, String, u64)>,
}

impl TransactionMetricsSnapshot {
    pub fn total(&self) -> u64 {
        self.operations.iter().map(|(_, _, c)| c).sum()
    }

    pub fn errors(&self) -> u64 {
        self.operations
            .iter()
            .filter(|(_, outcome, _)| outcome == OUTCOME_ERROR)
            .map(|(_, _, c)| c)
            .sum()
    }
}

/// Observer recording every operation into [`TransactionMetrics`].
#[derive(Debug, Clone)]
pub struct MetricsObserver {
    metrics: Arc<TransactionMetrics>,
}

impl MetricsObserver {
    pub fn new(metrics: Arc<TransactionMetrics>) -> Self {
        Self { metrics }
    }

    pub fn metrics(&self) -> &Arc<TransactionMetrics> {
        &self.metrics
    }
}

impl TransactionObserver for MetricsObserver {
    fn name(&self) -> &str {
        "metrics"
    }

    fn observe(&self, ctx: &mut ObserverContext, next: &mut Next<'_>) -> Result<()> {
        let start = Instant::now();
        let result = next(ctx);
        self.metrics
            .record(ctx.operation(), result.is_ok(), start.elapsed());
        result
    }
}
