//! Metrics store — the buffer shared by request handlers and the reporter.
//!
//! Every operation is a short critical section on a `std::sync::Mutex` with
//! no I/O inside, so request handlers never wait on the network. A poisoned
//! lock is recovered rather than propagated: telemetry must not take the
//! host down.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime};

use tracing::debug;

use qscale_core::{Metric, MetricIdentifier};

/// Pushes are dropped once this long has passed since the last dump.
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Default)]
struct Inner {
    metrics: Vec<Metric>,
    /// Insertion-ordered known queues, per adapter.
    known_queues: HashMap<String, Vec<String>>,
    dumped_at: Option<Instant>,
}

/// Concurrent buffer of collected samples plus per-adapter sticky queue sets.
pub struct MetricsStore {
    inner: Mutex<Inner>,
    flush_timeout: Duration,
}

impl MetricsStore {
    pub fn new() -> Self {
        Self::with_flush_timeout(DEFAULT_FLUSH_TIMEOUT)
    }

    /// A store that stops buffering when no dump happened within `flush_timeout`.
    pub fn with_flush_timeout(flush_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            flush_timeout,
        }
    }

    /// A store whose cutoff leaves room for at least two missed ticks.
    ///
    /// The cutoff is `max(2 × report_interval, DEFAULT_FLUSH_TIMEOUT)`.
    pub fn for_interval(report_interval: Duration) -> Self {
        Self::with_flush_timeout(flush_timeout_for(report_interval))
    }

    pub fn flush_timeout(&self) -> Duration {
        self.flush_timeout
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn accepting(&self, inner: &Inner) -> bool {
        inner
            .dumped_at
            .is_none_or(|at| at.elapsed() <= self.flush_timeout)
    }

    /// Append one sample.
    pub fn push(
        &self,
        identifier: MetricIdentifier,
        value: u64,
        timestamp: SystemTime,
        queue_name: Option<&str>,
    ) {
        let metric = Metric::new(identifier, value, timestamp, queue_name);
        let mut inner = self.lock();
        if self.accepting(&inner) {
            inner.metrics.push(metric);
        }
    }

    /// Append a batch, keeping its order, in one critical section.
    pub fn push_all(&self, metrics: Vec<Metric>) {
        let mut inner = self.lock();
        if self.accepting(&inner) {
            inner.metrics.extend(metrics);
        } else {
            debug!(dropped = metrics.len(), "metrics store stale, dropping samples");
        }
    }

    /// Append collector output gathered for the dump about to follow.
    ///
    /// Not subject to the stale cutoff: the caller is the reporter itself,
    /// so the store is being drained.
    pub fn push_collected(&self, metrics: Vec<Metric>) {
        self.lock().metrics.extend(metrics);
    }

    /// Take every buffered sample, leaving the buffer empty.
    ///
    /// Dumped samples are gone from the store whether or not their delivery
    /// later succeeds.
    pub fn dump(&self) -> Vec<Metric> {
        let mut inner = self.lock();
        inner.dumped_at = Some(Instant::now());
        std::mem::take(&mut inner.metrics)
    }

    /// Drop buffered samples without reporting them.
    pub fn clear(&self) {
        self.lock().metrics.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().metrics.is_empty()
    }

    /// Add a queue to an adapter's sticky set. Re-adding keeps the original position.
    pub fn remember_queue(&self, adapter_id: &str, queue_name: &str) {
        let mut inner = self.lock();
        let known = inner.known_queues.entry(adapter_id.to_string()).or_default();
        if !known.iter().any(|q| q == queue_name) {
            known.push(queue_name.to_string());
        }
    }

    /// Queues remembered for an adapter, in discovery order.
    pub fn known_queues(&self, adapter_id: &str) -> Vec<String> {
        self.lock()
            .known_queues
            .get(adapter_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn clear_queues(&self, adapter_id: &str) {
        self.lock().known_queues.remove(adapter_id);
    }
}

/// Stale cutoff for a reporter ticking every `report_interval`.
pub fn flush_timeout_for(report_interval: Duration) -> Duration {
    report_interval.saturating_mul(2).max(DEFAULT_FLUSH_TIMEOUT)
}

impl Default for MetricsStore {
    fn default() -> Self {
        Self::new()
    }
}
