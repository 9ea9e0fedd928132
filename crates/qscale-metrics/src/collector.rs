//! Job metrics collector — the queue collection algorithm shared by every backend.
//!
//! Each tick:
//!
//! ```text
//! candidates = config.queues            (explicit allow-list wins)
//!            | backend.queue_names() ∩ filter (custom, else UUID filter)
//! queues     = known ∪ candidates        (known first, remembered for later ticks)
//! queues     = shortest max_queues names (stable by discovery order)
//! for queue: qd / qt per supported dimension, then busy if tracked
//! ```
//!
//! Backend query failures are logged and skipped per queue and dimension.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use tracing::{debug, warn};

use qscale_core::{
    Adapter, Config, JobAdapterConfig, Metric, MetricIdentifier, QueueMetricsCollector,
    duration_millis,
};

use crate::backend::{BackendKind, QueueBackend};
use crate::store::MetricsStore;

/// Collects queue depth, latency and busy counts from one job backend.
pub struct JobMetricsCollector<B> {
    kind: BackendKind,
    backend: B,
    config: Arc<Config>,
    store: Arc<MetricsStore>,
}

impl<B: QueueBackend> JobMetricsCollector<B> {
    pub fn new(kind: BackendKind, backend: B, config: Arc<Config>, store: Arc<MetricsStore>) -> Self {
        Self {
            kind,
            backend,
            config,
            store,
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Wrap this collector into a registrable adapter.
    pub fn into_adapter(self, framework_version: &str) -> Adapter
    where
        B: 'static,
    {
        let kind = self.kind;
        let exposed = self.config.job_adapter(kind.config_key());
        Adapter::new(kind.adapter_identifier())
            .with_metadata("adapter_version", env!("CARGO_PKG_VERSION"))
            .with_metadata("framework_version", framework_version)
            .with_config(kind.config_key(), exposed)
            .with_collector(Arc::new(self))
    }

    /// Queues proposed by config or backend for this tick.
    fn candidate_queues(&self, adapter_config: &JobAdapterConfig) -> Vec<String> {
        if !adapter_config.queues.is_empty() {
            return adapter_config.queues.clone();
        }

        match self.backend.queue_names() {
            Ok(names) => names
                .into_iter()
                .filter(|q| adapter_config.allows(q))
                .collect(),
            Err(e) => {
                warn!(adapter = self.kind.config_key(), error = %e, "failed to list queues");
                Vec::new()
            }
        }
    }

    /// Busy workers per retained queue, or `None` when the query failed.
    fn busy_counts(&self, queues: &[String]) -> Option<HashMap<String, u64>> {
        let workers = match self.backend.busy_workers() {
            Ok(workers) => workers,
            Err(e) => {
                warn!(adapter = self.kind.config_key(), error = %e, "failed to query busy workers");
                return None;
            }
        };

        let mut counts: HashMap<String, u64> = queues.iter().map(|q| (q.clone(), 0)).collect();
        for queue in workers.into_iter().filter_map(|w| w.queue) {
            if let Some(count) = counts.get_mut(&queue) {
                *count += 1;
            }
        }
        Some(counts)
    }
}

/// Known queues first, then new candidates; empty names and duplicates dropped.
pub fn merge_queues(known: Vec<String>, candidates: Vec<String>) -> Vec<String> {
    let mut merged: Vec<String> = Vec::with_capacity(known.len() + candidates.len());
    for queue in known.into_iter().chain(candidates) {
        if !queue.is_empty() && !merged.contains(&queue) {
            merged.push(queue);
        }
    }
    merged
}

/// Keep the `max_queues` shortest names, ties in discovery order.
///
/// Returns the retained queues and how many were skipped.
pub fn limit_queues(mut queues: Vec<String>, max_queues: Option<usize>) -> (Vec<String>, usize) {
    match max_queues {
        Some(max) if queues.len() > max => {
            let skipped = queues.len() - max;
            // `sort_by_key` is stable.
            queues.sort_by_key(|q| q.len());
            queues.truncate(max);
            (queues, skipped)
        }
        _ => (queues, 0),
    }
}

impl<B: QueueBackend> QueueMetricsCollector for JobMetricsCollector<B> {
    fn adapter_id(&self) -> &str {
        self.kind.config_key()
    }

    fn enabled(&self) -> bool {
        self.config.job_adapter(self.kind.config_key()).enabled && self.backend.available()
    }

    fn collect(&self) -> Vec<Metric> {
        let key = self.kind.config_key();
        let adapter_config = self.config.job_adapter(key);

        let candidates = self.candidate_queues(&adapter_config);
        let queues = merge_queues(self.store.known_queues(key), candidates);
        for queue in &queues {
            self.store.remember_queue(key, queue);
        }

        let (queues, skipped) = limit_queues(queues, adapter_config.max_queues);
        if skipped > 0 {
            warn!(
                "{} metrics reporting only {} queues max, skipping the rest ({})",
                self.kind.display_name(),
                queues.len(),
                skipped
            );
        }

        let busy = if adapter_config.track_busy_jobs {
            self.busy_counts(&queues)
        } else {
            None
        };

        let dimensions = self.kind.dimensions();
        let now = SystemTime::now();
        let mut metrics = Vec::new();
        let mut summary = Vec::new();

        for queue in &queues {
            if dimensions.depth {
                match self.backend.depth(queue) {
                    Ok(depth) => {
                        metrics.push(Metric::new(MetricIdentifier::Qd, depth, now, Some(queue)));
                        summary.push(format!("{key}-qd.{queue}={depth}"));
                    }
                    Err(e) => warn!(adapter = key, %queue, error = %e, "queue depth query failed"),
                }
            }

            if dimensions.latency {
                match self.backend.latency(queue) {
                    Ok(latency) => {
                        let ms = duration_millis(latency);
                        metrics.push(Metric::new(MetricIdentifier::Qt, ms, now, Some(queue)));
                        summary.push(format!("{key}-qt.{queue}={ms}ms"));
                    }
                    Err(e) => warn!(adapter = key, %queue, error = %e, "queue latency query failed"),
                }
            }

            if let Some(counts) = &busy {
                let count = counts.get(queue).copied().unwrap_or(0);
                metrics.push(Metric::new(MetricIdentifier::Busy, count, now, Some(queue)));
                summary.push(format!("{key}-busy.{queue}={count}"));
            }
        }

        if !summary.is_empty() {
            debug!("{}", summary.join(" "));
        }

        metrics
    }

    fn queues(&self) -> Vec<String> {
        self.store.known_queues(self.kind.config_key())
    }

    fn clear_queues(&self) {
        self.store.clear_queues(self.kind.config_key());
    }
}
