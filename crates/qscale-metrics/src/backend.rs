//! Job backend seam — the queries a job-queue library answers.
//!
//! Collectors run the same algorithm for every backend; a backend only
//! answers "which queues exist", "how deep / how late is this queue" and
//! "what are the workers doing". Calls may block (database or Redis round
//! trips); the reporter runs collectors on the blocking pool.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::bail;

/// What one worker is doing right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerActivity {
    /// Queue of the job being processed; `None` when idle.
    pub queue: Option<String>,
}

impl WorkerActivity {
    pub fn busy(queue: impl Into<String>) -> Self {
        Self {
            queue: Some(queue.into()),
        }
    }

    pub fn idle() -> Self {
        Self { queue: None }
    }
}

/// Query capability of a job-queue library.
pub trait QueueBackend: Send + Sync {
    /// Whether the client library is usable in this process.
    fn available(&self) -> bool {
        true
    }

    /// Queue names the backend currently knows about.
    fn queue_names(&self) -> anyhow::Result<Vec<String>>;

    /// Items waiting in a queue.
    fn depth(&self, queue: &str) -> anyhow::Result<u64> {
        bail!("depth is not supported for queue {queue}")
    }

    /// Age of the oldest waiting item.
    fn latency(&self, queue: &str) -> anyhow::Result<Duration>;

    /// Current activity of every worker.
    fn busy_workers(&self) -> anyhow::Result<Vec<WorkerActivity>>;
}

/// Lets the host keep a handle on a backend it hands to a collector.
impl<B: QueueBackend + ?Sized> QueueBackend for Arc<B> {
    fn available(&self) -> bool {
        (**self).available()
    }

    fn queue_names(&self) -> anyhow::Result<Vec<String>> {
        (**self).queue_names()
    }

    fn depth(&self, queue: &str) -> anyhow::Result<u64> {
        (**self).depth(queue)
    }

    fn latency(&self, queue: &str) -> anyhow::Result<Duration> {
        (**self).latency(queue)
    }

    fn busy_workers(&self) -> anyhow::Result<Vec<WorkerActivity>> {
        (**self).busy_workers()
    }
}

/// Queue dimensions a backend can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    pub depth: bool,
    pub latency: bool,
}

/// The job backends qscale ships adapters for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Resque,
    Que,
    Sidekiq,
    DelayedJob,
    GoodJob,
}

impl BackendKind {
    pub const ALL: [BackendKind; 5] = [
        BackendKind::Resque,
        BackendKind::Que,
        BackendKind::Sidekiq,
        BackendKind::DelayedJob,
        BackendKind::GoodJob,
    ];

    /// Key for config overrides and the sticky queue set; also the log prefix.
    pub fn config_key(&self) -> &'static str {
        match self {
            BackendKind::Resque => "resque",
            BackendKind::Que => "que",
            BackendKind::Sidekiq => "sidekiq",
            BackendKind::DelayedJob => "delayed_job",
            BackendKind::GoodJob => "good_job",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            BackendKind::Resque => "Resque",
            BackendKind::Que => "Que",
            BackendKind::Sidekiq => "Sidekiq",
            BackendKind::DelayedJob => "DelayedJob",
            BackendKind::GoodJob => "GoodJob",
        }
    }

    /// Identifier reported in the `adapters` section.
    pub fn adapter_identifier(&self) -> String {
        format!("qscale-{}", self.config_key())
    }

    /// Database-backed queues only expose the oldest job's age.
    pub fn dimensions(&self) -> Dimensions {
        match self {
            BackendKind::Resque | BackendKind::Sidekiq => Dimensions {
                depth: true,
                latency: true,
            },
            BackendKind::Que | BackendKind::DelayedJob | BackendKind::GoodJob => Dimensions {
                depth: false,
                latency: true,
            },
        }
    }
}

#[derive(Debug, Clone, Default)]
struct QueueState {
    depth: u64,
    latency: Duration,
}

#[derive(Default)]
struct MemoryState {
    /// Insertion order is discovery order.
    queues: Vec<(String, QueueState)>,
    workers: Vec<WorkerActivity>,
}

/// A thread-safe in-memory backend, for sample apps and tests.
#[derive(Default)]
pub struct InMemoryBackend {
    state: Mutex<MemoryState>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a queue's depth and latency, adding the queue if unknown.
    pub fn set_queue(&self, name: &str, depth: u64, latency: Duration) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = QueueState { depth, latency };
        match state.queues.iter_mut().find(|(q, _)| q == name) {
            Some((_, existing)) => *existing = entry,
            None => state.queues.push((name.to_string(), entry)),
        }
    }

    pub fn remove_queue(&self, name: &str) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.queues.retain(|(q, _)| q != name);
    }

    pub fn set_workers(&self, workers: Vec<WorkerActivity>) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .workers = workers;
    }

    /// Depth per queue, for display.
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .queues
            .iter()
            .map(|(q, s)| (q.clone(), s.depth))
            .collect()
    }

    fn queue(&self, name: &str) -> QueueState {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state
            .queues
            .iter()
            .find(|(q, _)| q == name)
            .map(|(_, s)| s.clone())
            .unwrap_or_default()
    }
}

impl QueueBackend for InMemoryBackend {
    fn queue_names(&self) -> anyhow::Result<Vec<String>> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(state.queues.iter().map(|(q, _)| q.clone()).collect())
    }

    /// Unknown (drained) queues report zero.
    fn depth(&self, queue: &str) -> anyhow::Result<u64> {
        Ok(self.queue(queue).depth)
    }

    fn latency(&self, queue: &str) -> anyhow::Result<Duration> {
        Ok(self.queue(queue).latency)
    }

    fn busy_workers(&self) -> anyhow::Result<Vec<WorkerActivity>> {
        Ok(self
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .workers
            .clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_labels() {
        assert_eq!(BackendKind::DelayedJob.config_key(), "delayed_job");
        assert_eq!(BackendKind::GoodJob.display_name(), "GoodJob");
        assert_eq!(BackendKind::Resque.adapter_identifier(), "qscale-resque");
    }

    #[test]
    fn only_redis_backends_report_depth() {
        let with_depth: Vec<_> = BackendKind::ALL
            .iter()
            .filter(|k| k.dimensions().depth)
            .collect();
        assert_eq!(with_depth, vec![&BackendKind::Resque, &BackendKind::Sidekiq]);
        assert!(BackendKind::ALL.iter().all(|k| k.dimensions().latency));
    }

    #[test]
    fn in_memory_backend_tracks_queues() {
        let backend = InMemoryBackend::new();
        backend.set_queue("default", 3, Duration::from_millis(1500));
        backend.set_queue("high", 1, Duration::ZERO);
        backend.set_queue("default", 4, Duration::from_millis(2000));

        assert_eq!(backend.queue_names().unwrap(), vec!["default", "high"]);
        assert_eq!(backend.depth("default").unwrap(), 4);
        assert_eq!(backend.latency("default").unwrap(), Duration::from_millis(2000));

        backend.remove_queue("default");
        assert_eq!(backend.queue_names().unwrap(), vec!["high"]);
        assert_eq!(backend.depth("default").unwrap(), 0);
    }

    #[test]
    fn default_depth_is_unsupported() {
        struct LatencyOnly;
        impl QueueBackend for LatencyOnly {
            fn queue_names(&self) -> anyhow::Result<Vec<String>> {
                Ok(vec![])
            }
            fn latency(&self, _queue: &str) -> anyhow::Result<Duration> {
                Ok(Duration::ZERO)
            }
            fn busy_workers(&self) -> anyhow::Result<Vec<WorkerActivity>> {
                Ok(vec![])
            }
        }

        assert!(LatencyOnly.depth("default").is_err());
        assert!(LatencyOnly.available());
    }
}
