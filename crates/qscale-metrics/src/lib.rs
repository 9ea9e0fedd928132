//! qscale-metrics — sample collection for the qscale agent.
//!
//! Request handlers record web queue time straight into the shared
//! [`MetricsStore`]; job collectors query their backend once per reporter
//! tick and push the result into the same store.
//!
//! # Architecture
//!
//! ```text
//! WebMetricsCollector
//!   └── record() ← called per HTTP request → MetricsStore::push
//!
//! JobMetricsCollector<B: QueueBackend>   (Resque, Que, Sidekiq, DelayedJob, GoodJob)
//!   └── collect() ← called per reporter tick
//!         ├── queue selection (allow-list / filter / sticky set / max_queues)
//!         └── qd, qt, busy samples
//!
//! MetricsStore
//!   ├── push() / push_all() / push_collected()
//!   ├── dump() → drained once per tick
//!   └── known queues per adapter
//! ```

pub mod backend;
pub mod collector;
pub mod store;
pub mod web;

pub use backend::{BackendKind, Dimensions, InMemoryBackend, QueueBackend, WorkerActivity};
pub use collector::JobMetricsCollector;
pub use store::{DEFAULT_FLUSH_TIMEOUT, MetricsStore, flush_timeout_for};
pub use web::{RequestTiming, WebMetricsCollector, WEB_ADAPTER_ID};
