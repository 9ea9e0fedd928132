//! qscale-reporter — periodic delivery of collected samples.
//!
//! The [`Reporter`] owns one background task on the tokio runtime. Each tick
//! it drives the registered job collectors, drains the shared
//! [`MetricsStore`](qscale_metrics::MetricsStore) and POSTs a JSON
//! [`Report`] through a [`Transport`].
//!
//! ```text
//! Reporter::start()
//!   └── loop every report_interval
//!         ├── collectors → store           (spawn_blocking, registration order)
//!         ├── store.dump()                 (empty → nothing to report)
//!         └── Report → Transport::deliver  (bounded by report_timeout, never retried)
//! ```

pub mod error;
pub mod report;
pub mod reporter;
pub mod transport;

pub use error::{ReportError, StartError};
pub use report::Report;
pub use reporter::{CycleOutcome, Reporter};
pub use transport::{BoxFuture, HttpTransport, Transport, REPORTS_PATH};
