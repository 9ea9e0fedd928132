//! qscale-core — shared types for the qscale telemetry agent.
//!
//! Holds the metric sample model, the adapter registry (and the collector
//! contract job adapters implement), and agent configuration.

pub mod adapter;
pub mod config;
pub mod error;
pub mod types;

pub use adapter::{Adapter, AdapterRegistry, QueueMetricsCollector, CORE_ADAPTER_ID};
pub use config::{Config, JobAdapterConfig, LogLevel, QueueFilter, default_queue_filter};
pub use error::{ConfigError, ConfigResult};
pub use types::*;
