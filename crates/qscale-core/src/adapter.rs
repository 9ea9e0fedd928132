//! Adapter registry — the integrations active in this process.
//!
//! Each adapter describes itself (identifier + version metadata) in every
//! report. Job adapters also carry the collector the reporter drives on
//! each tick. The registry is append-only: adapters never unregister.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use crate::config::JobAdapterConfig;
use crate::types::Metric;

/// Identifier of the agent's own adapter, always registered first.
pub const CORE_ADAPTER_ID: &str = "qscale-rust";

/// Produces queue metrics for one job backend.
///
/// Only the reporter calls `collect()`, from the blocking pool, once per tick.
pub trait QueueMetricsCollector: Send + Sync {
    /// Identity used for the sticky queue set and log prefixes.
    fn adapter_id(&self) -> &str;

    /// Whether the backend is available and the adapter enabled.
    fn enabled(&self) -> bool;

    /// Query the backend and produce this tick's samples.
    fn collect(&self) -> Vec<Metric>;

    /// Queues currently remembered for reporting.
    fn queues(&self) -> Vec<String>;

    /// Forget remembered queues.
    fn clear_queues(&self);
}

/// An integration registered with the agent.
#[derive(Clone)]
pub struct Adapter {
    pub identifier: String,
    pub metadata: BTreeMap<String, String>,
    pub collector: Option<Arc<dyn QueueMetricsCollector>>,
    /// Overrides exposed in reports, keyed by `config_key`.
    pub config: Option<(String, JobAdapterConfig)>,
}

impl Adapter {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            metadata: BTreeMap::new(),
            collector: None,
            config: None,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_collector(mut self, collector: Arc<dyn QueueMetricsCollector>) -> Self {
        self.collector = Some(collector);
        self
    }

    pub fn with_config(mut self, config_key: impl Into<String>, config: JobAdapterConfig) -> Self {
        self.config = Some((config_key.into(), config));
        self
    }
}

impl fmt::Debug for Adapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Adapter")
            .field("identifier", &self.identifier)
            .field("metadata", &self.metadata)
            .field("collector", &self.collector.as_ref().map(|c| c.adapter_id().to_string()))
            .field("config", &self.config)
            .finish()
    }
}

/// Append-only list of registered adapters, in registration order.
pub struct AdapterRegistry {
    adapters: RwLock<Vec<Adapter>>,
}

impl AdapterRegistry {
    /// A registry holding only the agent's own adapter.
    pub fn new() -> Self {
        let core = Adapter::new(CORE_ADAPTER_ID)
            .with_metadata("adapter_version", env!("CARGO_PKG_VERSION"));
        Self {
            adapters: RwLock::new(vec![core]),
        }
    }

    pub fn register(&self, adapter: Adapter) {
        self.adapters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(adapter);
    }

    /// Register only when the adapter is enabled and its backend is available.
    ///
    /// Returns whether the adapter was registered.
    pub fn register_if_enabled(&self, adapter: Adapter) -> bool {
        let config_enabled = adapter.config.as_ref().is_none_or(|(_, c)| c.enabled);
        let backend_enabled = adapter.collector.as_ref().is_none_or(|c| c.enabled());
        if config_enabled && backend_enabled {
            self.register(adapter);
            true
        } else {
            false
        }
    }

    /// Snapshot of registered adapters in registration order.
    pub fn adapters(&self) -> Vec<Adapter> {
        self.adapters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Collectors of registered job adapters, in registration order.
    pub fn collectors(&self) -> Vec<Arc<dyn QueueMetricsCollector>> {
        self.adapters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(|a| a.collector.clone())
            .collect()
    }

    pub fn get(&self, identifier: &str) -> Option<Adapter> {
        self.adapters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|a| a.identifier == identifier)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.adapters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::new()
    }
}
