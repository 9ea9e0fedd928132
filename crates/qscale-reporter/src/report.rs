//! Report payload — one tick's snapshot of adapters, config and samples.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;

use qscale_core::{Adapter, Config, Metric};

use crate::error::ReportError;

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    /// Adapter identifier → version metadata.
    pub adapters: BTreeMap<String, BTreeMap<String, String>>,
    /// Agent config plus each job adapter's exposed overrides.
    pub config: Value,
    pub metrics: Vec<Metric>,
    pub pid: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
}

impl Report {
    pub fn new(adapters: &[Adapter], config: &Config, metrics: Vec<Metric>) -> Result<Self, ReportError> {
        let mut config_json = serde_json::to_value(config)?;
        if let Value::Object(map) = &mut config_json {
            for (key, adapter_config) in adapters.iter().filter_map(|a| a.config.as_ref()) {
                map.insert(key.clone(), serde_json::to_value(adapter_config)?);
            }
        }

        Ok(Self {
            adapters: adapters
                .iter()
                .map(|a| (a.identifier.clone(), a.metadata.clone()))
                .collect(),
            config: config_json,
            metrics,
            pid: std::process::id(),
            container: config.container.clone(),
        })
    }

    pub fn to_json(&self) -> Result<Vec<u8>, ReportError> {
        Ok(serde_json::to_vec(self)?)
    }
}
