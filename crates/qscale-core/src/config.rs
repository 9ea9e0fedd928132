//! Agent configuration: TOML file, environment overrides, per-adapter overrides.
//!
//! ```toml
//! api_base_url = "https://autoscale.example.com/api/abc123"
//! report_interval_seconds = 60
//! log_level = "debug"
//!
//! [adapters.resque]
//! max_queues = 20
//! track_busy_jobs = true
//! ```
//!
//! Environment variables take precedence over the file:
//! `QSCALE_URL`, `QSCALE_REPORT_INTERVAL_SECONDS`, `QSCALE_LOG_LEVEL`, `DYNO`.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize, Serializer};

use crate::error::{ConfigError, ConfigResult};

pub const DEFAULT_REPORT_INTERVAL_SECONDS: u64 = 60;
pub const DEFAULT_REPORT_TIMEOUT_SECONDS: u64 = 5;
pub const DEFAULT_MAX_REQUEST_SIZE_BYTES: u64 = 100_000;

pub const ENV_API_URL: &str = "QSCALE_URL";
pub const ENV_REPORT_INTERVAL: &str = "QSCALE_REPORT_INTERVAL_SECONDS";
pub const ENV_LOG_LEVEL: &str = "QSCALE_LOG_LEVEL";
pub const ENV_CONTAINER: &str = "DYNO";

static UUID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}")
        .expect("static pattern is valid")
});

/// Default queue filter: rejects names containing a UUID-shaped token.
///
/// Dynamically generated queues (one per tenant, per batch, ...) would
/// otherwise grow the reported set without bound.
pub fn default_queue_filter(queue_name: &str) -> bool {
    !UUID_PATTERN.is_match(queue_name)
}

/// Log verbosity for the agent's own targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level: {other}")),
        }
    }
}

/// A queue-name predicate. Returns `true` for queues that should be collected.
#[derive(Clone)]
pub struct QueueFilter(Arc<dyn Fn(&str) -> bool + Send + Sync>);

impl QueueFilter {
    pub fn new(f: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn allows(&self, queue_name: &str) -> bool {
        (self.0)(queue_name)
    }
}

impl fmt::Debug for QueueFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("QueueFilter(..)")
    }
}

/// Per-adapter overrides, keyed by adapter config key (`resque`, `que`, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobAdapterConfig {
    /// Whether the adapter registers at all.
    pub enabled: bool,
    /// Explicit allow-list. When non-empty, filters are ignored.
    pub queues: Vec<String>,
    /// Custom filter, replacing the UUID filter. Exposed as "is configured".
    #[serde(skip_deserializing, serialize_with = "serialize_filter_flag")]
    pub queue_filter: Option<QueueFilter>,
    /// Upper bound on reported queues (shortest names win).
    pub max_queues: Option<usize>,
    /// Report a `busy` sample per queue.
    pub track_busy_jobs: bool,
}

impl Default for JobAdapterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            queues: Vec::new(),
            queue_filter: None,
            max_queues: None,
            track_busy_jobs: false,
        }
    }
}

impl JobAdapterConfig {
    /// Apply the configured filter, falling back to [`default_queue_filter`].
    pub fn allows(&self, queue_name: &str) -> bool {
        match &self.queue_filter {
            Some(filter) => filter.allows(queue_name),
            None => default_queue_filter(queue_name),
        }
    }

    pub fn with_queue_filter(mut self, f: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        self.queue_filter = Some(QueueFilter::new(f));
        self
    }
}

fn serialize_filter_flag<S: Serializer>(
    filter: &Option<QueueFilter>,
    s: S,
) -> Result<S::Ok, S::Error> {
    s.serialize_bool(filter.is_some())
}

/// Process-wide agent settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Remote autoscaling API endpoint. Contains the app token, never reported.
    #[serde(skip_serializing)]
    pub api_base_url: Option<String>,
    pub report_interval_seconds: u64,
    /// Upper bound on one report delivery.
    pub report_timeout_seconds: u64,
    pub log_level: LogLevel,
    /// Requests with bodies above this are skipped when `ignore_large_requests` is on.
    pub max_request_size_bytes: u64,
    pub ignore_large_requests: bool,
    /// Runtime container name (e.g. `web.1`), reported beside the config.
    #[serde(skip_serializing)]
    pub container: Option<String>,
    /// Per-adapter overrides.
    #[serde(skip_serializing)]
    pub adapters: BTreeMap<String, JobAdapterConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: None,
            report_interval_seconds: DEFAULT_REPORT_INTERVAL_SECONDS,
            report_timeout_seconds: DEFAULT_REPORT_TIMEOUT_SECONDS,
            log_level: LogLevel::default(),
            max_request_size_bytes: DEFAULT_MAX_REQUEST_SIZE_BYTES,
            ignore_large_requests: true,
            container: None,
            adapters: BTreeMap::new(),
        }
    }
}

impl Config {
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Defaults overridden by the process environment.
    pub fn from_env() -> ConfigResult<Self> {
        Self::default().with_env(|key| std::env::var(key).ok())
    }

    /// Optional config file, then the process environment on top.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let base = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        base.with_env(|key| std::env::var(key).ok())
    }

    /// Apply environment overrides read through `lookup`.
    ///
    /// Empty values are treated as unset.
    pub fn with_env<F>(mut self, lookup: F) -> ConfigResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = get(ENV_API_URL) {
            self.api_base_url = Some(url.trim().to_string());
        }
        if let Some(raw) = get(ENV_REPORT_INTERVAL) {
            self.report_interval_seconds =
                raw.trim().parse().map_err(|_| ConfigError::InvalidEnv {
                    key: ENV_REPORT_INTERVAL.to_string(),
                    value: raw.clone(),
                })?;
        }
        if let Some(raw) = get(ENV_LOG_LEVEL) {
            self.log_level = raw.parse().map_err(|_| ConfigError::InvalidEnv {
                key: ENV_LOG_LEVEL.to_string(),
                value: raw.clone(),
            })?;
        }
        if let Some(container) = get(ENV_CONTAINER) {
            self.container = Some(container);
        }

        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.report_interval_seconds == 0 {
            return Err(ConfigError::Invalid(
                "report_interval_seconds must be greater than zero".into(),
            ));
        }
        if self.report_timeout_seconds == 0 {
            return Err(ConfigError::Invalid(
                "report_timeout_seconds must be greater than zero".into(),
            ));
        }
        if matches!(&self.api_base_url, Some(url) if url.trim().is_empty()) {
            return Err(ConfigError::Invalid("api_base_url is empty".into()));
        }
        Ok(())
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_seconds)
    }

    pub fn report_timeout(&self) -> Duration {
        Duration::from_secs(self.report_timeout_seconds)
    }

    /// Overrides for one adapter, or the defaults when none are configured.
    pub fn job_adapter(&self, key: &str) -> JobAdapterConfig {
        self.adapters.get(key).cloned().unwrap_or_default()
    }

    pub fn with_job_adapter(mut self, key: &str, adapter: JobAdapterConfig) -> Self {
        self.adapters.insert(key.to_string(), adapter);
        self
    }

    /// `tracing-subscriber` filter directives for the agent's crates.
    pub fn log_directives(&self) -> String {
        let level = self.log_level;
        format!("info,qscale_core={level},qscale_metrics={level},qscale_reporter={level}")
    }
}
