//! Metric samples shared across qscale crates.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize, Serializer};

/// What a metric sample measures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricIdentifier {
    /// Queue time: milliseconds a job or request waited before processing.
    Qt,
    /// Queue depth: number of items waiting.
    Qd,
    /// Workers currently processing a job from the queue.
    Busy,
}

impl MetricIdentifier {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricIdentifier::Qt => "qt",
            MetricIdentifier::Qd => "qd",
            MetricIdentifier::Busy => "busy",
        }
    }
}

impl fmt::Display for MetricIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single collected sample.
///
/// `queue_name` is `None` for web request samples. Timestamps are host-local
/// and go on the wire as epoch milliseconds under `time`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Metric {
    pub identifier: MetricIdentifier,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_name: Option<String>,
    pub value: u64,
    #[serde(rename = "time", serialize_with = "serialize_epoch_millis")]
    pub timestamp: SystemTime,
}

impl Metric {
    pub fn new(
        identifier: MetricIdentifier,
        value: u64,
        timestamp: SystemTime,
        queue_name: Option<&str>,
    ) -> Self {
        Self {
            identifier,
            queue_name: queue_name.map(str::to_string),
            value,
            timestamp,
        }
    }

    /// Milliseconds since the Unix epoch (zero for pre-epoch clocks).
    pub fn epoch_millis(&self) -> u64 {
        epoch_millis(self.timestamp)
    }
}

pub fn epoch_millis(time: SystemTime) -> u64 {
    duration_millis(time.duration_since(UNIX_EPOCH).unwrap_or_default())
}

/// Whole milliseconds, saturating at `u64::MAX`.
pub fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn serialize_epoch_millis<S: Serializer>(time: &SystemTime, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(epoch_millis(*time))
}
