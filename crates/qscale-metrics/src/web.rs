//! Request queue time — recorded synchronously on each inbound request.
//!
//! The reverse proxy stamps `X-Request-Start` when a request arrives; the
//! difference to "now" when the app picks it up is the web queue time. The
//! middleware that reads the header belongs to the host framework and calls
//! [`WebMetricsCollector::record`].

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::debug;

use qscale_core::{Adapter, Config, MetricIdentifier, duration_millis};

use crate::store::MetricsStore;

/// Identifier of the web adapter in reports.
pub const WEB_ADAPTER_ID: &str = "qscale-web";

/// Conventional header carrying the proxy's request start time.
pub const REQUEST_START_HEADER: &str = "x-request-start";

/// Timing facts the middleware extracts from a request.
#[derive(Debug, Clone, Default)]
pub struct RequestTiming {
    /// Raw `X-Request-Start` header value.
    pub request_start: Option<String>,
    /// Time the server spent receiving the request body, when known.
    pub network_time: Option<Duration>,
    /// Request body size (`Content-Length`), when known.
    pub body_size: Option<u64>,
}

/// Parse a request start header into a wall-clock instant.
///
/// Accepts an optional `t=` prefix and seconds (with fraction),
/// milliseconds, microseconds or nanoseconds since the epoch; the unit is
/// picked by magnitude. Resolution is one millisecond.
pub fn parse_request_start(header: &str) -> Option<SystemTime> {
    let digits: String = header
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let value: f64 = digits.parse().ok()?;
    if !value.is_finite() || value <= 0.0 {
        return None;
    }

    let millis = if value < 1e11 {
        value * 1_000.0
    } else if value < 1e14 {
        value
    } else if value < 1e17 {
        value / 1_000.0
    } else {
        value / 1_000_000.0
    };

    Some(UNIX_EPOCH + Duration::from_millis(millis.round() as u64))
}

/// Records web queue time samples into the store.
pub struct WebMetricsCollector {
    config: Arc<Config>,
    store: Arc<MetricsStore>,
}

impl WebMetricsCollector {
    pub fn new(config: Arc<Config>, store: Arc<MetricsStore>) -> Self {
        Self { config, store }
    }

    /// Adapter describing the web integration; it has no job collector.
    pub fn adapter(framework_version: &str) -> Adapter {
        Adapter::new(WEB_ADAPTER_ID)
            .with_metadata("adapter_version", env!("CARGO_PKG_VERSION"))
            .with_metadata("framework_version", framework_version)
    }

    /// Record one request's queue time. Returns the recorded milliseconds.
    ///
    /// Requests without a usable start header, or oversized requests when
    /// `ignore_large_requests` is on, record nothing.
    pub fn record(&self, timing: &RequestTiming) -> Option<u64> {
        self.record_at(timing, SystemTime::now())
    }

    pub fn record_at(&self, timing: &RequestTiming, now: SystemTime) -> Option<u64> {
        if self.is_large(timing) {
            debug!(size = ?timing.body_size, "skipping queue time for large request");
            return None;
        }

        let queue_time = queue_time(timing, now)?;
        let ms = duration_millis(queue_time);
        self.store.push(MetricIdentifier::Qt, ms, now, None);

        debug!(
            queue_time_ms = ms,
            network_time_ms = timing.network_time.map(duration_millis).unwrap_or(0),
            "request queue time"
        );
        Some(ms)
    }

    fn is_large(&self, timing: &RequestTiming) -> bool {
        self.config.ignore_large_requests
            && timing
                .body_size
                .is_some_and(|size| size > self.config.max_request_size_bytes)
    }
}

/// Wait between the proxy stamp and `now`, minus body transfer time.
///
/// Clock skew that puts the stamp in the future yields zero.
pub fn queue_time(timing: &RequestTiming, now: SystemTime) -> Option<Duration> {
    let started_at = parse_request_start(timing.request_start.as_deref()?)?;
    let elapsed = now.duration_since(started_at).unwrap_or_default();
    Some(elapsed.saturating_sub(timing.network_time.unwrap_or_default()))
}
