//! Error types for report delivery and reporter start-up.

use std::time::Duration;

use thiserror::Error;

/// Why one report could not be delivered. Never fatal: the tick is lost.
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to serialize report: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("invalid api url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("tls setup failed: {0}")]
    Tls(String),

    #[error("request failed: {0}")]
    Request(String),

    #[error("api responded with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("delivery timed out after {0:?}")]
    Timeout(Duration),
}

/// Misconfiguration that keeps the reporter from starting.
#[derive(Debug, Error)]
pub enum StartError {
    #[error("api_base_url is not configured (set QSCALE_URL)")]
    MissingApiUrl,

    #[error("invalid api url: {0}")]
    InvalidApiUrl(#[source] ReportError),

    #[error("no tokio runtime available to run the reporter")]
    NoRuntime,
}
