//! Report delivery to the autoscaling API.
//!
//! The built-in [`HttpTransport`] POSTs JSON with a pooled hyper client over
//! `https://` (rustls, Mozilla roots) or plain `http://`.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use http::Uri;
use http_body_util::{BodyExt, Full};
use hyper::header::{CONTENT_TYPE, USER_AGENT};
use hyper::{Method, Request};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tracing::debug;

use crate::error::ReportError;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Path of the reports endpoint, relative to `api_base_url`.
pub const REPORTS_PATH: &str = "/v3/reports";

/// Response bodies quoted in errors are cut to this many bytes.
const MAX_ERROR_BODY: usize = 256;

/// Delivers one serialized report.
///
/// The reporter bounds each call with its own timeout.
pub trait Transport: Send + Sync {
    fn deliver(&self, payload: Vec<u8>) -> BoxFuture<'_, Result<(), ReportError>>;
}

/// Hyper-based JSON POST transport.
pub struct HttpTransport {
    endpoint: Uri,
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
}

impl HttpTransport {
    pub fn new(api_base_url: &str) -> Result<Self, ReportError> {
        Self::with_tls_config(api_base_url, tls_config()?)
    }

    /// Like [`HttpTransport::new`] with caller-supplied TLS settings
    /// (private CA, client certificates).
    pub fn with_tls_config(
        api_base_url: &str,
        tls: rustls::ClientConfig,
    ) -> Result<Self, ReportError> {
        let endpoint = reports_uri(api_base_url)?;
        let connector = HttpsConnectorBuilder::new()
            .with_tls_config(tls)
            .https_or_http()
            .enable_http1()
            .build();
        let client = Client::builder(TokioExecutor::new()).build(connector);
        Ok(Self { endpoint, client })
    }

    pub fn endpoint(&self) -> &Uri {
        &self.endpoint
    }
}

/// TLS client settings trusting the Mozilla root store.
pub fn tls_config() -> Result<rustls::ClientConfig, ReportError> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    Ok(rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| ReportError::Tls(e.to_string()))?
    .with_root_certificates(roots)
    .with_no_client_auth())
}

/// `<api_base_url>/v3/reports`, validated.
pub fn reports_uri(api_base_url: &str) -> Result<Uri, ReportError> {
    let invalid = |reason: &str| ReportError::InvalidUrl {
        url: api_base_url.to_string(),
        reason: reason.to_string(),
    };

    let joined = format!("{}{REPORTS_PATH}", api_base_url.trim().trim_end_matches('/'));
    let uri: Uri = joined.parse().map_err(|e: http::uri::InvalidUri| invalid(&e.to_string()))?;

    match uri.scheme_str() {
        Some("http" | "https") => {}
        _ => return Err(invalid("expected an http:// or https:// url")),
    }
    if uri.authority().is_none() {
        return Err(invalid("missing host"));
    }
    Ok(uri)
}

impl Transport for HttpTransport {
    fn deliver(&self, payload: Vec<u8>) -> BoxFuture<'_, Result<(), ReportError>> {
        Box::pin(async move {
            let size = payload.len();
            let req = Request::builder()
                .method(Method::POST)
                .uri(self.endpoint.clone())
                .header(CONTENT_TYPE, "application/json")
                .header(USER_AGENT, concat!("qscale/", env!("CARGO_PKG_VERSION")))
                .body(Full::new(Bytes::from(payload)))
                .map_err(|e| ReportError::Request(e.to_string()))?;

            let resp = self
                .client
                .request(req)
                .await
                .map_err(|e| ReportError::Request(e.to_string()))?;

            let status = resp.status();
            if status.is_success() {
                debug!(%status, bytes = size, endpoint = %self.endpoint, "report accepted");
                return Ok(());
            }

            let body = match resp.into_body().collect().await {
                Ok(collected) => {
                    let bytes = collected.to_bytes();
                    String::from_utf8_lossy(&bytes[..bytes.len().min(MAX_ERROR_BODY)]).into_owned()
                }
                Err(e) => format!("<unreadable body: {e}>"),
            };
            Err(ReportError::Status {
                status: status.as_u16(),
                body,
            })
        })
    }
}
