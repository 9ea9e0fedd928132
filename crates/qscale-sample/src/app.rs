//! HTTP surface of the sample app.
//!
//! Every request passes through [`record_queue_time`], which is the whole
//! web integration. The remaining routes drive the in-memory job backend so
//! job metrics can be watched changing.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Request, State};
use axum::http::{HeaderMap, StatusCode, header::CONTENT_LENGTH};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, put};
use axum::{Json, Router};
use serde::Deserialize;

use qscale_metrics::web::REQUEST_START_HEADER;
use qscale_metrics::{InMemoryBackend, RequestTiming, WebMetricsCollector, WorkerActivity};

#[derive(Clone)]
pub struct AppState {
    pub web: Arc<WebMetricsCollector>,
    pub backend: Arc<InMemoryBackend>,
}

#[derive(Debug, Deserialize)]
pub struct QueueUpdate {
    pub depth: u64,
    #[serde(default)]
    pub latency_ms: u64,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/queues", get(list_queues))
        .route("/queues/{name}", put(update_queue).delete(remove_queue))
        .route("/workers", put(update_workers))
        .layer(middleware::from_fn_with_state(state.clone(), record_queue_time))
        .with_state(state)
}

/// Timing facts available from request headers.
pub fn request_timing(headers: &HeaderMap) -> RequestTiming {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());
    RequestTiming {
        request_start: header(REQUEST_START_HEADER).map(str::to_string),
        network_time: None,
        body_size: header(CONTENT_LENGTH.as_str()).and_then(|v| v.trim().parse().ok()),
    }
}

async fn record_queue_time(State(state): State<AppState>, req: Request, next: Next) -> Response {
    state.web.record(&request_timing(req.headers()));
    next.run(req).await
}

async fn index() -> &'static str {
    "qscale sample app\n"
}

async fn list_queues(State(state): State<AppState>) -> Json<BTreeMap<String, u64>> {
    Json(state.backend.snapshot())
}

async fn update_queue(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(update): Json<QueueUpdate>,
) -> StatusCode {
    state
        .backend
        .set_queue(&name, update.depth, Duration::from_millis(update.latency_ms));
    StatusCode::NO_CONTENT
}

async fn remove_queue(State(state): State<AppState>, Path(name): Path<String>) -> StatusCode {
    state.backend.remove_queue(&name);
    StatusCode::NO_CONTENT
}

/// One entry per worker: the queue it is busy on, or `null` when idle.
async fn update_workers(
    State(state): State<AppState>,
    Json(workers): Json<Vec<Option<String>>>,
) -> StatusCode {
    state.backend.set_workers(
        workers
            .into_iter()
            .map(|queue| match queue {
                Some(queue) => WorkerActivity::busy(queue),
                None => WorkerActivity::idle(),
            })
            .collect(),
    );
    StatusCode::NO_CONTENT
}
