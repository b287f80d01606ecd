//! Management endpoints: health, running instances, unload, logs, metrics

use axum::{
    body::Body,
    extract::{Query, State},
    http::{Response, StatusCode},
    response::IntoResponse,
    Json,
};
use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use serde::Deserialize;
use tokio_stream::wrappers::BroadcastStream;

use super::AppState;
use crate::events::{LogSource, ProxyEvent};

/// GET /health
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let (total, loaded) = state.manager.model_counts();
    Json(serde_json::json!({
        "status": "ok",
        "models_total": total,
        "models_loaded": loaded,
        "timestamp": Utc::now().timestamp(),
    }))
}

/// GET /running
pub async fn running(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.manager.running())
}

/// POST /unload
pub async fn unload(State(state): State<AppState>) -> impl IntoResponse {
    state.manager.unload_all().await;
    Json(serde_json::json!({ "status": "ok" }))
}

/// GET /api/metrics
pub async fn metrics(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.manager.metrics())
}

// ─────────────────────────────────────────────────────────────────────────────
// Logs
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub bytes: Option<usize>,
}

/// GET /logs?bytes=N - tail of the combined proxy+upstream log
pub async fn logs_tail(
    State(state): State<AppState>,
    Query(query): Query<LogsQuery>,
) -> impl IntoResponse {
    let data = state.log_ring.tail(query.bytes.unwrap_or(usize::MAX));
    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        data,
    )
}

#[derive(Debug, Deserialize)]
pub struct LogStreamQuery {
    /// Presence-only flag: start from now instead of replaying the ring
    #[serde(rename = "no-history")]
    pub no_history: Option<String>,
    /// `proxy` or `upstream`; absent streams both
    pub source: Option<String>,
}

/// GET /logs/stream[?no-history][&source=proxy|upstream]
/// Chunked stream of log lines until the client disconnects.
pub async fn logs_stream(
    State(state): State<AppState>,
    Query(query): Query<LogStreamQuery>,
) -> Response<Body> {
    let wants = move |source: &LogSource| match query.source.as_deref() {
        Some("proxy") => *source == LogSource::Proxy,
        Some("upstream") => matches!(source, LogSource::Upstream(_)),
        _ => true,
    };

    let history = if query.no_history.is_some() {
        None
    } else {
        let tail = state.log_ring.tail(usize::MAX);
        (!tail.is_empty()).then(|| Bytes::from(tail))
    };

    let live = BroadcastStream::new(state.bus.subscribe()).filter_map(move |event| {
        let line = match event {
            Ok(ProxyEvent::LogLine { source, text, .. }) if wants(&source) => {
                Some(Bytes::from(format!("[{}] {}\n", source, text)))
            }
            _ => None, // other events and lag gaps are not log lines
        };
        async move { line.map(Ok::<_, std::convert::Infallible>) }
    });

    let stream = futures::stream::iter(history.into_iter().map(Ok)).chain(live);

    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/plain; charset=utf-8")
        .header("x-accel-buffering", "no")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| Response::new(Body::empty()))
}
