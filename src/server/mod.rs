//! HTTP server setup and routing
//!
//! Stateless routing over a cloneable [`AppState`]; every handler delegates
//! into the manager. The server also owns the combined log ring that backs
//! /logs, fed by a bus subscriber so proxy and upstream lines interleave in
//! arrival order.

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    routing::{any, get, post},
    Router,
};
use tokio::net::TcpListener;

mod error;
mod management;
mod openai;
mod sse;

pub use error::ApiError;

use crate::events::{EventBus, ProxyEvent};
use crate::logmonitor::ByteRing;
use crate::manager::Manager;

/// Combined proxy+upstream log retained for /logs
const COMBINED_LOG_CAPACITY: usize = 64 * 1024;

/// Idle connections kept per upstream host
const UPSTREAM_POOL_IDLE: usize = 10;

/// Shared state for all handlers
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<Manager>,
    pub bus: EventBus,
    /// Forwarding client; no global timeout so streams can run for minutes
    pub client: reqwest::Client,
    /// Combined log ring for /logs and /logs/stream history
    pub log_ring: Arc<ByteRing>,
}

impl AppState {
    pub fn new(manager: Arc<Manager>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(UPSTREAM_POOL_IDLE)
            // Upstreams are local single-process servers; HTTP/1.1 keeps the
            // framing identical on both legs of the proxy
            .http1_only()
            .build()
            .context("Failed to create HTTP client")?;

        let bus = manager.bus().clone();
        let log_ring = Arc::new(ByteRing::new(COMBINED_LOG_CAPACITY));
        spawn_log_collector(&bus, log_ring.clone());

        Ok(Self {
            manager,
            bus,
            client,
            log_ring,
        })
    }
}

/// Gate for the authenticated routes (/upstream/:id/*, /api/events).
/// With no apiKey configured the gate is open; otherwise the key must
/// arrive as `Authorization: Bearer`, `X-Api-Key`, or the caller-supplied
/// query parameter.
pub(super) fn authorize(
    state: &AppState,
    headers: &axum::http::HeaderMap,
    query_key: Option<&str>,
) -> Result<(), ApiError> {
    let Some(expected) = state.manager.snapshot().settings.api_key.clone() else {
        return Ok(());
    };
    let header_key = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .or_else(|| headers.get("x-api-key").and_then(|v| v.to_str().ok()));
    if header_key == Some(expected.as_str()) || query_key == Some(expected.as_str()) {
        Ok(())
    } else {
        Err(ApiError::Unauthorized)
    }
}

/// Feed every LogLine on the bus into the combined ring
fn spawn_log_collector(bus: &EventBus, ring: Arc<ByteRing>) {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(ProxyEvent::LogLine { source, text, .. }) => {
                    ring.append(format!("[{}] {}\n", source, text).as_bytes());
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}

/// Build the full route table
pub fn router(state: AppState) -> Router {
    Router::new()
        // OpenAI-compatible inference endpoints
        .route("/v1/chat/completions", post(openai::proxy_request))
        .route("/v1/completions", post(openai::proxy_request))
        .route("/v1/embeddings", post(openai::proxy_request))
        .route("/v1/rerank", post(openai::proxy_request))
        .route("/v1/reranking", post(openai::proxy_request))
        .route("/rerank", post(openai::proxy_request))
        .route("/v1/audio/speech", post(openai::proxy_request))
        .route("/v1/audio/transcriptions", post(openai::proxy_request))
        // Native upstream paths, proxied after body-field resolution
        .route("/completion", post(openai::proxy_request))
        .route("/infill", post(openai::proxy_request))
        .route("/v1/models", get(openai::list_models))
        // Management
        .route("/health", get(management::health))
        .route("/running", get(management::running))
        .route("/unload", post(management::unload))
        .route("/upstream/:id/*path", any(openai::upstream_passthrough))
        .route("/logs", get(management::logs_tail))
        .route("/logs/stream", get(management::logs_stream))
        .route("/api/events", get(sse::events))
        .route("/api/metrics", get(management::metrics))
        .with_state(state)
}

/// Bind and serve until `shutdown` resolves, then drain every instance
pub async fn serve<F>(listen: &str, manager: Arc<Manager>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let state = AppState::new(manager.clone())?;
    let app = router(state);

    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind to {}", listen))?;
    tracing::info!("Proxy listening on {}", listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("Server error")?;

    tracing::info!("Shutting down: unloading all instances");
    // Exit within 10s even if an upstream ignores its grace period; the
    // instance Drop impls SIGKILL anything left
    if tokio::time::timeout(std::time::Duration::from_secs(10), manager.unload_all())
        .await
        .is_err()
    {
        tracing::warn!("unload timed out, exiting anyway");
    }
    tracing::info!("Shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::ServiceExt;

    fn test_state(yaml: &str) -> AppState {
        let config = config::parse(yaml).unwrap();
        let manager = Manager::new(config, EventBus::new());
        AppState::new(manager).unwrap()
    }

    const YAML: &str = r#"
startPort: 25000
models:
  m1:
    cmd: "echo 'server listening'; sleep 30"
    proxy: "http://127.0.0.1:1"
  hidden:
    cmd: "echo 'server listening'; sleep 30"
    proxy: "http://127.0.0.1:1"
    unlisted: true
"#;

    #[tokio::test(flavor = "multi_thread")]
    async fn models_listing_hides_unlisted_entries() {
        let app = router(test_state(YAML));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/v1/models")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["object"], "list");
        let ids: Vec<&str> = json["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["m1"]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_model_maps_to_404() {
        let app = router(test_state(YAML));
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/chat/completions")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"model":"ghost","messages":[]}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "model not found");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn body_without_model_maps_to_400() {
        let app = router(test_state(YAML));
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/chat/completions")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"messages":[]}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn health_reports_counts() {
        let app = router(test_state(YAML));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["models_total"], 2);
        assert_eq!(json["models_loaded"], 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn api_key_gates_upstream_and_events_routes() {
        let yaml = format!("apiKey: \"sk-test\"\n{}", YAML.trim_start());
        let state = test_state(&yaml);

        // /upstream without a key is refused before any process starts
        let response = router(state.clone())
            .oneshot(
                Request::builder()
                    .uri("/upstream/m1/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        for status in state.manager.running() {
            assert_eq!(status.state, crate::instance::InstanceState::Stopped);
        }

        // /api/events with the wrong bearer token is refused
        let response = router(state.clone())
            .oneshot(
                Request::builder()
                    .uri("/api/events")
                    .header("authorization", "Bearer wrong")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        // The query form works for EventSource clients
        let response = router(state.clone())
            .oneshot(
                Request::builder()
                    .uri("/api/events?api_key=sk-test")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        // Unauthenticated routes stay open
        let response = router(state.clone())
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    /// Full round trip against a stub upstream: the request loads the
    /// instance, the response streams back from the upstream server.
    #[tokio::test(flavor = "multi_thread")]
    async fn request_loads_instance_and_proxies_to_upstream() {
        // Stub upstream standing in for an inference server
        let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let upstream_port = upstream_listener.local_addr().unwrap().port();
        let upstream = Router::new()
            .route("/health", get(|| async { "ok" }))
            .route(
                "/v1/chat/completions",
                post(|| async { axum::Json(serde_json::json!({ "ok": true })) }),
            );
        tokio::spawn(async move {
            axum::serve(upstream_listener, upstream).await.unwrap();
        });

        let yaml = format!(
            "startPort: 25100\nmodels:\n  m1:\n    cmd: \"sleep 30\"\n    proxy: \"http://127.0.0.1:{}\"\n",
            upstream_port
        );
        let state = test_state(&yaml);
        let app = router(state.clone());

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/v1/chat/completions")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        r#"{"model":"m1","messages":[{"role":"user","content":"hi"}]}"#,
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["ok"], true);

        // /running shows the instance ready with the request drained
        let statuses = state.manager.running();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].state, crate::instance::InstanceState::Ready);
        assert_eq!(statuses[0].in_flight, 0);

        state.manager.unload_all().await;
    }
}
