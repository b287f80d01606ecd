//! OpenAI-compatible endpoints and the streaming reverse proxy
//!
//! Every inference endpoint funnels through [`proxy_request`]: extract the
//! model name from the (bounded) buffered body, dispatch through the
//! manager, replay the buffered bytes upstream, and stream the response
//! back without materializing it. The in-flight guard rides inside the
//! response stream, so a client disconnect mid-stream both drops the
//! upstream connection and releases the slot.

use axum::{
    body::Body,
    extract::{Path, Request, State},
    http::{request, HeaderMap, Response, StatusCode},
    response::IntoResponse,
    Json,
};
use bytes::Bytes;
use futures::StreamExt;
use serde::Serialize;

use super::error::ApiError;
use super::AppState;
use crate::config::ModelConfig;
use crate::error::RouteError;
use crate::instance::RequestGuard;

/// Bodies are buffered up to this cap to extract `model`; larger requests
/// are rejected rather than forwarded blind.
pub const MODEL_EXTRACT_CAP: usize = 8 * 1024 * 1024;

/// Hop-by-hop headers never forwarded in either direction.
/// `Transfer-Encoding` and `Trailer` are not in this list: framing headers
/// pass through verbatim on both legs.
const HOP_BY_HOP: &[&str] = &[
    "host",
    "connection",
    "keep-alive",
    "proxy-connection",
    "upgrade",
    "te",
];

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// POST /v1/chat/completions, /v1/completions, /v1/embeddings, rerank
/// variants, audio endpoints, /completion, /infill
pub async fn proxy_request(
    State(state): State<AppState>,
    req: Request,
) -> Result<Response<Body>, ApiError> {
    let (parts, body) = req.into_parts();
    let body = axum::body::to_bytes(body, MODEL_EXTRACT_CAP)
        .await
        .map_err(|_| ApiError::PayloadTooLarge)?;

    let requested = extract_model(&parts.headers, &body).ok_or(ApiError::MissingModel)?;
    let ticket = state.manager.dispatch(&requested).await?;
    let body = rewrite_model(body, ticket.instance.config());

    let base = ticket
        .instance
        .proxy_url()
        .ok_or(RouteError::GroupDenied(requested))?;
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("{}{}", base, path_and_query);

    forward(&state, &parts, body, &url, ticket.guard).await
}

/// ANY /upstream/:id/*path - authenticated direct passthrough for
/// debugging UIs. Admission rules still apply: the target is started if
/// necessary.
pub async fn upstream_passthrough(
    State(state): State<AppState>,
    Path((id, rest)): Path<(String, String)>,
    req: Request,
) -> Result<Response<Body>, ApiError> {
    let (parts, body) = req.into_parts();
    super::authorize(&state, &parts.headers, None)?;
    let body = axum::body::to_bytes(body, MODEL_EXTRACT_CAP)
        .await
        .map_err(|_| ApiError::PayloadTooLarge)?;

    let ticket = state.manager.dispatch(&id).await?;
    let base = ticket
        .instance
        .proxy_url()
        .ok_or(RouteError::GroupDenied(id))?;
    let query = parts
        .uri
        .query()
        .map(|q| format!("?{}", q))
        .unwrap_or_default();
    let url = format!("{}/{}{}", base, rest, query);

    forward(&state, &parts, body, &url, ticket.guard).await
}

/// GET /v1/models
pub async fn list_models(State(state): State<AppState>) -> impl IntoResponse {
    #[derive(Serialize)]
    struct ModelEntry {
        id: String,
        object: &'static str,
        created: i64,
        owned_by: &'static str,
    }

    let snapshot = state.manager.snapshot();
    let created = snapshot.created.timestamp();
    let data: Vec<ModelEntry> = snapshot
        .instances
        .iter()
        .filter(|i| !i.config().unlisted)
        .map(|i| ModelEntry {
            id: i.id().to_string(),
            object: "model",
            created,
            owned_by: "modelswap",
        })
        .collect();

    Json(serde_json::json!({ "object": "list", "data": data }))
}

// ─────────────────────────────────────────────────────────────────────────────
// Model extraction
// ─────────────────────────────────────────────────────────────────────────────

/// Pull the target model name out of a buffered request body.
/// JSON bodies carry a top-level `model` key; multipart bodies (audio
/// transcription) carry a `model` form field.
pub fn extract_model(headers: &HeaderMap, body: &[u8]) -> Option<String> {
    let content_type = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if content_type.starts_with("multipart/form-data") {
        let boundary = content_type
            .split("boundary=")
            .nth(1)?
            .split(';')
            .next()?
            .trim()
            .trim_matches('"');
        return extract_multipart_model(body, boundary);
    }

    serde_json::from_slice::<serde_json::Value>(body)
        .ok()?
        .get("model")?
        .as_str()
        .map(str::to_string)
}

/// Minimal multipart scan: find the part whose disposition names the
/// `model` field and take its first value line.
fn extract_multipart_model(body: &[u8], boundary: &str) -> Option<String> {
    let text = String::from_utf8_lossy(body);
    let delimiter = format!("--{}", boundary);
    for part in text.split(delimiter.as_str()) {
        let Some((head, value)) = part.split_once("\r\n\r\n").or_else(|| part.split_once("\n\n"))
        else {
            continue;
        };
        if head.contains("name=\"model\"") {
            let value = value.lines().next()?.trim();
            if !value.is_empty() {
                return Some(value.to_string());
            }
        }
    }
    None
}

/// Rewrite the JSON `model` field to the configured upstream name.
/// Only fires when `useModelName` is set; non-JSON bodies pass unchanged.
fn rewrite_model(body: Bytes, config: &ModelConfig) -> Bytes {
    let Some(override_name) = config.use_model_name.as_deref() else {
        return body;
    };
    let Ok(mut value) = serde_json::from_slice::<serde_json::Value>(&body) else {
        return body;
    };
    let Some(obj) = value.as_object_mut() else {
        return body;
    };
    if obj.contains_key("model") {
        obj.insert(
            "model".to_string(),
            serde_json::Value::String(override_name.to_string()),
        );
        if let Ok(rewritten) = serde_json::to_vec(&value) {
            return Bytes::from(rewritten);
        }
    }
    body
}

// ─────────────────────────────────────────────────────────────────────────────
// Forwarding
// ─────────────────────────────────────────────────────────────────────────────

/// Replay the buffered request upstream and stream the response back.
/// Headers are preserved verbatim apart from hop-by-hop ones; the response
/// body is never materialized. Dropping the returned response drops the
/// upstream read side and releases the in-flight guard with it.
async fn forward(
    state: &AppState,
    parts: &request::Parts,
    body: Bytes,
    url: &str,
    guard: RequestGuard,
) -> Result<Response<Body>, ApiError> {
    let method = reqwest::Method::from_bytes(parts.method.as_str().as_bytes())
        .unwrap_or(reqwest::Method::POST);

    let mut upstream_req = state.client.request(method, url);
    for (name, value) in parts.headers.iter() {
        let name_str = name.as_str();
        if HOP_BY_HOP.contains(&name_str) || name_str == "content-length" {
            continue;
        }
        upstream_req = upstream_req.header(name_str, value.as_bytes());
    }

    let upstream = upstream_req
        .body(body.to_vec())
        .send()
        .await
        .map_err(RouteError::Upstream)?;

    let status = upstream.status();
    let upstream_headers = upstream.headers().clone();
    let is_event_stream = upstream_headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.contains("text/event-stream"))
        .unwrap_or(false);

    let mut builder = Response::builder()
        .status(StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY));
    for (name, value) in upstream_headers.iter() {
        if HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        builder = builder.header(name.as_str(), value.as_bytes());
    }
    if is_event_stream {
        // Tell intermediary buffers (nginx and friends) to leave SSE alone
        builder = builder.header("x-accel-buffering", "no");
    }

    // The guard rides in the stream: released when the body is fully
    // forwarded or when the client disconnects and the stream is dropped.
    let stream = upstream.bytes_stream().map(move |chunk| {
        let _ = &guard;
        chunk
    });

    builder
        .body(Body::from_stream(stream))
        .map_err(|_| ApiError::Route(RouteError::GroupDenied("response build".to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header::CONTENT_TYPE;

    fn json_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, "application/json".parse().unwrap());
        headers
    }

    #[test]
    fn model_is_read_from_json_body() {
        let body = br#"{"model":"m1","messages":[{"role":"user","content":"hi"}]}"#;
        assert_eq!(
            extract_model(&json_headers(), body),
            Some("m1".to_string())
        );
    }

    #[test]
    fn missing_model_field_yields_none() {
        let body = br#"{"messages":[]}"#;
        assert_eq!(extract_model(&json_headers(), body), None);
        assert_eq!(extract_model(&json_headers(), b"not json"), None);
    }

    #[test]
    fn model_is_read_from_multipart_body() {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_TYPE,
            "multipart/form-data; boundary=XBOUND".parse().unwrap(),
        );
        let body = b"--XBOUND\r\n\
            Content-Disposition: form-data; name=\"file\"; filename=\"a.wav\"\r\n\
            Content-Type: audio/wav\r\n\r\n\
            AUDIO\r\n\
            --XBOUND\r\n\
            Content-Disposition: form-data; name=\"model\"\r\n\r\n\
            whisper-1\r\n\
            --XBOUND--\r\n";
        assert_eq!(
            extract_model(&headers, body),
            Some("whisper-1".to_string())
        );
    }

    #[test]
    fn rewrite_replaces_only_the_model_field() {
        let mut config = crate::config::ModelConfig {
            id: "m1".to_string(),
            name: "m1".to_string(),
            description: String::new(),
            cmd: "srv --port ${PORT}".to_string(),
            proxy: "http://127.0.0.1:${PORT}".to_string(),
            aliases: vec![],
            env: vec![],
            ttl: 0,
            unlisted: false,
            use_model_name: Some("upstream-name".to_string()),
            health_check_timeout: 300,
            concurrency_limit: 0,
            check_endpoint: "/health".to_string(),
            ready_marker: "server listening".to_string(),
        };

        let body = Bytes::from(r#"{"model":"m1","stream":true}"#);
        let rewritten = rewrite_model(body.clone(), &config);
        let value: serde_json::Value = serde_json::from_slice(&rewritten).unwrap();
        assert_eq!(value["model"], "upstream-name");
        assert_eq!(value["stream"], true);

        // Without the override, bytes pass through untouched
        config.use_model_name = None;
        assert_eq!(rewrite_model(body.clone(), &config), body);
    }
}
