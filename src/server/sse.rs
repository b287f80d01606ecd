//! /api/events - the event bus over Server-Sent Events

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    response::sse::{Event, KeepAlive, Sse},
};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::wrappers::BroadcastStream;

use super::error::ApiError;
use super::AppState;

/// Comment-frame heartbeat cadence
const HEARTBEAT: Duration = Duration::from_secs(15);

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    /// Alternative to the auth headers, for EventSource clients that
    /// cannot set them
    pub api_key: Option<String>,
}

/// GET /api/events[?api_key=...]
///
/// Subscribes to the bus for the lifetime of the connection and writes each
/// event as a JSON `data:` frame. A subscriber that lags simply misses the
/// dropped events; the stream itself keeps going. When an apiKey is
/// configured the key must be presented via header or query.
pub async fn events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
    headers: HeaderMap,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    super::authorize(&state, &headers, query.api_key.as_deref())?;

    let stream = BroadcastStream::new(state.bus.subscribe()).filter_map(|event| async move {
        match event {
            Ok(event) => Event::default().json_data(&event).ok().map(Ok),
            Err(_) => None, // lagged; skip the gap
        }
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(HEARTBEAT)))
}
