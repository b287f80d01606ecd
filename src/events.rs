// Events that flow from the routing core to subscribers
//
// State changes, upstream log lines, extracted metrics and reload signals all
// travel over one process-wide bus. Using an enum allows pattern matching and
// ensures type-safe communication between async tasks; the serde tag makes
// every event directly usable as a JSON frame on the /api/events stream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast;

use crate::instance::InstanceState;

/// Capacity of the per-subscriber event ring. A subscriber that falls more
/// than this many events behind loses the oldest entries (broadcast lag);
/// the bus never blocks an emitter on a slow consumer.
pub const BUS_CAPACITY: usize = 256;

/// Main event type that flows through the application
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProxyEvent {
    /// An instance moved between lifecycle states
    ModelStateChanged {
        id: String,
        from: InstanceState,
        to: InstanceState,
        timestamp: DateTime<Utc>,
    },

    /// A log line from the proxy itself or from an upstream process
    LogLine {
        source: LogSource,
        text: String,
        timestamp: DateTime<Utc>,
    },

    /// Token counts and timings parsed from an upstream completion summary
    Metric(TokenMetric),

    /// The config file changed on disk; `start` fires before the reload
    /// drains instances, `end` once the new snapshot is in force
    ConfigFileChanged { phase: ReloadPhase },

    /// Opaque progress payload from the download collaborator, passed through
    DownloadProgress { payload: serde_json::Value },
}

/// Where a `LogLine` came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogSource {
    /// The proxy's own tracing output
    Proxy,
    /// stdout/stderr of the named upstream instance
    Upstream(String),
}

impl fmt::Display for LogSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogSource::Proxy => f.write_str("proxy"),
            LogSource::Upstream(id) => write!(f, "upstream:{}", id),
        }
    }
}

impl Serialize for LogSource {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for LogSource {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(match s.strip_prefix("upstream:") {
            Some(id) => LogSource::Upstream(id.to_string()),
            None => LogSource::Proxy,
        })
    }
}

/// Completion metrics extracted from upstream log output (best-effort)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenMetric {
    pub id: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub tokens_per_second: f64,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// Phase marker for config reloads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReloadPhase {
    Start,
    End,
}

/// Process-wide typed publish-subscribe bus.
///
/// Emission is non-blocking: each subscriber owns a bounded ring of
/// [`BUS_CAPACITY`] events and loses the oldest entries if it lags. Within
/// one subscriber, events arrive in emission order; no ordering is promised
/// across subscribers.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ProxyEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    /// Deliver an event to all current subscribers.
    /// A bus with no subscribers silently drops the event.
    pub fn emit(&self, event: ProxyEvent) {
        let _ = self.tx.send(event);
    }

    /// Register a new subscriber. The receiver sees only events emitted
    /// after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<ProxyEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_change(id: &str, from: InstanceState, to: InstanceState) -> ProxyEvent {
        ProxyEvent::ModelStateChanged {
            id: id.to_string(),
            from,
            to,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn events_arrive_in_emission_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.emit(state_change(
            "m1",
            InstanceState::Stopped,
            InstanceState::Starting,
        ));
        bus.emit(state_change(
            "m1",
            InstanceState::Starting,
            InstanceState::Ready,
        ));

        match rx.recv().await.unwrap() {
            ProxyEvent::ModelStateChanged { to, .. } => assert_eq!(to, InstanceState::Starting),
            other => panic!("unexpected event: {:?}", other),
        }
        match rx.recv().await.unwrap() {
            ProxyEvent::ModelStateChanged { to, .. } => assert_eq!(to, InstanceState::Ready),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn lagged_subscriber_drops_oldest() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        for i in 0..(BUS_CAPACITY + 10) {
            bus.emit(ProxyEvent::LogLine {
                source: LogSource::Proxy,
                text: format!("line {}", i),
                timestamp: Utc::now(),
            });
        }

        // The first recv reports the lag, subsequent recvs resume with the
        // oldest retained event.
        let err = rx.recv().await.unwrap_err();
        assert!(matches!(err, broadcast::error::RecvError::Lagged(_)));
        match rx.recv().await.unwrap() {
            ProxyEvent::LogLine { text, .. } => assert_eq!(text, "line 10"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn events_serialize_with_type_tag() {
        let json = serde_json::to_value(state_change(
            "m1",
            InstanceState::Stopped,
            InstanceState::Starting,
        ))
        .unwrap();
        assert_eq!(json["type"], "model_state_changed");
        assert_eq!(json["from"], "stopped");
        assert_eq!(json["to"], "starting");
    }

    #[test]
    fn log_source_round_trips_as_string() {
        let src = LogSource::Upstream("m1".to_string());
        let json = serde_json::to_string(&src).unwrap();
        assert_eq!(json, "\"upstream:m1\"");
        let back: LogSource = serde_json::from_str(&json).unwrap();
        assert_eq!(back, src);

        let proxy: LogSource = serde_json::from_str("\"proxy\"").unwrap();
        assert_eq!(proxy, LogSource::Proxy);
    }
}
