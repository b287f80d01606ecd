// Logging module - bridges the proxy's own tracing output onto the bus
//
// A custom tracing layer turns every log event into a LogLine with source
// `proxy`, so /logs, /logs/stream and /api/events show the proxy's lines
// interleaved with upstream process output.

use chrono::Utc;
use tracing::Subscriber;
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

use crate::events::{EventBus, LogSource, ProxyEvent};

/// Tracing layer that republishes log events as bus LogLines
pub struct BusLogLayer {
    bus: EventBus,
}

impl BusLogLayer {
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }
}

impl<S> Layer<S> for BusLogLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        // Extract the message using a visitor
        let mut message = String::new();
        let mut visitor = MessageVisitor(&mut message);
        event.record(&mut visitor);
        if message.is_empty() {
            return;
        }

        self.bus.emit(ProxyEvent::LogLine {
            source: LogSource::Proxy,
            text: format!("{} {}", event.metadata().level(), message),
            timestamp: Utc::now(),
        });
    }
}

/// Visitor to extract the message from a tracing event
struct MessageVisitor<'a>(&'a mut String);

impl tracing::field::Visit for MessageVisitor<'_> {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            *self.0 = format!("{:?}", value);
            // Remove the quotes that Debug adds
            if self.0.starts_with('"') && self.0.ends_with('"') {
                *self.0 = self.0[1..self.0.len() - 1].to_string();
            }
        }
    }
}
