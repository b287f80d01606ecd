// Log monitor - captures upstream process output
//
// Each instance owns one monitor. Output lines land in a bounded byte ring
// (for /logs replay), are re-broadcast as LogLine events, and are scanned
// twice on the way through: once for the readiness marker that substitutes
// for a health endpoint, once for completion-summary metrics.

use chrono::Utc;
use regex::Regex;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::watch;

use crate::events::{EventBus, LogSource, ProxyEvent, TokenMetric};

/// Raw bytes retained per source for replay on demand
pub const LOG_RING_CAPACITY: usize = 10 * 1024;

// ─────────────────────────────────────────────────────────────────────────────
// Byte ring
// ─────────────────────────────────────────────────────────────────────────────

/// Bounded ring of raw log bytes. The writer is a single pump task; readers
/// snapshot under a short lock. Oldest bytes are dropped on overflow.
pub struct ByteRing {
    bytes: Mutex<VecDeque<u8>>,
    capacity: usize,
}

impl ByteRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity,
        }
    }

    pub fn append(&self, data: &[u8]) {
        let mut bytes = self.bytes.lock().unwrap();
        for &b in data {
            if bytes.len() >= self.capacity {
                bytes.pop_front();
            }
            bytes.push_back(b);
        }
    }

    /// Last `max_bytes` bytes, oldest first
    pub fn tail(&self, max_bytes: usize) -> Vec<u8> {
        let bytes = self.bytes.lock().unwrap();
        let skip = bytes.len().saturating_sub(max_bytes);
        bytes.iter().skip(skip).copied().collect()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Monitor
// ─────────────────────────────────────────────────────────────────────────────

/// Partially-observed completion summary. The upstream prints prompt and
/// generation timings on separate lines; a Metric is emitted once both
/// halves of one completion have been seen.
#[derive(Default)]
struct PendingMetric {
    prompt_tokens: u64,
    prompt_ms: f64,
    seen: bool,
}

pub struct LogMonitor {
    source: LogSource,
    bus: EventBus,
    ring: ByteRing,
    ready_marker: String,
    marker_tx: watch::Sender<bool>,
    prompt_re: Regex,
    eval_re: Regex,
    pending: Mutex<PendingMetric>,
}

impl LogMonitor {
    pub fn new(source: LogSource, ready_marker: &str, bus: EventBus) -> Self {
        let (marker_tx, _) = watch::channel(false);
        Self {
            source,
            bus,
            ring: ByteRing::new(LOG_RING_CAPACITY),
            ready_marker: ready_marker.to_string(),
            marker_tx,
            // Stable llama.cpp print_timings shape; anything else is ignored
            prompt_re: Regex::new(
                r"prompt eval time\s*=\s*([0-9.]+) ms\s*/\s*([0-9]+) tokens",
            )
            .expect("prompt timing regex"),
            eval_re: Regex::new(
                r"eval time\s*=\s*([0-9.]+) ms\s*/\s*([0-9]+) tokens.*?([0-9.]+) tokens per second",
            )
            .expect("eval timing regex"),
            pending: Mutex::new(PendingMetric::default()),
        }
    }

    /// Subscribe to the readiness marker. The value flips to true at most
    /// once per `reset_marker` cycle.
    pub fn marker_seen(&self) -> watch::Receiver<bool> {
        self.marker_tx.subscribe()
    }

    /// Clear marker state before a (re)launch
    pub fn reset_marker(&self) {
        self.marker_tx.send_replace(false);
    }

    /// Last `max_bytes` of captured output
    pub fn tail(&self, max_bytes: usize) -> Vec<u8> {
        self.ring.tail(max_bytes)
    }

    /// Ingest one output line: ring, bus, marker scan, metric scan
    pub fn ingest_line(&self, line: &str) {
        self.ring.append(line.as_bytes());
        self.ring.append(b"\n");

        self.bus.emit(ProxyEvent::LogLine {
            source: self.source.clone(),
            text: line.to_string(),
            timestamp: Utc::now(),
        });

        if !*self.marker_tx.borrow() && line.contains(&self.ready_marker) {
            self.marker_tx.send_replace(true);
        }

        self.scan_metric(line);
    }

    /// Pump a child stdout/stderr stream through `ingest_line` until EOF
    pub async fn pump<R>(&self, reader: R)
    where
        R: AsyncRead + Unpin,
    {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            self.ingest_line(&line);
        }
    }

    /// Best-effort metric extraction. Prompt timings are held until the
    /// matching generation line arrives; parse failures drop silently.
    fn scan_metric(&self, line: &str) {
        if let Some(caps) = self.prompt_re.captures(line) {
            let (Ok(ms), Ok(tokens)) = (caps[1].parse::<f64>(), caps[2].parse::<u64>()) else {
                return;
            };
            let mut pending = self.pending.lock().unwrap();
            *pending = PendingMetric {
                prompt_tokens: tokens,
                prompt_ms: ms,
                seen: true,
            };
            return;
        }

        // "prompt eval time" also contains "eval time"; the prompt branch
        // above must win, so this only runs on non-matching lines.
        if line.contains("prompt eval time") {
            return;
        }

        if let Some(caps) = self.eval_re.captures(line) {
            let (Ok(eval_ms), Ok(tokens), Ok(tps)) = (
                caps[1].parse::<f64>(),
                caps[2].parse::<u64>(),
                caps[3].parse::<f64>(),
            ) else {
                return;
            };
            let prompt = {
                let mut pending = self.pending.lock().unwrap();
                std::mem::take(&mut *pending)
            };
            let id = match &self.source {
                LogSource::Upstream(id) => id.clone(),
                LogSource::Proxy => return,
            };
            self.bus.emit(ProxyEvent::Metric(TokenMetric {
                id,
                prompt_tokens: if prompt.seen { prompt.prompt_tokens } else { 0 },
                completion_tokens: tokens,
                tokens_per_second: tps,
                duration_ms: (eval_ms + if prompt.seen { prompt.prompt_ms } else { 0.0 }) as u64,
                timestamp: Utc::now(),
            }));
        }
    }
}
