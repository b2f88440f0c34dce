//! Fan-out of structured events to observer-only consumers (the WebSocket
//! clients wired up in [`crate::rest`]). Delivery is best-effort: a consumer
//! whose send fails is dropped from the set, never retried.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tokio::sync::{mpsc, RwLock};

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SessionState,
    PtyOutput,
    SupervisorPtyOutput,
    HookEvent,
    SupervisorCall,
    SupervisorDecision,
    SupervisorState,
    CommandInject,
    IterationUpdate,
    Error,
    Connected,
}

#[derive(Debug, Clone, Serialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub timestamp: chrono::DateTime<Utc>,
    pub data: serde_json::Value,
}

impl Envelope {
    pub fn new(kind: EventKind, data: serde_json::Value) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            data,
        }
    }
}

/// Matches ANSI control sequences: CSI (cursor motion, SGR color, screen
/// clears), OSC (title-setting), and lone escape-prefixed single-char
/// sequences. Presentation-only — this regex must never be consulted by
/// anything that decides worker completion.
static CONTROL_SEQUENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\x1b(\[[0-9;?]*[ -/]*[@-~]|\][^\x07\x1b]*(\x07|\x1b\\)|[@-_])").unwrap()
});

/// Lines that are pure visual noise once control sequences are gone: spinner
/// glyphs, box-drawing borders, transient status words, welcome banners.
static NOISE_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)^\s*([|/\\-]|[\u{2500}-\u{257F}]+|thinking[.…]*|esc to interrupt|welcome to \w+)\s*$",
    )
    .unwrap()
});

/// Strips ANSI control sequences, then drops noise-vocabulary lines and
/// collapsed runs of the last N duplicate lines. Idempotent: running it
/// twice on its own output is a no-op.
pub fn clean_for_display(raw: &str) -> String {
    let stripped = CONTROL_SEQUENCE.replace_all(raw, "");
    let mut last_lines: VecDeque<&str> = VecDeque::with_capacity(3);
    let mut out_lines: Vec<String> = Vec::new();

    for line in stripped.split('\n') {
        if NOISE_LINE.is_match(line) {
            continue;
        }
        if last_lines.iter().any(|seen| *seen == line) && !line.trim().is_empty() {
            continue;
        }
        out_lines.push(line.to_string());
        if last_lines.len() == 3 {
            last_lines.pop_front();
        }
        last_lines.push_back(line);
    }

    out_lines.join("\n")
}

struct Consumer {
    id: u64,
    tx: mpsc::Sender<Envelope>,
}

pub struct Broadcaster {
    consumers: RwLock<Vec<Consumer>>,
    next_id: AtomicU64,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl Broadcaster {
    pub fn new() -> Self {
        Self {
            consumers: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers a new observer and returns a receiver of raw envelopes plus
    /// a handle used to deregister on disconnect.
    pub async fn subscribe(&self) -> (u64, mpsc::Receiver<Envelope>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(256);
        self.consumers.write().await.push(Consumer { id, tx });
        (id, rx)
    }

    pub async fn unsubscribe(&self, id: u64) {
        self.consumers.write().await.retain(|c| c.id != id);
    }

    pub async fn publish(&self, kind: EventKind, data: serde_json::Value) {
        let envelope = Envelope::new(kind, data);
        let mut dead = Vec::new();
        let consumers = self.consumers.read().await;
        for consumer in consumers.iter() {
            if consumer.tx.try_send(envelope.clone()).is_err() {
                dead.push(consumer.id);
            }
        }
        drop(consumers);
        if !dead.is_empty() {
            self.consumers.write().await.retain(|c| !dead.contains(&c.id));
        }
    }

    pub async fn publish_pty_output(&self, raw: &str) {
        let cleaned = clean_for_display(raw);
        if cleaned.is_empty() {
            return;
        }
        self.publish(EventKind::PtyOutput, serde_json::json!({ "text": cleaned }))
            .await;
    }

    pub async fn publish_supervisor_pty_output(&self, raw: &str) {
        let cleaned = clean_for_display(raw);
        if cleaned.is_empty() {
            return;
        }
        self.publish(
            EventKind::SupervisorPtyOutput,
            serde_json::json!({ "text": cleaned }),
        )
        .await;
    }

    pub async fn consumer_count(&self) -> usize {
        self.consumers.read().await.len()
    }
}

pub type SharedBroadcaster = Arc<Broadcaster>;
