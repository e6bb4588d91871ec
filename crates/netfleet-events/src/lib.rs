use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

/// Minimal event envelope (RFC3339 time).
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Envelope {
    pub time: String,
    pub kind: String,
    pub payload: Value,
}

impl Envelope {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            time: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            kind: kind.into(),
            payload,
        }
    }

    /// Task id carried by lifecycle events, if any.
    pub fn task_id(&self) -> Option<&str> {
        self.payload.get("task_id").and_then(|v| v.as_str())
    }
}

/// A simple broadcast bus for JSON-serializable events.
///
/// Publishing never blocks and never fails the caller; events published while
/// nobody is subscribed are dropped.
#[derive(Clone)]
pub struct Bus {
    tx: broadcast::Sender<Envelope>,
}

impl Bus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn publish<T: Serialize>(&self, kind: &str, payload: &T) {
        let val =
            serde_json::to_value(payload).unwrap_or_else(|_| serde_json::json!({"_ser":"error"}));
        if self.tx.send(Envelope::new(kind, val)).is_err() {
            tracing::trace!(kind, "event dropped; no subscribers");
        }
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new(256)
    }
}
