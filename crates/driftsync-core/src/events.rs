//! Event stream to the frontend
//!
//! All subsystems publish one-way, typed events tagged `domain:action`
//! (`auth:locked`, `sync:progress`, `board:execution_status`, ...). Every
//! envelope carries an RFC 3339 timestamp and a process-monotonic sequence
//! number so consumers can detect gaps.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

/// A single event on the to-frontend stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// `domain:action` tag, e.g. `sync:progress`.
    pub event: String,
    /// Process-monotonic sequence number for gap detection.
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Sink for publishing events; implemented by the frontend transport.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &str, payload: serde_json::Value);
}

/// Channel-backed event sink.
///
/// The channel is bounded; on overflow the event is dropped rather than
/// blocking the publisher.
pub struct EventBus {
    tx: mpsc::Sender<EventEnvelope>,
    seq: AtomicU64,
}

impl EventBus {
    /// Creates a bus with the given channel capacity and returns the
    /// receiving half for the frontend transport.
    pub fn new(capacity: usize) -> (Arc<Self>, mpsc::Receiver<EventEnvelope>) {
        let (tx, rx) = mpsc::channel(capacity);
        (
            Arc::new(EventBus {
                tx,
                seq: AtomicU64::new(0),
            }),
            rx,
        )
    }
}

impl EventSink for EventBus {
    fn emit(&self, event: &str, payload: serde_json::Value) {
        let envelope = EventEnvelope {
            event: event.to_string(),
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            timestamp: Utc::now(),
            payload,
        };
        if self.tx.try_send(envelope).is_err() {
            debug!(event, "Event channel full, dropping event");
        }
    }
}

/// A sink that discards everything. Useful in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullEventSink;

impl EventSink for NullEventSink {
    fn emit(&self, _event: &str, _payload: serde_json::Value) {}
}

/// Builds the payload for an `error:occurred` event.
pub fn error_payload(
    code: &str,
    message: &str,
    details: Option<&str>,
    tab_id: Option<&str>,
) -> serde_json::Value {
    serde_json::json!({
        "code": code,
        "message": message,
        "details": details,
        "tab_id": tab_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_sequence_numbers_are_monotonic() {
        let (bus, mut rx) = EventBus::new(8);
        bus.emit("auth:locked", serde_json::Value::Null);
        bus.emit("auth:unlocked", serde_json::Value::Null);
        bus.emit("sync:started", serde_json::json!({"task": 1}));

        let a = rx.recv().await.unwrap();
        let b = rx.recv().await.unwrap();
        let c = rx.recv().await.unwrap();
        assert_eq!(a.seq, 0);
        assert_eq!(b.seq, 1);
        assert_eq!(c.seq, 2);
        assert_eq!(c.event, "sync:started");
    }

    #[tokio::test]
    async fn test_full_channel_drops_instead_of_blocking() {
        let (bus, mut rx) = EventBus::new(1);
        bus.emit("log:message", serde_json::json!({"line": "one"}));
        bus.emit("log:message", serde_json::json!({"line": "two"}));

        // Only the first event fits; the second was dropped, but seq still
        // advanced so the gap is detectable.
        let first = rx.recv().await.unwrap();
        assert_eq!(first.seq, 0);
        bus.emit("log:message", serde_json::json!({"line": "three"}));
        let next = rx.recv().await.unwrap();
        assert_eq!(next.seq, 2);
    }

    #[test]
    fn test_error_payload_shape() {
        let payload = error_payload("CYCLE", "board has a cycle", Some("e1,e2"), None);
        assert_eq!(payload["code"], "CYCLE");
        assert_eq!(payload["details"], "e1,e2");
        assert!(payload["tab_id"].is_null());
    }
}
