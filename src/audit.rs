//! Audit events emitted by the sync engine
//!
//! Sinks are fire-and-forget: recording an event must never block or fail
//! the sync path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

/// Audit event type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditEventType {
    Enqueued,
    Synced,
    Conflicted,
    Failed,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enqueued => "enqueued",
            Self::Synced => "synced",
            Self::Conflicted => "conflicted",
            Self::Failed => "failed",
        }
    }
}

/// Structured audit event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_type: AuditEventType,
    pub record_id: String,
    /// Actor behind the mutation, when known
    pub actor_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub details: Value,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType, record_id: impl Into<String>, details: Value) -> Self {
        Self {
            event_type,
            record_id: record_id.into(),
            actor_id: None,
            timestamp: Utc::now(),
            details,
        }
    }

    pub fn with_actor(mut self, actor_id: impl Into<String>) -> Self {
        self.actor_id = Some(actor_id.into());
        self
    }
}

/// Receiver of audit events
pub trait AuditSink: Send + Sync {
    fn record(&self, event: AuditEvent);
}

/// Writes one JSON line per event on the `audit` log target
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAuditSink;

impl AuditSink for LogAuditSink {
    fn record(&self, event: AuditEvent) {
        match serde_json::to_string(&event) {
            Ok(line) => log::info!(target: "audit", "{}", line),
            Err(e) => log::warn!(
                "Failed to serialize {} audit event for {}: {}",
                event.event_type.as_str(),
                event.record_id,
                e
            ),
        }
    }
}

/// Forwards events to an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelAuditSink {
    tx: mpsc::UnboundedSender<AuditEvent>,
}

impl ChannelAuditSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AuditEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl AuditSink for ChannelAuditSink {
    fn record(&self, event: AuditEvent) {
        // Receiver gone means nobody is listening any more
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_serializes_lowercase_type() {
        let event = AuditEvent::new(AuditEventType::Conflicted, "p-1", json!({"strategy": "merge"}))
            .with_actor("d-1");
        let value = serde_json::to_value(&event).unwrap();

        assert_eq!(value["event_type"], json!("conflicted"));
        assert_eq!(value["event_type"], json!(event.event_type.as_str()));
        assert_eq!(value["record_id"], json!("p-1"));
        assert_eq!(value["actor_id"], json!("d-1"));
        assert_eq!(value["details"]["strategy"], json!("merge"));
    }

    #[test]
    fn test_channel_sink_forwards_and_tolerates_closed_receiver() {
        let (sink, mut rx) = ChannelAuditSink::new();
        sink.record(AuditEvent::new(AuditEventType::Enqueued, "p-1", Value::Null));

        let event = rx.try_recv().unwrap();
        assert_eq!(event.event_type, AuditEventType::Enqueued);

        drop(rx);
        sink.record(AuditEvent::new(AuditEventType::Synced, "p-1", Value::Null));
    }

    #[test]
    fn test_log_sink_never_panics() {
        LogAuditSink.record(AuditEvent::new(AuditEventType::Failed, "p-9", json!({"error": "x"})));
    }
}
