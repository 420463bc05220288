//! In-process audit event sink.
//!
//! Architecture:
//! - The engine is the source of truth and emits events into a bounded buffer
//! - The host process drains the buffer into its audit persistence
//! - Events carry a monotonic sequence for gap detection downstream

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use medex_core::ports::{AuditEvent, AuditSink};

/// Buffer capacity (drop oldest on overflow).
const BUFFER_CAPACITY: usize = 256;

/// Serialized form handed to the host process.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditEnvelope {
    pub action: String,
    pub actor: String,
    pub role: String,
    pub before: serde_json::Value,
    pub after: serde_json::Value,
    pub reason: String,
    pub request_id: String,
    /// Unix timestamp in milliseconds
    pub timestamp_ms: i64,
    /// Monotonic sequence number (per process)
    pub seq: u64,
}

/// Bounded in-memory audit sink shared across services.
#[derive(Debug, Default)]
pub struct AuditBuffer {
    events: Mutex<VecDeque<AuditEnvelope>>,
    seq: AtomicU64,
}

impl AuditBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain all buffered events (call from the host's audit writer).
    pub fn drain(&self) -> Vec<AuditEnvelope> {
        self.events
            .lock()
            .map(|mut buffer| buffer.drain(..).collect())
            .unwrap_or_default()
    }

    pub fn pending_count(&self) -> usize {
        self.events.lock().map(|b| b.len()).unwrap_or(0)
    }

    /// Count buffered events for one action (test helper).
    pub fn count_action(&self, action: &str) -> usize {
        self.events
            .lock()
            .map(|buffer| buffer.iter().filter(|e| e.action == action).count())
            .unwrap_or(0)
    }
}

impl AuditSink for AuditBuffer {
    fn emit(&self, event: AuditEvent) {
        let envelope = AuditEnvelope {
            action: event.action,
            actor: event.actor.to_string(),
            role: event.role.as_str().to_string(),
            before: event.before,
            after: event.after,
            reason: event.reason,
            request_id: event.request_id.to_string(),
            timestamp_ms: chrono::Utc::now().timestamp_millis(),
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
        };

        if let Ok(mut buffer) = self.events.lock() {
            if buffer.len() >= BUFFER_CAPACITY {
                buffer.pop_front(); // Drop oldest
            }
            buffer.push_back(envelope);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use medex_core::domain::Role;
    use uuid::Uuid;

    fn event(action: &str) -> AuditEvent {
        AuditEvent {
            action: action.to_string(),
            actor: Uuid::new_v4(),
            role: Role::Admin,
            before: serde_json::Value::Null,
            after: serde_json::Value::Null,
            reason: "test".to_string(),
            request_id: Uuid::new_v4(),
        }
    }

    #[test]
    fn test_emit_and_drain() {
        let buffer = AuditBuffer::new();
        buffer.emit(event("ALGO_MODE_SWITCH"));
        buffer.emit(event("APPROVAL_REQUESTED"));
        assert_eq!(buffer.pending_count(), 2);

        let drained = buffer.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].action, "ALGO_MODE_SWITCH");
        assert!(drained[0].seq < drained[1].seq);
        assert_eq!(buffer.pending_count(), 0);
    }

    #[test]
    fn test_buffer_overflow_drops_oldest() {
        let buffer = AuditBuffer::new();
        for i in 0..(BUFFER_CAPACITY + 10) {
            buffer.emit(event(&format!("ACTION_{i}")));
        }
        assert_eq!(buffer.pending_count(), BUFFER_CAPACITY);

        let drained = buffer.drain();
        // The oldest 10 were dropped
        assert_eq!(drained[0].action, "ACTION_10");
    }
}
