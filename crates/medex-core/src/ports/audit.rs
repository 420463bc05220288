use serde_json::Value;
use uuid::Uuid;

use crate::domain::Role;

/// Audit event emitted by the engine for admin-critical actions.
///
/// Persistence of the audit trail is external; the engine only emits.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub action: String,
    pub actor: Uuid,
    pub role: Role,
    pub before: Value,
    pub after: Value,
    pub reason: String,
    pub request_id: Uuid,
}

/// Abstract sink for audit events.
pub trait AuditSink: Send + Sync {
    fn emit(&self, event: AuditEvent);
}

/// Sink that drops every event. Used in tests and one-off jobs.
#[derive(Debug, Default)]
pub struct NoopAuditSink;

impl AuditSink for NoopAuditSink {
    fn emit(&self, _event: AuditEvent) {}
}

/// Sink that keeps events in memory for assertions.
#[derive(Debug, Default)]
pub struct RecordingAuditSink {
    events: std::sync::Mutex<Vec<AuditEvent>>,
}

impl RecordingAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn count_action(&self, action: &str) -> usize {
        self.events()
            .iter()
            .filter(|e| e.action == action)
            .count()
    }
}

impl AuditSink for RecordingAuditSink {
    fn emit(&self, event: AuditEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
