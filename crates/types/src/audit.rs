use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Maximum audit events retained per entity; older events are dropped and
/// counted so growth stays bounded.
pub const MAX_AUDIT_EVENTS: usize = 50;

/// Single append-only audit entry recorded against an entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub actor: String,
    pub action: String,
    pub at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Value,
}

/// Capped audit trail embedded in workflow, run, and credential entities.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditLog {
    #[serde(default)]
    pub events: Vec<AuditEvent>,
    /// Count of events discarded once the cap was reached.
    #[serde(default)]
    pub dropped: u64,
}

impl AuditLog {
    pub fn record(&mut self, actor: &str, action: &str, metadata: Value) {
        self.events.push(AuditEvent {
            actor: actor.to_string(),
            action: action.to_string(),
            at: Utc::now(),
            metadata,
        });
        if self.events.len() > MAX_AUDIT_EVENTS {
            let overflow = self.events.len() - MAX_AUDIT_EVENTS;
            self.events.drain(0..overflow);
            self.dropped += overflow as u64;
        }
    }

    /// Record an event without metadata.
    pub fn record_action(&mut self, actor: &str, action: &str) {
        self.record(actor, action, Value::Object(Map::new()));
    }

    pub fn last(&self) -> Option<&AuditEvent> {
        self.events.last()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
