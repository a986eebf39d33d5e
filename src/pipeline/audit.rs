use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    Transition,
    Decision,
    Filter,
    Guardrail,
    ExternalOk,
    ExternalFailed,
    Retry,
    Degraded,
    CacheHit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub at: DateTime<Utc>,
    pub stage: String,
    pub kind: AuditKind,
    pub message: String,
}

/// Append-only log of every decision taken during one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditTrail {
    pub execution_id: Uuid,
    pub started_at: DateTime<Utc>,
    entries: Vec<AuditEntry>,
}

impl AuditTrail {
    pub fn new(execution_id: Uuid) -> Self {
        Self {
            execution_id,
            started_at: Utc::now(),
            entries: Vec::new(),
        }
    }

    pub fn record(&mut self, stage: &str, kind: AuditKind, message: impl Into<String>) {
        let entry = AuditEntry {
            at: Utc::now(),
            stage: stage.to_string(),
            kind,
            message: message.into(),
        };
        tracing::debug!(
            execution_id = %self.execution_id,
            audit.stage = %entry.stage,
            audit.kind = ?entry.kind,
            "{}",
            entry.message
        );
        self.entries.push(entry);
    }

    pub fn entries(&self) -> &[AuditEntry] {
        &self.entries
    }

    pub fn count(&self, kind: AuditKind) -> usize {
        self.entries.iter().filter(|e| e.kind == kind).count()
    }

    pub fn has(&self, stage: &str, kind: AuditKind) -> bool {
        self.entries
            .iter()
            .any(|e| e.stage == stage && e.kind == kind)
    }
}
