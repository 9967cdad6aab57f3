//! Audit trail models and DTOs.
//!
//! Audit entries are immutable once created (no `updated_at`).

use opsagent_core::audit::AuditPhase;
use opsagent_core::types::{DbId, EntityId, Timestamp};
use serde::{Deserialize, Serialize};

/// Default page size for audit queries.
pub const DEFAULT_AUDIT_PAGE_SIZE: i64 = 50;

/// Largest page a caller may request.
pub const MAX_AUDIT_PAGE_SIZE: i64 = 500;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditEntry {
    pub id: EntityId,
    pub phase: AuditPhase,
    pub conversation_id: Option<EntityId>,
    pub plan_id: Option<EntityId>,
    pub run_id: Option<EntityId>,
    pub user_id: Option<DbId>,
    /// Serialized, redacted and capped payloads.
    pub input: Option<String>,
    pub output: Option<String>,
    pub duration_ms: Option<i64>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub cost_usd: Option<f64>,
    pub created_at: Timestamp,
}

/// Insert DTO. Payloads must already be serialized and capped.
#[derive(Debug, Clone)]
pub struct CreateAuditEntry {
    pub phase: AuditPhase,
    pub conversation_id: Option<EntityId>,
    pub plan_id: Option<EntityId>,
    pub run_id: Option<EntityId>,
    pub user_id: Option<DbId>,
    pub input: Option<String>,
    pub output: Option<String>,
    pub duration_ms: Option<i64>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub cost_usd: Option<f64>,
}

impl CreateAuditEntry {
    pub fn new(phase: AuditPhase) -> Self {
        Self {
            phase,
            conversation_id: None,
            plan_id: None,
            run_id: None,
            user_id: None,
            input: None,
            output: None,
            duration_ms: None,
            input_tokens: None,
            output_tokens: None,
            cost_usd: None,
        }
    }
}

/// Filter parameters for querying the audit trail. Results are newest first.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditQuery {
    pub conversation_id: Option<EntityId>,
    pub run_id: Option<EntityId>,
    pub phase: Option<AuditPhase>,
    pub from: Option<Timestamp>,
    pub to: Option<Timestamp>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl AuditQuery {
    pub fn effective_limit(&self) -> i64 {
        self.limit
            .unwrap_or(DEFAULT_AUDIT_PAGE_SIZE)
            .clamp(1, MAX_AUDIT_PAGE_SIZE)
    }

    pub fn effective_offset(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }

    /// In-process equivalent of the SQL filter.
    pub fn matches(&self, entry: &AuditEntry) -> bool {
        self.conversation_id
            .map_or(true, |id| entry.conversation_id == Some(id))
            && self.run_id.map_or(true, |id| entry.run_id == Some(id))
            && self.phase.map_or(true, |p| entry.phase == p)
            && self.from.map_or(true, |from| entry.created_at >= from)
            && self.to.map_or(true, |to| entry.created_at <= to)
    }
}

/// Paginated response for audit queries.
#[derive(Debug, Clone, Serialize)]
pub struct AuditPage {
    pub items: Vec<AuditEntry>,
    pub total: i64,
}
