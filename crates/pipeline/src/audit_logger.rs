//! Best-effort audit trail writer.
//!
//! Payloads are redacted, serialized and capped before they reach the
//! store. A failed write is reported through `tracing` and never surfaces
//! to the caller.

use std::sync::Arc;

use opsagent_core::audit::{serialize_payload, AuditPhase};
use opsagent_core::run::CostEstimate;
use opsagent_core::types::{DbId, EntityId};
use opsagent_db::models::audit::{AuditPage, AuditQuery, CreateAuditEntry};
use opsagent_db::{AuditStore, StoreResult};
use serde_json::Value;

/// Who and what an audit entry is about.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AuditContext {
    pub conversation_id: Option<EntityId>,
    pub run_id: Option<EntityId>,
    pub user_id: Option<DbId>,
}

/// One audit entry before serialization.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub phase: AuditPhase,
    pub context: AuditContext,
    pub plan_id: Option<EntityId>,
    pub input: Option<Value>,
    pub output: Option<Value>,
    pub duration_ms: Option<i64>,
    pub usage: Option<CostEstimate>,
}

impl AuditRecord {
    pub fn new(phase: AuditPhase, context: AuditContext) -> Self {
        Self {
            phase,
            context,
            plan_id: None,
            input: None,
            output: None,
            duration_ms: None,
            usage: None,
        }
    }

    pub fn with_plan(mut self, plan_id: EntityId) -> Self {
        self.plan_id = Some(plan_id);
        self
    }

    pub fn with_input(mut self, input: Value) -> Self {
        self.input = Some(input);
        self
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_duration(mut self, duration_ms: i64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn with_usage(mut self, usage: Option<CostEstimate>) -> Self {
        self.usage = usage;
        self
    }
}

/// Writes [`AuditRecord`]s to an [`AuditStore`].
#[derive(Clone)]
pub struct AuditLogger {
    store: Arc<dyn AuditStore>,
    max_payload_bytes: usize,
}

impl AuditLogger {
    pub fn new(store: Arc<dyn AuditStore>, max_payload_bytes: usize) -> Self {
        Self {
            store,
            max_payload_bytes,
        }
    }

    fn to_entry(&self, record: AuditRecord) -> CreateAuditEntry {
        let cap = |value: Value| serialize_payload(&value, self.max_payload_bytes);
        CreateAuditEntry {
            conversation_id: record.context.conversation_id,
            plan_id: record.plan_id,
            run_id: record.context.run_id,
            user_id: record.context.user_id,
            input: record.input.map(cap),
            output: record.output.map(cap),
            duration_ms: record.duration_ms,
            input_tokens: record
                .usage
                .as_ref()
                .map(|u| i64::try_from(u.input_tokens).unwrap_or(i64::MAX)),
            output_tokens: record
                .usage
                .as_ref()
                .map(|u| i64::try_from(u.output_tokens).unwrap_or(i64::MAX)),
            cost_usd: record.usage.as_ref().map(|u| u.cost_usd),
            ..CreateAuditEntry::new(record.phase)
        }
    }

    /// Persist one entry. Never fails.
    pub async fn log(&self, record: AuditRecord) {
        let phase = record.phase;
        let run_id = record.context.run_id;
        if let Err(e) = self.store.insert_audit(self.to_entry(record)).await {
            tracing::error!(
                error = %e,
                phase = %phase,
                run_id = ?run_id,
                "Failed to write audit entry",
            );
        }
    }

    /// Filtered, paginated entries, newest first.
    pub async fn entries(&self, query: &AuditQuery) -> StoreResult<AuditPage> {
        self.store.query_audit(query).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use opsagent_core::audit::TRUNCATION_MARKER;
    use opsagent_db::MemoryStore;

    use super::*;

    #[tokio::test]
    async fn long_payloads_are_capped_with_marker() {
        let store = Arc::new(MemoryStore::new());
        let logger = AuditLogger::new(store.clone(), 64);
        let ctx = AuditContext::default();

        logger
            .log(
                AuditRecord::new(AuditPhase::Parse, ctx)
                    .with_input(Value::String("x".repeat(500)))
                    .with_usage(Some(CostEstimate {
                        input_tokens: 900,
                        output_tokens: 40,
                        cost_usd: 0.0021,
                        model: None,
                    })),
            )
            .await;

        let page = logger.entries(&AuditQuery::default()).await.unwrap();
        let entry = &page.items[0];
        let input = entry.input.as_deref().unwrap();
        assert!(input.ends_with(TRUNCATION_MARKER));
        assert_eq!(input.len(), 64 + TRUNCATION_MARKER.len());
        assert_eq!(entry.input_tokens, Some(900));
        assert_eq!(entry.cost_usd, Some(0.0021));
    }

    #[tokio::test]
    async fn sensitive_fields_never_reach_the_store() {
        let store = Arc::new(MemoryStore::new());
        let logger = AuditLogger::new(store, 10_000);
        logger
            .log(
                AuditRecord::new(AuditPhase::Execute, AuditContext::default())
                    .with_output(serde_json::json!({"access_token": "abc", "poId": "45"})),
            )
            .await;

        let page = logger.entries(&AuditQuery::default()).await.unwrap();
        let output = page.items[0].output.as_deref().unwrap();
        assert!(output.contains("[REDACTED]"));
        assert!(!output.contains("abc"));
    }
}
