//! Repository for the `audit_logs` table.
//!
//! Rows are append-only; there is no update or delete path other than the
//! conversation cascade.

use opsagent_core::audit::AuditPhase;
use opsagent_core::types::{DbId, EntityId, Timestamp};
use sqlx::{FromRow, PgPool};

use super::{bind_values, bind_values_scalar, BindValue, Clauses};
use crate::models::audit::{AuditEntry, AuditQuery, CreateAuditEntry};
use crate::store::StoreError;

/// Column list for `audit_logs` SELECT queries.
const COLUMNS: &str = "\
    id, phase, conversation_id, plan_id, run_id, user_id, input, output, \
    duration_ms, input_tokens, output_tokens, cost_usd, created_at";

#[derive(Debug, Clone, FromRow)]
pub struct AuditRow {
    pub id: EntityId,
    pub phase: String,
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
    pub created_at: Timestamp,
}

impl TryFrom<AuditRow> for AuditEntry {
    type Error = StoreError;

    fn try_from(row: AuditRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            phase: AuditPhase::from_str(&row.phase)?,
            conversation_id: row.conversation_id,
            plan_id: row.plan_id,
            run_id: row.run_id,
            user_id: row.user_id,
            input: row.input,
            output: row.output,
            duration_ms: row.duration_ms,
            input_tokens: row.input_tokens,
            output_tokens: row.output_tokens,
            cost_usd: row.cost_usd,
            created_at: row.created_at,
        })
    }
}

/// Provides insert and query operations for the audit trail.
pub struct AuditRepo;

impl AuditRepo {
    pub async fn insert(
        pool: &PgPool,
        id: EntityId,
        entry: &CreateAuditEntry,
    ) -> Result<AuditRow, sqlx::Error> {
        let query = format!(
            "INSERT INTO audit_logs \
                (id, phase, conversation_id, plan_id, run_id, user_id, input, output, \
                 duration_ms, input_tokens, output_tokens, cost_usd) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, AuditRow>(&query)
            .bind(id)
            .bind(entry.phase.as_str())
            .bind(entry.conversation_id)
            .bind(entry.plan_id)
            .bind(entry.run_id)
            .bind(entry.user_id)
            .bind(&entry.input)
            .bind(&entry.output)
            .bind(entry.duration_ms)
            .bind(entry.input_tokens)
            .bind(entry.output_tokens)
            .bind(entry.cost_usd)
            .fetch_one(pool)
            .await
    }

    /// Query audit entries newest first with filtering and pagination.
    pub async fn query(pool: &PgPool, params: &AuditQuery) -> Result<Vec<AuditRow>, sqlx::Error> {
        let filter = build_audit_filter(params);
        let limit_idx = filter.next_idx();
        let query = format!(
            "SELECT {COLUMNS} FROM audit_logs {} \
             ORDER BY created_at DESC, id DESC \
             LIMIT ${limit_idx} OFFSET ${}",
            filter.where_clause(),
            limit_idx + 1
        );
        bind_values(sqlx::query_as::<_, AuditRow>(&query), &filter.values)
            .bind(params.effective_limit())
            .bind(params.effective_offset())
            .fetch_all(pool)
            .await
    }

    /// Count entries matching the filter (for pagination metadata).
    pub async fn count(pool: &PgPool, params: &AuditQuery) -> Result<i64, sqlx::Error> {
        let filter = build_audit_filter(params);
        let query = format!(
            "SELECT COUNT(*)::BIGINT AS count FROM audit_logs {}",
            filter.where_clause()
        );
        bind_values_scalar(sqlx::query_scalar::<_, i64>(&query), &filter.values)
            .fetch_one(pool)
            .await
    }
}

fn build_audit_filter(params: &AuditQuery) -> Clauses {
    let mut filter = Clauses::default();
    if let Some(conversation_id) = params.conversation_id {
        filter.push("conversation_id =", BindValue::Uuid(conversation_id));
    }
    if let Some(run_id) = params.run_id {
        filter.push("run_id =", BindValue::Uuid(run_id));
    }
    if let Some(phase) = params.phase {
        filter.push("phase =", BindValue::Text(phase.as_str().to_string()));
    }
    if let Some(from) = params.from {
        filter.push("created_at >=", BindValue::Timestamp(from));
    }
    if let Some(to) = params.to {
        filter.push("created_at <=", BindValue::Timestamp(to));
    }
    filter
}
