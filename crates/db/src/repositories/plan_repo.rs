//! Repository for the `execution_plans` table.

use opsagent_core::plan::{ExecutionPlan, ExecutionResult, PlanStatus};
use opsagent_core::types::{DbId, EntityId, Timestamp};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};

use crate::models::plan::{NewPlan, StoredPlan};
use crate::store::StoreError;

/// Column list for `execution_plans` queries.
const COLUMNS: &str = "\
    id, conversation_id, run_id, user_id, plan, status, result, created_at, updated_at";

#[derive(Debug, Clone, FromRow)]
pub struct PlanRow {
    pub id: EntityId,
    pub conversation_id: Option<EntityId>,
    pub run_id: Option<EntityId>,
    pub user_id: Option<DbId>,
    pub plan: Json<ExecutionPlan>,
    pub status: String,
    pub result: Option<Json<ExecutionResult>>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl TryFrom<PlanRow> for StoredPlan {
    type Error = StoreError;

    fn try_from(row: PlanRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            conversation_id: row.conversation_id,
            run_id: row.run_id,
            user_id: row.user_id,
            plan: row.plan.0,
            status: PlanStatus::from_str(&row.status)?,
            result: row.result.map(|r| r.0),
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Provides persistence for execution plans and their lifecycle.
pub struct PlanRepo;

impl PlanRepo {
    /// Store a freshly compiled plan as `pending`. The row id is the plan id.
    pub async fn create(pool: &PgPool, input: &NewPlan) -> Result<PlanRow, sqlx::Error> {
        let query = format!(
            "INSERT INTO execution_plans (id, conversation_id, run_id, user_id, plan, status) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, PlanRow>(&query)
            .bind(input.plan.id)
            .bind(input.conversation_id)
            .bind(input.run_id)
            .bind(input.user_id)
            .bind(Json(&input.plan))
            .bind(PlanStatus::Pending.as_str())
            .fetch_one(pool)
            .await
    }

    pub async fn find_by_id(pool: &PgPool, id: EntityId) -> Result<Option<PlanRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM execution_plans WHERE id = $1");
        sqlx::query_as::<_, PlanRow>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Move a plan between statuses only if it is still in `from`.
    ///
    /// The status guard in the WHERE clause makes concurrent approvals
    /// race-safe: exactly one caller gets the row back.
    pub async fn transition(
        pool: &PgPool,
        id: EntityId,
        from: PlanStatus,
        to: PlanStatus,
        result: Option<&ExecutionResult>,
    ) -> Result<Option<PlanRow>, sqlx::Error> {
        let query = format!(
            "UPDATE execution_plans \
             SET status = $3, result = COALESCE($4, result), updated_at = NOW() \
             WHERE id = $1 AND status = $2 \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, PlanRow>(&query)
            .bind(id)
            .bind(from.as_str())
            .bind(to.as_str())
            .bind(result.map(Json))
            .fetch_optional(pool)
            .await
    }
}
