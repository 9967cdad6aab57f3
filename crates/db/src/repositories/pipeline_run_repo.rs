//! Repository for the `pipeline_runs` and `pipeline_stages` tables.

use opsagent_core::run::{
    upsert_progress_item, CostEstimate, PipelineRun, PipelineStage, ProgressItem, RunMode,
    RunStatus, StageKind, StageStatus,
};
use opsagent_core::types::{new_id, DbId, EntityId, Timestamp};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};

use super::{bind_values, BindValue, Clauses};
use crate::models::run::{NewPipelineRun, RunQuery, UpdatePipelineRun, UpdatePipelineStage};
use crate::store::StoreError;

// ---------------------------------------------------------------------------
// Column lists
// ---------------------------------------------------------------------------

/// Column list for `pipeline_runs` SELECT queries.
const RUN_COLUMNS: &str = "\
    id, name, conversation_id, input, status, mode, current_stage, \
    result, error, user_id, started_at, completed_at, created_at, duration_ms";

/// Column list for `pipeline_stages` SELECT queries.
const STAGE_COLUMNS: &str = "\
    id, run_id, stage, status, stage_order, started_at, completed_at, \
    duration_ms, detail, input, output, progress_items, error, cost_estimate";

/// Columns bound per stage in the multi-row INSERT.
const STAGE_INSERT_COLUMNS: &str = "id, run_id, stage, status, stage_order";

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, FromRow)]
pub struct PipelineRunRow {
    pub id: EntityId,
    pub name: Option<String>,
    pub conversation_id: Option<EntityId>,
    pub input: String,
    pub status: String,
    pub mode: String,
    pub current_stage: Option<String>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub user_id: Option<DbId>,
    pub started_at: Timestamp,
    pub completed_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub duration_ms: Option<i64>,
}

impl TryFrom<PipelineRunRow> for PipelineRun {
    type Error = StoreError;

    fn try_from(row: PipelineRunRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            name: row.name,
            conversation_id: row.conversation_id,
            input: row.input,
            status: RunStatus::from_str(&row.status)?,
            mode: RunMode::from_str(&row.mode)?,
            current_stage: row
                .current_stage
                .as_deref()
                .map(StageKind::from_str)
                .transpose()?,
            result: row.result,
            error: row.error,
            user_id: row.user_id,
            started_at: row.started_at,
            completed_at: row.completed_at,
            created_at: row.created_at,
            duration_ms: row.duration_ms,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct PipelineStageRow {
    pub id: EntityId,
    pub run_id: EntityId,
    pub stage: String,
    pub status: String,
    pub stage_order: i16,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub duration_ms: Option<i64>,
    pub detail: Option<String>,
    pub input: Option<serde_json::Value>,
    pub output: Option<serde_json::Value>,
    pub progress_items: Json<Vec<ProgressItem>>,
    pub error: Option<String>,
    pub cost_estimate: Option<Json<CostEstimate>>,
}

impl TryFrom<PipelineStageRow> for PipelineStage {
    type Error = StoreError;

    fn try_from(row: PipelineStageRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            run_id: row.run_id,
            stage: StageKind::from_str(&row.stage)?,
            status: StageStatus::from_str(&row.status)?,
            order: row.stage_order,
            started_at: row.started_at,
            completed_at: row.completed_at,
            duration_ms: row.duration_ms,
            detail: row.detail,
            input: row.input,
            output: row.output,
            progress_items: row.progress_items.0,
            error: row.error,
            cost_estimate: row.cost_estimate.map(|c| c.0),
        })
    }
}

// ---------------------------------------------------------------------------
// PipelineRunRepo
// ---------------------------------------------------------------------------

/// Queries for runs and their stage records.
pub struct PipelineRunRepo;

impl PipelineRunRepo {
    /// Insert a run at `parsing` together with its five pending stages in
    /// one transaction.
    pub async fn create(
        pool: &PgPool,
        input: &NewPipelineRun,
    ) -> Result<(PipelineRunRow, Vec<PipelineStageRow>), sqlx::Error> {
        let mut tx = pool.begin().await?;

        let run_query = format!(
            "INSERT INTO pipeline_runs \
                (id, name, conversation_id, input, status, mode, current_stage, user_id) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
             RETURNING {RUN_COLUMNS}"
        );
        let run = sqlx::query_as::<_, PipelineRunRow>(&run_query)
            .bind(new_id())
            .bind(&input.name)
            .bind(input.conversation_id)
            .bind(&input.input)
            .bind(RunStatus::Running.as_str())
            .bind(input.mode.as_str())
            .bind(StageKind::Parsing.as_str())
            .bind(input.user_id)
            .fetch_one(&mut *tx)
            .await?;

        // One multi-row INSERT for all five stages.
        let mut stage_query = format!("INSERT INTO pipeline_stages ({STAGE_INSERT_COLUMNS}) VALUES ");
        let mut param_idx = 1u32;
        for (i, _) in StageKind::ALL.iter().enumerate() {
            if i > 0 {
                stage_query.push_str(", ");
            }
            stage_query.push('(');
            for col in 0..5 {
                if col > 0 {
                    stage_query.push_str(", ");
                }
                stage_query.push_str(&format!("${param_idx}"));
                param_idx += 1;
            }
            stage_query.push(')');
        }
        stage_query.push_str(&format!(" RETURNING {STAGE_COLUMNS}"));

        let mut q = sqlx::query_as::<_, PipelineStageRow>(&stage_query);
        for kind in StageKind::ALL {
            q = q
                .bind(new_id())
                .bind(run.id)
                .bind(kind.as_str())
                .bind(StageStatus::Pending.as_str())
                .bind(kind.order());
        }
        let mut stages = q.fetch_all(&mut *tx).await?;
        stages.sort_by_key(|s| s.stage_order);

        tx.commit().await?;
        Ok((run, stages))
    }

    pub async fn find_by_id(
        pool: &PgPool,
        id: EntityId,
    ) -> Result<Option<PipelineRunRow>, sqlx::Error> {
        let query = format!("SELECT {RUN_COLUMNS} FROM pipeline_runs WHERE id = $1");
        sqlx::query_as::<_, PipelineRunRow>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Stages of a run ordered by their fixed sequence index.
    pub async fn list_stages(
        pool: &PgPool,
        run_id: EntityId,
    ) -> Result<Vec<PipelineStageRow>, sqlx::Error> {
        let query = format!(
            "SELECT {STAGE_COLUMNS} FROM pipeline_stages \
             WHERE run_id = $1 ORDER BY stage_order ASC"
        );
        sqlx::query_as::<_, PipelineStageRow>(&query)
            .bind(run_id)
            .fetch_all(pool)
            .await
    }

    /// List runs newest first with optional status/owner filters.
    pub async fn list(pool: &PgPool, params: &RunQuery) -> Result<Vec<PipelineRunRow>, sqlx::Error> {
        let filter = build_run_filter(params);
        let limit_idx = filter.next_idx();
        let query = format!(
            "SELECT {RUN_COLUMNS} FROM pipeline_runs {} \
             ORDER BY created_at DESC, id DESC \
             LIMIT ${limit_idx} OFFSET ${}",
            filter.where_clause(),
            limit_idx + 1
        );
        bind_values(sqlx::query_as::<_, PipelineRunRow>(&query), &filter.values)
            .bind(params.effective_limit())
            .bind(params.effective_offset())
            .fetch_all(pool)
            .await
    }

    /// Apply a partial update. An empty update just re-reads the row.
    pub async fn update(
        pool: &PgPool,
        id: EntityId,
        input: &UpdatePipelineRun,
    ) -> Result<Option<PipelineRunRow>, sqlx::Error> {
        let sets = build_run_update(input);
        if sets.is_empty() {
            return Self::find_by_id(pool, id).await;
        }
        let query = format!(
            "UPDATE pipeline_runs SET {} WHERE id = ${} RETURNING {RUN_COLUMNS}",
            sets.set_clause(),
            sets.next_idx()
        );
        bind_values(sqlx::query_as::<_, PipelineRunRow>(&query), &sets.values)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    pub async fn update_stage(
        pool: &PgPool,
        stage_id: EntityId,
        input: &UpdatePipelineStage,
    ) -> Result<Option<PipelineStageRow>, StoreError> {
        let sets = build_stage_update(input)?;
        if sets.is_empty() {
            let query = format!("SELECT {STAGE_COLUMNS} FROM pipeline_stages WHERE id = $1");
            return Ok(sqlx::query_as::<_, PipelineStageRow>(&query)
                .bind(stage_id)
                .fetch_optional(pool)
                .await?);
        }
        let query = format!(
            "UPDATE pipeline_stages SET {} WHERE id = ${} RETURNING {STAGE_COLUMNS}",
            sets.set_clause(),
            sets.next_idx()
        );
        Ok(
            bind_values(sqlx::query_as::<_, PipelineStageRow>(&query), &sets.values)
                .bind(stage_id)
                .fetch_optional(pool)
                .await?,
        )
    }

    /// Upsert a progress item under a row lock so that concurrent writers
    /// never drop each other's entries.
    pub async fn upsert_progress_item(
        pool: &PgPool,
        stage_id: EntityId,
        item: ProgressItem,
    ) -> Result<Option<PipelineStageRow>, sqlx::Error> {
        let mut tx = pool.begin().await?;

        let current = sqlx::query_scalar::<_, Json<Vec<ProgressItem>>>(
            "SELECT progress_items FROM pipeline_stages WHERE id = $1 FOR UPDATE",
        )
        .bind(stage_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(Json(mut items)) = current else {
            return Ok(None);
        };
        upsert_progress_item(&mut items, item);

        let query = format!(
            "UPDATE pipeline_stages SET progress_items = $2 WHERE id = $1 \
             RETURNING {STAGE_COLUMNS}"
        );
        let row = sqlx::query_as::<_, PipelineStageRow>(&query)
            .bind(stage_id)
            .bind(Json(items))
            .fetch_optional(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(row)
    }

    /// Non-terminal runs with no `completed_at` started before `cutoff`.
    pub async fn find_stale(
        pool: &PgPool,
        cutoff: Timestamp,
    ) -> Result<Vec<PipelineRunRow>, sqlx::Error> {
        let statuses: Vec<String> = RunStatus::non_terminal()
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();
        let query = format!(
            "SELECT {RUN_COLUMNS} FROM pipeline_runs \
             WHERE status = ANY($1) AND completed_at IS NULL AND started_at < $2 \
             ORDER BY started_at ASC"
        );
        sqlx::query_as::<_, PipelineRunRow>(&query)
            .bind(statuses)
            .bind(cutoff)
            .fetch_all(pool)
            .await
    }
}

// ---------------------------------------------------------------------------
// Query builders
// ---------------------------------------------------------------------------

fn build_run_filter(params: &RunQuery) -> Clauses {
    let mut filter = Clauses::default();
    if let Some(status) = params.status {
        filter.push("status =", BindValue::Text(status.as_str().to_string()));
    }
    if let Some(user_id) = params.user_id {
        filter.push("user_id =", BindValue::BigInt(user_id));
    }
    filter
}

fn build_run_update(input: &UpdatePipelineRun) -> Clauses {
    let mut sets = Clauses::default();
    if let Some(status) = input.status {
        sets.push("status =", BindValue::Text(status.as_str().to_string()));
    }
    if let Some(stage) = input.current_stage {
        sets.push(
            "current_stage =",
            BindValue::NullableText(stage.map(|s| s.as_str().to_string())),
        );
    }
    if let Some(ref result) = input.result {
        sets.push("result =", BindValue::Json(result.clone()));
    }
    if let Some(ref error) = input.error {
        sets.push("error =", BindValue::NullableText(error.clone()));
    }
    if let Some(completed_at) = input.completed_at {
        sets.push("completed_at =", BindValue::Timestamp(completed_at));
    }
    if let Some(duration_ms) = input.duration_ms {
        sets.push("duration_ms =", BindValue::NullableBigInt(Some(duration_ms)));
    }
    sets
}

fn build_stage_update(input: &UpdatePipelineStage) -> Result<Clauses, StoreError> {
    let mut sets = Clauses::default();
    if let Some(status) = input.status {
        sets.push("status =", BindValue::Text(status.as_str().to_string()));
    }
    if let Some(started_at) = input.started_at {
        sets.push("started_at =", BindValue::Timestamp(started_at));
    }
    if let Some(completed_at) = input.completed_at {
        sets.push("completed_at =", BindValue::Timestamp(completed_at));
    }
    if let Some(duration_ms) = input.duration_ms {
        sets.push("duration_ms =", BindValue::NullableBigInt(Some(duration_ms)));
    }
    if let Some(ref detail) = input.detail {
        sets.push("detail =", BindValue::Text(detail.clone()));
    }
    if let Some(ref value) = input.input {
        sets.push("input =", BindValue::Json(value.clone()));
    }
    if let Some(ref value) = input.output {
        sets.push("output =", BindValue::Json(value.clone()));
    }
    if let Some(ref error) = input.error {
        sets.push("error =", BindValue::NullableText(error.clone()));
    }
    if let Some(ref cost) = input.cost_estimate {
        sets.push("cost_estimate =", BindValue::Json(serde_json::to_value(cost)?));
    }
    Ok(sets)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_filter_has_no_where_clause() {
        let filter = build_run_filter(&RunQuery::default());
        assert_eq!(filter.where_clause(), "");
        assert_eq!(filter.next_idx(), 1);
    }

    #[test]
    fn filter_numbers_placeholders_in_order() {
        let filter = build_run_filter(&RunQuery {
            status: Some(RunStatus::AwaitingApproval),
            user_id: Some(3),
            ..Default::default()
        });
        assert_eq!(filter.where_clause(), "WHERE status = $1 AND user_id = $2");
        assert_eq!(filter.next_idx(), 3);
    }

    #[test]
    fn run_update_distinguishes_clear_from_leave() {
        let update = UpdatePipelineRun::status(RunStatus::Running).with_stage(None);
        let sets = build_run_update(&update);
        assert_eq!(sets.set_clause(), "status = $1, current_stage = $2");
        assert!(matches!(sets.values[1], BindValue::NullableText(None)));
    }

    #[test]
    fn stage_reset_clears_error_and_sets_pending() {
        let sets = build_stage_update(&UpdatePipelineStage::reset()).unwrap();
        assert_eq!(sets.set_clause(), "status = $1, detail = $2, error = $3");
    }

    #[test]
    fn stage_cost_is_bound_as_json() {
        let update = UpdatePipelineStage {
            cost_estimate: Some(CostEstimate {
                input_tokens: 1200,
                output_tokens: 85,
                cost_usd: 0.004_321,
                model: None,
            }),
            ..Default::default()
        };
        let sets = build_stage_update(&update).unwrap();
        assert_eq!(sets.set_clause(), "cost_estimate = $1");
        assert!(matches!(
            &sets.values[0],
            BindValue::Json(value) if value["cost_usd"] == 0.004_321
        ));
    }
}
