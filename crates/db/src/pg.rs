//! PostgreSQL implementation of the store traits.
//!
//! A thin adapter: queries live in [`repositories`](crate::repositories),
//! this module converts rows into domain types.

use async_trait::async_trait;
use chrono::Utc;
use opsagent_core::plan::{ExecutionResult, PlanStatus};
use opsagent_core::run::{PipelineRun, PipelineStage, ProgressItem, RunWithStages};
use opsagent_core::types::{new_id, DbId, EntityId};

use crate::models::audit::{AuditEntry, AuditPage, AuditQuery, CreateAuditEntry};
use crate::models::conversation::{
    ActiveEntity, Conversation, Message, NewActiveEntity, NewMessage,
};
use crate::models::plan::{NewPlan, StoredPlan};
use crate::models::run::{NewPipelineRun, RunQuery, UpdatePipelineRun, UpdatePipelineStage};
use crate::repositories::{AuditRepo, ConversationRepo, PipelineRunRepo, PlanRepo};
use crate::store::{
    AuditStore, ConversationStore, PlanStore, RunStore, StoreError, StoreResult,
};
use crate::DbPool;

/// Store backed by a PostgreSQL pool.
#[derive(Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

/// Convert every row, failing on the first corrupt one.
fn convert_all<R, T>(rows: Vec<R>) -> StoreResult<Vec<T>>
where
    T: TryFrom<R, Error = StoreError>,
{
    rows.into_iter()
        .map(|row| {
            T::try_from(row).inspect_err(|e| {
                tracing::error!(error = %e, "Corrupt row in pipeline store");
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// RunStore
// ---------------------------------------------------------------------------

#[async_trait]
impl RunStore for PgStore {
    async fn create_run(&self, input: NewPipelineRun) -> StoreResult<RunWithStages> {
        let (run, stages) = PipelineRunRepo::create(&self.pool, &input).await?;
        Ok(RunWithStages {
            run: run.try_into()?,
            stages: convert_all(stages)?,
        })
    }

    async fn find_run(&self, id: EntityId) -> StoreResult<Option<PipelineRun>> {
        PipelineRunRepo::find_by_id(&self.pool, id)
            .await?
            .map(PipelineRun::try_from)
            .transpose()
    }

    async fn find_run_with_stages(&self, id: EntityId) -> StoreResult<Option<RunWithStages>> {
        let Some(run) = PipelineRunRepo::find_by_id(&self.pool, id).await? else {
            return Ok(None);
        };
        let stages = PipelineRunRepo::list_stages(&self.pool, id).await?;
        Ok(Some(RunWithStages {
            run: run.try_into()?,
            stages: convert_all(stages)?,
        }))
    }

    async fn list_runs(&self, query: &RunQuery) -> StoreResult<Vec<PipelineRun>> {
        convert_all(PipelineRunRepo::list(&self.pool, query).await?)
    }

    async fn update_run(
        &self,
        id: EntityId,
        update: &UpdatePipelineRun,
    ) -> StoreResult<Option<PipelineRun>> {
        PipelineRunRepo::update(&self.pool, id, update)
            .await?
            .map(PipelineRun::try_from)
            .transpose()
    }

    async fn update_stage(
        &self,
        stage_id: EntityId,
        update: &UpdatePipelineStage,
    ) -> StoreResult<Option<PipelineStage>> {
        PipelineRunRepo::update_stage(&self.pool, stage_id, update)
            .await?
            .map(PipelineStage::try_from)
            .transpose()
    }

    async fn append_progress_item(
        &self,
        stage_id: EntityId,
        item: ProgressItem,
    ) -> StoreResult<Option<PipelineStage>> {
        PipelineRunRepo::upsert_progress_item(&self.pool, stage_id, item)
            .await?
            .map(PipelineStage::try_from)
            .transpose()
    }

    async fn find_stale_runs(&self, older_than_ms: i64) -> StoreResult<Vec<PipelineRun>> {
        let cutoff = Utc::now() - chrono::Duration::milliseconds(older_than_ms);
        convert_all(PipelineRunRepo::find_stale(&self.pool, cutoff).await?)
    }
}

// ---------------------------------------------------------------------------
// PlanStore
// ---------------------------------------------------------------------------

#[async_trait]
impl PlanStore for PgStore {
    async fn save_plan(&self, input: NewPlan) -> StoreResult<StoredPlan> {
        PlanRepo::create(&self.pool, &input).await?.try_into()
    }

    async fn find_plan(&self, id: EntityId) -> StoreResult<Option<StoredPlan>> {
        PlanRepo::find_by_id(&self.pool, id)
            .await?
            .map(StoredPlan::try_from)
            .transpose()
    }

    async fn transition_plan(
        &self,
        id: EntityId,
        from: PlanStatus,
        to: PlanStatus,
        result: Option<&ExecutionResult>,
    ) -> StoreResult<Option<StoredPlan>> {
        PlanRepo::transition(&self.pool, id, from, to, result)
            .await?
            .map(StoredPlan::try_from)
            .transpose()
    }
}

// ---------------------------------------------------------------------------
// AuditStore
// ---------------------------------------------------------------------------

#[async_trait]
impl AuditStore for PgStore {
    async fn insert_audit(&self, entry: CreateAuditEntry) -> StoreResult<AuditEntry> {
        AuditRepo::insert(&self.pool, new_id(), &entry)
            .await?
            .try_into()
    }

    async fn query_audit(&self, query: &AuditQuery) -> StoreResult<AuditPage> {
        let (rows, total) = tokio::try_join!(
            AuditRepo::query(&self.pool, query),
            AuditRepo::count(&self.pool, query),
        )?;
        Ok(AuditPage {
            items: convert_all(rows)?,
            total,
        })
    }
}

// ---------------------------------------------------------------------------
// ConversationStore
// ---------------------------------------------------------------------------

#[async_trait]
impl ConversationStore for PgStore {
    async fn create_conversation(
        &self,
        user_id: Option<DbId>,
        title: Option<String>,
    ) -> StoreResult<Conversation> {
        let row = ConversationRepo::create(&self.pool, user_id, title.as_deref()).await?;
        Ok(row.into())
    }

    async fn find_conversation(&self, id: EntityId) -> StoreResult<Option<Conversation>> {
        Ok(ConversationRepo::find_by_id(&self.pool, id)
            .await?
            .map(Conversation::from))
    }

    async fn append_message(
        &self,
        conversation_id: EntityId,
        message: NewMessage,
    ) -> StoreResult<Message> {
        ConversationRepo::append_message(&self.pool, conversation_id, &message)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                entity: "Conversation",
                id: conversation_id.to_string(),
            })?
            .try_into()
    }

    async fn recent_messages(
        &self,
        conversation_id: EntityId,
        limit: i64,
    ) -> StoreResult<Vec<Message>> {
        convert_all(ConversationRepo::recent_messages(&self.pool, conversation_id, limit).await?)
    }

    async fn replace_active_entities(
        &self,
        conversation_id: EntityId,
        entities: Vec<NewActiveEntity>,
    ) -> StoreResult<Vec<ActiveEntity>> {
        if ConversationRepo::find_by_id(&self.pool, conversation_id)
            .await?
            .is_none()
        {
            return Err(StoreError::NotFound {
                entity: "Conversation",
                id: conversation_id.to_string(),
            });
        }
        let rows =
            ConversationRepo::replace_active_entities(&self.pool, conversation_id, &entities)
                .await?;
        Ok(rows.into_iter().map(ActiveEntity::from).collect())
    }

    async fn active_entities(&self, conversation_id: EntityId) -> StoreResult<Vec<ActiveEntity>> {
        let rows = ConversationRepo::active_entities(&self.pool, conversation_id).await?;
        Ok(rows.into_iter().map(ActiveEntity::from).collect())
    }

    async fn delete_conversation(&self, id: EntityId) -> StoreResult<bool> {
        Ok(ConversationRepo::delete(&self.pool, id).await?)
    }
}
