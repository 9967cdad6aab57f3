//! Storage contract consumed by the orchestrator.
//!
//! Every trait is object safe so the pipeline can hold `Arc<dyn ...>`
//! handles and swap [`MemoryStore`](crate::MemoryStore) for
//! [`PgStore`](crate::PgStore) without generics leaking upward.

use std::sync::Arc;

use async_trait::async_trait;
use opsagent_core::error::CoreError;
use opsagent_core::plan::{ExecutionResult, PlanStatus};
use opsagent_core::run::{PipelineRun, PipelineStage, ProgressItem, RunWithStages};
use opsagent_core::types::{DbId, EntityId};

use crate::models::audit::{AuditEntry, AuditPage, AuditQuery, CreateAuditEntry};
use crate::models::conversation::{
    ActiveEntity, Conversation, Message, NewActiveEntity, NewMessage,
};
use crate::models::plan::{NewPlan, StoredPlan};
use crate::models::run::{NewPipelineRun, RunQuery, UpdatePipelineRun, UpdatePipelineStage};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Corrupt row: {0}")]
    Decode(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Conflict: {0}")]
    Conflict(String),
}

impl From<CoreError> for StoreError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::NotFound { entity, id } => Self::NotFound { entity, id },
            CoreError::Conflict(msg) => Self::Conflict(msg),
            other => Self::Decode(other.to_string()),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Runs
// ---------------------------------------------------------------------------

#[async_trait]
pub trait RunStore: Send + Sync {
    /// Insert a run in `running` at `parsing`, together with its five
    /// `pending` stages, atomically.
    async fn create_run(&self, input: NewPipelineRun) -> StoreResult<RunWithStages>;

    async fn find_run(&self, id: EntityId) -> StoreResult<Option<PipelineRun>>;

    async fn find_run_with_stages(&self, id: EntityId) -> StoreResult<Option<RunWithStages>>;

    /// Newest first.
    async fn list_runs(&self, query: &RunQuery) -> StoreResult<Vec<PipelineRun>>;

    async fn update_run(
        &self,
        id: EntityId,
        update: &UpdatePipelineRun,
    ) -> StoreResult<Option<PipelineRun>>;

    async fn update_stage(
        &self,
        stage_id: EntityId,
        update: &UpdatePipelineStage,
    ) -> StoreResult<Option<PipelineStage>>;

    /// Upsert a progress item by key within the stage's list.
    async fn append_progress_item(
        &self,
        stage_id: EntityId,
        item: ProgressItem,
    ) -> StoreResult<Option<PipelineStage>>;

    /// Non-terminal runs started more than `older_than_ms` ago that have no
    /// `completed_at`.
    async fn find_stale_runs(&self, older_than_ms: i64) -> StoreResult<Vec<PipelineRun>>;
}

// ---------------------------------------------------------------------------
// Plans
// ---------------------------------------------------------------------------

#[async_trait]
pub trait PlanStore: Send + Sync {
    async fn save_plan(&self, input: NewPlan) -> StoreResult<StoredPlan>;

    async fn find_plan(&self, id: EntityId) -> StoreResult<Option<StoredPlan>>;

    /// Compare-and-set: move the plan from `from` to `to` only if it is
    /// currently in `from`. Returns `None` when the plan is missing or was
    /// already moved by someone else.
    async fn transition_plan(
        &self,
        id: EntityId,
        from: PlanStatus,
        to: PlanStatus,
        result: Option<&ExecutionResult>,
    ) -> StoreResult<Option<StoredPlan>>;
}

// ---------------------------------------------------------------------------
// Audit
// ---------------------------------------------------------------------------

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn insert_audit(&self, entry: CreateAuditEntry) -> StoreResult<AuditEntry>;

    /// Newest first, with the unpaginated match count.
    async fn query_audit(&self, query: &AuditQuery) -> StoreResult<AuditPage>;
}

// ---------------------------------------------------------------------------
// Conversations
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create_conversation(
        &self,
        user_id: Option<DbId>,
        title: Option<String>,
    ) -> StoreResult<Conversation>;

    async fn find_conversation(&self, id: EntityId) -> StoreResult<Option<Conversation>>;

    async fn append_message(
        &self,
        conversation_id: EntityId,
        message: NewMessage,
    ) -> StoreResult<Message>;

    /// The last `limit` messages in chronological order.
    async fn recent_messages(
        &self,
        conversation_id: EntityId,
        limit: i64,
    ) -> StoreResult<Vec<Message>>;

    /// Replace the conversation's entities in focus.
    async fn replace_active_entities(
        &self,
        conversation_id: EntityId,
        entities: Vec<NewActiveEntity>,
    ) -> StoreResult<Vec<ActiveEntity>>;

    async fn active_entities(&self, conversation_id: EntityId) -> StoreResult<Vec<ActiveEntity>>;

    /// Delete the conversation with its messages, entities, plans and audit
    /// rows. Runs survive with their `conversation_id` cleared.
    async fn delete_conversation(&self, id: EntityId) -> StoreResult<bool>;
}

// ---------------------------------------------------------------------------
// Stores bundle
// ---------------------------------------------------------------------------

/// The four store handles the orchestrator needs.
#[derive(Clone)]
pub struct Stores {
    pub runs: Arc<dyn RunStore>,
    pub plans: Arc<dyn PlanStore>,
    pub audit: Arc<dyn AuditStore>,
    pub conversations: Arc<dyn ConversationStore>,
}

impl Stores {
    /// Use one backend for every store.
    pub fn from_shared<S>(store: Arc<S>) -> Self
    where
        S: RunStore + PlanStore + AuditStore + ConversationStore + 'static,
    {
        Self {
            runs: store.clone(),
            plans: store.clone(),
            audit: store.clone(),
            conversations: store,
        }
    }
}
