//! In-process implementation of every store trait.
//!
//! Backs tests and database-less local runs. State lives behind a single
//! `tokio::sync::RwLock`, so each trait call is atomic on its own.

use async_trait::async_trait;
use chrono::Utc;
use opsagent_core::plan::{ExecutionResult, PlanStatus};
use opsagent_core::run::{
    upsert_progress_item, PipelineRun, PipelineStage, ProgressItem, RunStatus, RunWithStages,
    StageKind, StageStatus,
};
use opsagent_core::types::{new_id, DbId, EntityId};
use tokio::sync::RwLock;

use crate::models::audit::{AuditEntry, AuditPage, AuditQuery, CreateAuditEntry};
use crate::models::conversation::{
    ActiveEntity, Conversation, Message, NewActiveEntity, NewMessage,
};
use crate::models::plan::{NewPlan, StoredPlan};
use crate::models::run::{NewPipelineRun, RunQuery, UpdatePipelineRun, UpdatePipelineStage};
use crate::store::{
    AuditStore, ConversationStore, PlanStore, RunStore, StoreError, StoreResult,
};

#[derive(Default)]
struct MemoryState {
    /// Insertion order doubles as creation order.
    runs: Vec<PipelineRun>,
    stages: Vec<PipelineStage>,
    plans: Vec<StoredPlan>,
    audit: Vec<AuditEntry>,
    conversations: Vec<Conversation>,
    messages: Vec<Message>,
    active_entities: Vec<ActiveEntity>,
}

impl MemoryState {
    fn stages_for(&self, run_id: EntityId) -> Vec<PipelineStage> {
        let mut stages: Vec<PipelineStage> = self
            .stages
            .iter()
            .filter(|s| s.run_id == run_id)
            .cloned()
            .collect();
        stages.sort_by_key(|s| s.order);
        stages
    }
}

/// Store that keeps everything in memory.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Update application
// ---------------------------------------------------------------------------

fn apply_run_update(run: &mut PipelineRun, update: &UpdatePipelineRun) {
    if let Some(status) = update.status {
        run.status = status;
    }
    if let Some(stage) = update.current_stage {
        run.current_stage = stage;
    }
    if let Some(result) = &update.result {
        run.result = Some(result.clone());
    }
    if let Some(error) = &update.error {
        run.error = error.clone();
    }
    if let Some(completed_at) = update.completed_at {
        run.completed_at = Some(completed_at);
    }
    if let Some(duration_ms) = update.duration_ms {
        run.duration_ms = Some(duration_ms);
    }
}

fn apply_stage_update(stage: &mut PipelineStage, update: &UpdatePipelineStage) {
    if let Some(status) = update.status {
        stage.status = status;
    }
    if let Some(started_at) = update.started_at {
        stage.started_at = Some(started_at);
    }
    if let Some(completed_at) = update.completed_at {
        stage.completed_at = Some(completed_at);
    }
    if let Some(duration_ms) = update.duration_ms {
        stage.duration_ms = Some(duration_ms);
    }
    if let Some(detail) = &update.detail {
        stage.detail = Some(detail.clone());
    }
    if let Some(input) = &update.input {
        stage.input = Some(input.clone());
    }
    if let Some(output) = &update.output {
        stage.output = Some(output.clone());
    }
    if let Some(error) = &update.error {
        stage.error = error.clone();
    }
    if let Some(cost) = &update.cost_estimate {
        stage.cost_estimate = Some(cost.clone());
    }
}

// ---------------------------------------------------------------------------
// RunStore
// ---------------------------------------------------------------------------

#[async_trait]
impl RunStore for MemoryStore {
    async fn create_run(&self, input: NewPipelineRun) -> StoreResult<RunWithStages> {
        let now = Utc::now();
        let run = PipelineRun {
            id: new_id(),
            name: input.name,
            conversation_id: input.conversation_id,
            input: input.input,
            status: RunStatus::Running,
            mode: input.mode,
            current_stage: Some(StageKind::Parsing),
            result: None,
            error: None,
            user_id: input.user_id,
            started_at: now,
            completed_at: None,
            created_at: now,
            duration_ms: None,
        };
        let stages: Vec<PipelineStage> = StageKind::ALL
            .into_iter()
            .map(|kind| PipelineStage {
                id: new_id(),
                run_id: run.id,
                stage: kind,
                status: StageStatus::Pending,
                order: kind.order(),
                started_at: None,
                completed_at: None,
                duration_ms: None,
                detail: None,
                input: None,
                output: None,
                progress_items: Vec::new(),
                error: None,
                cost_estimate: None,
            })
            .collect();

        let mut state = self.state.write().await;
        state.runs.push(run.clone());
        state.stages.extend(stages.iter().cloned());
        Ok(RunWithStages { run, stages })
    }

    async fn find_run(&self, id: EntityId) -> StoreResult<Option<PipelineRun>> {
        let state = self.state.read().await;
        Ok(state.runs.iter().find(|r| r.id == id).cloned())
    }

    async fn find_run_with_stages(&self, id: EntityId) -> StoreResult<Option<RunWithStages>> {
        let state = self.state.read().await;
        Ok(state.runs.iter().find(|r| r.id == id).map(|run| RunWithStages {
            run: run.clone(),
            stages: state.stages_for(id),
        }))
    }

    async fn list_runs(&self, query: &RunQuery) -> StoreResult<Vec<PipelineRun>> {
        let state = self.state.read().await;
        Ok(state
            .runs
            .iter()
            .rev()
            .filter(|r| query.status.map_or(true, |s| r.status == s))
            .filter(|r| query.user_id.map_or(true, |u| r.user_id == Some(u)))
            .skip(query.effective_offset() as usize)
            .take(query.effective_limit() as usize)
            .cloned()
            .collect())
    }

    async fn update_run(
        &self,
        id: EntityId,
        update: &UpdatePipelineRun,
    ) -> StoreResult<Option<PipelineRun>> {
        let mut state = self.state.write().await;
        Ok(state.runs.iter_mut().find(|r| r.id == id).map(|run| {
            apply_run_update(run, update);
            run.clone()
        }))
    }

    async fn update_stage(
        &self,
        stage_id: EntityId,
        update: &UpdatePipelineStage,
    ) -> StoreResult<Option<PipelineStage>> {
        let mut state = self.state.write().await;
        Ok(state.stages.iter_mut().find(|s| s.id == stage_id).map(|stage| {
            apply_stage_update(stage, update);
            stage.clone()
        }))
    }

    async fn append_progress_item(
        &self,
        stage_id: EntityId,
        item: ProgressItem,
    ) -> StoreResult<Option<PipelineStage>> {
        let mut state = self.state.write().await;
        Ok(state.stages.iter_mut().find(|s| s.id == stage_id).map(|stage| {
            upsert_progress_item(&mut stage.progress_items, item);
            stage.clone()
        }))
    }

    async fn find_stale_runs(&self, older_than_ms: i64) -> StoreResult<Vec<PipelineRun>> {
        let cutoff = Utc::now() - chrono::Duration::milliseconds(older_than_ms);
        let state = self.state.read().await;
        Ok(state
            .runs
            .iter()
            .filter(|r| !r.status.is_terminal())
            .filter(|r| r.completed_at.is_none())
            .filter(|r| r.started_at < cutoff)
            .cloned()
            .collect())
    }
}

// ---------------------------------------------------------------------------
// PlanStore
// ---------------------------------------------------------------------------

#[async_trait]
impl PlanStore for MemoryStore {
    async fn save_plan(&self, input: NewPlan) -> StoreResult<StoredPlan> {
        let mut state = self.state.write().await;
        if state.plans.iter().any(|p| p.id == input.plan.id) {
            return Err(StoreError::Conflict(format!(
                "plan {} already stored",
                input.plan.id
            )));
        }
        let now = Utc::now();
        let stored = StoredPlan {
            id: input.plan.id,
            conversation_id: input.conversation_id,
            run_id: input.run_id,
            user_id: input.user_id,
            plan: input.plan,
            status: PlanStatus::Pending,
            result: None,
            created_at: now,
            updated_at: now,
        };
        state.plans.push(stored.clone());
        Ok(stored)
    }

    async fn find_plan(&self, id: EntityId) -> StoreResult<Option<StoredPlan>> {
        let state = self.state.read().await;
        Ok(state.plans.iter().find(|p| p.id == id).cloned())
    }

    async fn transition_plan(
        &self,
        id: EntityId,
        from: PlanStatus,
        to: PlanStatus,
        result: Option<&ExecutionResult>,
    ) -> StoreResult<Option<StoredPlan>> {
        let mut state = self.state.write().await;
        Ok(state
            .plans
            .iter_mut()
            .find(|p| p.id == id && p.status == from)
            .map(|plan| {
                plan.status = to;
                if let Some(result) = result {
                    plan.result = Some(result.clone());
                }
                plan.updated_at = Utc::now();
                plan.clone()
            }))
    }
}

// ---------------------------------------------------------------------------
// AuditStore
// ---------------------------------------------------------------------------

#[async_trait]
impl AuditStore for MemoryStore {
    async fn insert_audit(&self, entry: CreateAuditEntry) -> StoreResult<AuditEntry> {
        let stored = AuditEntry {
            id: new_id(),
            phase: entry.phase,
            conversation_id: entry.conversation_id,
            plan_id: entry.plan_id,
            run_id: entry.run_id,
            user_id: entry.user_id,
            input: entry.input,
            output: entry.output,
            duration_ms: entry.duration_ms,
            input_tokens: entry.input_tokens,
            output_tokens: entry.output_tokens,
            cost_usd: entry.cost_usd,
            created_at: Utc::now(),
        };
        self.state.write().await.audit.push(stored.clone());
        Ok(stored)
    }

    async fn query_audit(&self, query: &AuditQuery) -> StoreResult<AuditPage> {
        let state = self.state.read().await;
        let matching: Vec<&AuditEntry> =
            state.audit.iter().rev().filter(|e| query.matches(e)).collect();
        let total = matching.len() as i64;
        let items = matching
            .into_iter()
            .skip(query.effective_offset() as usize)
            .take(query.effective_limit() as usize)
            .cloned()
            .collect();
        Ok(AuditPage { items, total })
    }
}

// ---------------------------------------------------------------------------
// ConversationStore
// ---------------------------------------------------------------------------

#[async_trait]
impl ConversationStore for MemoryStore {
    async fn create_conversation(
        &self,
        user_id: Option<DbId>,
        title: Option<String>,
    ) -> StoreResult<Conversation> {
        let now = Utc::now();
        let conversation = Conversation {
            id: new_id(),
            user_id,
            title,
            created_at: now,
            updated_at: now,
        };
        self.state
            .write()
            .await
            .conversations
            .push(conversation.clone());
        Ok(conversation)
    }

    async fn find_conversation(&self, id: EntityId) -> StoreResult<Option<Conversation>> {
        let state = self.state.read().await;
        Ok(state.conversations.iter().find(|c| c.id == id).cloned())
    }

    async fn append_message(
        &self,
        conversation_id: EntityId,
        message: NewMessage,
    ) -> StoreResult<Message> {
        let mut state = self.state.write().await;
        let now = Utc::now();
        let conversation = state
            .conversations
            .iter_mut()
            .find(|c| c.id == conversation_id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "Conversation",
                id: conversation_id.to_string(),
            })?;
        conversation.updated_at = now;

        let stored = Message {
            id: new_id(),
            conversation_id,
            role: message.role,
            content: message.content,
            metadata: message.metadata,
            created_at: now,
        };
        state.messages.push(stored.clone());
        Ok(stored)
    }

    async fn recent_messages(
        &self,
        conversation_id: EntityId,
        limit: i64,
    ) -> StoreResult<Vec<Message>> {
        let state = self.state.read().await;
        let mut recent: Vec<Message> = state
            .messages
            .iter()
            .rev()
            .filter(|m| m.conversation_id == conversation_id)
            .take(limit.max(0) as usize)
            .cloned()
            .collect();
        recent.reverse();
        Ok(recent)
    }

    async fn replace_active_entities(
        &self,
        conversation_id: EntityId,
        entities: Vec<NewActiveEntity>,
    ) -> StoreResult<Vec<ActiveEntity>> {
        let mut state = self.state.write().await;
        if !state.conversations.iter().any(|c| c.id == conversation_id) {
            return Err(StoreError::NotFound {
                entity: "Conversation",
                id: conversation_id.to_string(),
            });
        }
        state
            .active_entities
            .retain(|e| e.conversation_id != conversation_id);

        let now = Utc::now();
        let stored: Vec<ActiveEntity> = entities
            .into_iter()
            .map(|e| ActiveEntity {
                conversation_id,
                entity_type: e.entity_type,
                entity_id: e.entity_id,
                label: e.label,
                updated_at: now,
            })
            .collect();
        state.active_entities.extend(stored.iter().cloned());
        Ok(stored)
    }

    async fn active_entities(&self, conversation_id: EntityId) -> StoreResult<Vec<ActiveEntity>> {
        let state = self.state.read().await;
        Ok(state
            .active_entities
            .iter()
            .filter(|e| e.conversation_id == conversation_id)
            .cloned()
            .collect())
    }

    async fn delete_conversation(&self, id: EntityId) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        let before = state.conversations.len();
        state.conversations.retain(|c| c.id != id);
        if state.conversations.len() == before {
            return Ok(false);
        }
        state.messages.retain(|m| m.conversation_id != id);
        state.active_entities.retain(|e| e.conversation_id != id);
        state.plans.retain(|p| p.conversation_id != Some(id));
        state.audit.retain(|a| a.conversation_id != Some(id));
        for run in state.runs.iter_mut().filter(|r| r.conversation_id == Some(id)) {
            run.conversation_id = None;
        }
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
