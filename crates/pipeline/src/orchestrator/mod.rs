//! The run state machine.
//!
//! A durable run moves through its five stages under [`drive_run`]. Each
//! transition is written to the [`RunStore`](opsagent_db::RunStore) first and
//! announced on the [`RunEventBus`] second, so the store is always at least as
//! far along as any viewer.
//!
//! [`drive_run`]: AgentOrchestrator::drive_run

mod message;
mod stages;

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use opsagent_core::audit::AuditPhase;
use opsagent_core::catalog::IntentCatalog;
use opsagent_core::plan::PlanStatus;
use opsagent_core::plan_builder::PlanBuilder;
use opsagent_core::run::{
    CostEstimate, PipelineRun, PipelineStage, RunMode, RunStatus, RunWithStages, StageKind,
    StageStatus, StartRun,
};
use opsagent_core::types::{DbId, EntityId, Timestamp};
use opsagent_core::validation::Validator;
use opsagent_db::models::conversation::Conversation;
use opsagent_db::models::plan::StoredPlan;
use opsagent_db::models::run::{RunQuery, UpdatePipelineRun, UpdatePipelineStage};
use opsagent_db::Stores;
use opsagent_events::{RunCompleteEvent, RunEventBus, RunSubscription, StageUpdateEvent};
use serde_json::{json, Value};

pub use message::{MissingFields, ProcessMessage, ProcessOutcome, StageCallback};
pub use stages::{
    ParsingOutput, PlanningOutput, ResolvingOutput, ValidatingOutput, NO_ACTIONABLE_REQUEST,
};

use self::stages::{audit_context, stage_output, StageOutcome, StageReport};
use crate::audit_logger::{AuditContext, AuditLogger, AuditRecord};
use crate::backend::ActionBackend;
use crate::config::OrchestratorConfig;
use crate::error::OrchestratorError;
use crate::executor::Executor;
use crate::parser::{ConversationContext, Parser};
use crate::resolver::EntityResolver;

/// Error recorded on a run whose plan was rejected.
pub const PLAN_REJECTED: &str = "Plan rejected by user";

/// Error recorded on a run found orphaned in the executing stage.
pub const INTERRUPTED_DURING_EXECUTION: &str = "Run was interrupted during execution";

/// What a recovery pass did with one stale run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// The interrupted stage was reset and the run driven again.
    Redriven,
    /// The run could not be resumed safely and was failed.
    Failed,
    /// Waiting on a caller, or still being driven in this process.
    Untouched,
}

/// Drives pipeline runs and serves the run lifecycle operations.
///
/// Constructed once at startup and shared behind an `Arc`.
pub struct AgentOrchestrator {
    stores: Stores,
    parser: Arc<dyn Parser>,
    validator: Validator,
    resolver: EntityResolver,
    plan_builder: PlanBuilder,
    executor: Executor,
    audit: AuditLogger,
    events: RunEventBus,
    config: OrchestratorConfig,
    /// Runs currently being driven in this process.
    active: Mutex<HashSet<EntityId>>,
}

/// Exclusive right to drive one run, released on drop.
struct DriveClaim<'a> {
    active: &'a Mutex<HashSet<EntityId>>,
    run_id: EntityId,
}

impl Drop for DriveClaim<'_> {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.run_id);
    }
}

impl AgentOrchestrator {
    pub fn new(
        stores: Stores,
        parser: Arc<dyn Parser>,
        backend: Arc<dyn ActionBackend>,
        catalog: Arc<IntentCatalog>,
        events: RunEventBus,
        config: OrchestratorConfig,
    ) -> Self {
        let audit = AuditLogger::new(stores.audit.clone(), config.audit_payload_max_bytes);
        Self {
            validator: Validator::new(catalog.clone()),
            resolver: EntityResolver::new(catalog.clone(), backend.clone()),
            plan_builder: PlanBuilder::new(catalog.clone()),
            executor: Executor::new(backend, catalog, audit.clone()),
            stores,
            parser,
            audit,
            events,
            config,
            active: Mutex::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn events(&self) -> &RunEventBus {
        &self.events
    }

    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    fn claim(&self, run_id: EntityId) -> Result<DriveClaim<'_>, OrchestratorError> {
        let mut active = self
            .active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !active.insert(run_id) {
            return Err(OrchestratorError::InvalidState(format!(
                "Run {run_id} is already being driven"
            )));
        }
        Ok(DriveClaim {
            active: &self.active,
            run_id,
        })
    }

    fn is_driving(&self, run_id: EntityId) -> bool {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains(&run_id)
    }

    // -----------------------------------------------------------------------
    // Run lifecycle
    // -----------------------------------------------------------------------

    /// Validate the request and persist the run with its five pending stages.
    pub async fn create_run(&self, req: StartRun) -> Result<RunWithStages, OrchestratorError> {
        let req = req.checked()?;
        if let Some(conversation_id) = req.conversation_id {
            self.find_owned_conversation(conversation_id, req.user_id).await?;
        }
        let created = self.stores.runs.create_run(req.into()).await?;
        tracing::info!(
            run_id = %created.run.id,
            mode = %created.run.mode,
            user_id = ?created.run.user_id,
            "Pipeline run created",
        );
        Ok(created)
    }

    /// A conversation the caller may use. Conversations owned by someone
    /// else read as missing.
    async fn find_owned_conversation(
        &self,
        id: EntityId,
        user_id: Option<DbId>,
    ) -> Result<Conversation, OrchestratorError> {
        let conversation = self
            .stores
            .conversations
            .find_conversation(id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found("Conversation", id))?;
        match (conversation.user_id, user_id) {
            (Some(owner), caller) if caller != Some(owner) => {
                Err(OrchestratorError::not_found("Conversation", id))
            }
            _ => Ok(conversation),
        }
    }

    /// Create a run and drive it to its first stop point.
    pub async fn start_run(&self, req: StartRun) -> Result<RunWithStages, OrchestratorError> {
        let created = self.create_run(req).await?;
        self.drive_run(created.run.id).await
    }

    /// Create a run and drive it on its own task. Returns the freshly
    /// created run.
    pub async fn start_run_detached(
        self: &Arc<Self>,
        req: StartRun,
    ) -> Result<RunWithStages, OrchestratorError> {
        let created = self.create_run(req).await?;
        let run_id = created.run.id;
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = orchestrator.drive_run(run_id).await {
                tracing::error!(run_id = %run_id, error = %e, "Run drive failed");
            }
        });
        Ok(created)
    }

    /// A run with its stages. Runs owned by someone else read as missing.
    pub async fn get_run(
        &self,
        run_id: EntityId,
        user_id: Option<DbId>,
    ) -> Result<RunWithStages, OrchestratorError> {
        let run = self.load_run(run_id).await?;
        if !run.run.is_visible_to(user_id) {
            return Err(OrchestratorError::not_found("PipelineRun", run_id));
        }
        Ok(run)
    }

    pub async fn list_runs(&self, query: &RunQuery) -> Result<Vec<PipelineRun>, OrchestratorError> {
        Ok(self.stores.runs.list_runs(query).await?)
    }

    /// Subscribe to a run's live events, together with its current state.
    ///
    /// The subscription is taken before the snapshot is read so that no
    /// transition falls between the two. For a run that has already
    /// finished the stream is closed at once. Otherwise it ends after
    /// `viewer_idle_timeout` without an event.
    pub async fn watch_run(
        &self,
        run_id: EntityId,
        user_id: Option<DbId>,
    ) -> Result<(RunWithStages, RunSubscription), OrchestratorError> {
        let mut subscription = self
            .events
            .subscribe(run_id)
            .with_idle_timeout(self.config.viewer_idle_timeout);
        let run = self.get_run(run_id, user_id).await?;
        if run.run.status.is_terminal() {
            subscription.close();
        }
        Ok((run, subscription))
    }

    /// Resume a run paused after stage S with the stage that follows S.
    pub async fn continue_run(
        &self,
        run_id: EntityId,
        user_id: Option<DbId>,
    ) -> Result<RunWithStages, OrchestratorError> {
        let _claim = self.claim(run_id)?;
        let run = self.get_run(run_id, user_id).await?;

        let RunStatus::PausedAt(paused) = run.run.status else {
            return Err(OrchestratorError::InvalidState(format!(
                "Run {run_id} is {} and cannot be continued",
                run.run.status
            )));
        };
        let next = paused.next().ok_or_else(|| {
            OrchestratorError::InvalidState(format!("Run {run_id} has no stage after {paused}"))
        })?;

        self.update_run(
            run_id,
            UpdatePipelineRun::status(RunStatus::Running).with_stage(Some(next)),
        )
        .await?;
        tracing::info!(run_id = %run_id, stage = %next, "Pipeline run continued");
        self.drive_claimed(run_id).await
    }

    /// Approve or reject the plan of a run awaiting approval.
    pub async fn approve_run(
        &self,
        run_id: EntityId,
        approved: bool,
        user_id: Option<DbId>,
    ) -> Result<RunWithStages, OrchestratorError> {
        let _claim = self.claim(run_id)?;
        let run = self.get_run(run_id, user_id).await?;
        if run.run.status != RunStatus::AwaitingApproval {
            return Err(OrchestratorError::InvalidState(format!(
                "Run {run_id} is {} and has no plan awaiting approval",
                run.run.status
            )));
        }

        let planned: PlanningOutput = stage_output(&run, StageKind::Planning)?;
        let stored = self
            .decide_plan(planned.plan.id, approved, audit_context(&run.run))
            .await?;

        if approved {
            self.update_run(
                run_id,
                UpdatePipelineRun::status(RunStatus::Running).with_stage(Some(StageKind::Executing)),
            )
            .await?;
            tracing::info!(run_id = %run_id, plan_id = %stored.id, "Plan approved");
            return self.drive_claimed(run_id).await;
        }

        if let Some(stage) = run.stage(StageKind::Executing) {
            self.stores
                .runs
                .update_stage(
                    stage.id,
                    &UpdatePipelineStage::status(StageStatus::Skipped).with_detail(PLAN_REJECTED),
                )
                .await?;
            self.events.publish_stage_update(
                StageUpdateEvent::new(run_id, StageKind::Executing, StageStatus::Skipped)
                    .with_detail(PLAN_REJECTED),
            );
        }
        tracing::info!(run_id = %run_id, plan_id = %stored.id, "Plan rejected");
        self.finish_run(
            &run.run,
            UpdatePipelineRun::finished(&run.run, RunStatus::Failed).with_error(PLAN_REJECTED),
        )
        .await?;
        self.load_run(run_id).await
    }

    /// Approve and execute, or reject, a stored plan that is not tied to a
    /// durable run.
    pub async fn execute_plan(
        &self,
        plan_id: EntityId,
        approved: bool,
        user_id: Option<DbId>,
    ) -> Result<StoredPlan, OrchestratorError> {
        let stored = self
            .stores
            .plans
            .find_plan(plan_id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found("ExecutionPlan", plan_id))?;

        if let (Some(owner), caller) = (stored.user_id, user_id) {
            if caller != Some(owner) {
                return Err(OrchestratorError::Forbidden(format!(
                    "Plan {plan_id} belongs to another user"
                )));
            }
        }
        if let Some(run_id) = stored.run_id {
            return Err(OrchestratorError::InvalidState(format!(
                "Plan {plan_id} belongs to run {run_id}; approve it through the run"
            )));
        }
        if stored.status != PlanStatus::Pending {
            return Err(OrchestratorError::InvalidState(format!(
                "Plan {plan_id} is not pending (status: {})",
                stored.status
            )));
        }

        let ctx = AuditContext {
            conversation_id: stored.conversation_id,
            run_id: None,
            user_id,
        };
        let decided = self.decide_plan(plan_id, approved, ctx).await?;
        if !approved {
            return Ok(decided);
        }
        let (executed, result) = self.execute_stored(&decided, ctx).await?;
        tracing::info!(
            plan_id = %plan_id,
            overall_success = result.overall_success,
            "Plan executed",
        );
        Ok(executed)
    }

    /// Move a pending plan to approved or rejected and audit the decision.
    async fn decide_plan(
        &self,
        plan_id: EntityId,
        approved: bool,
        ctx: AuditContext,
    ) -> Result<StoredPlan, OrchestratorError> {
        let next = if approved {
            PlanStatus::Approved
        } else {
            PlanStatus::Rejected
        };
        let stored = self
            .stores
            .plans
            .transition_plan(plan_id, PlanStatus::Pending, next, None)
            .await?
            .ok_or_else(|| {
                OrchestratorError::InvalidState(format!("Plan {plan_id} is not pending"))
            })?;
        self.audit
            .log(
                AuditRecord::new(AuditPhase::Approve, ctx)
                    .with_plan(plan_id)
                    .with_input(json!({ "approved": approved }))
                    .with_output(json!({ "status": stored.status })),
            )
            .await;
        Ok(stored)
    }

    // -----------------------------------------------------------------------
    // Drive loop
    // -----------------------------------------------------------------------

    /// Drive a `running` run until it stops: paused, awaiting approval,
    /// completed or failed. Any other status is returned as is.
    pub async fn drive_run(&self, run_id: EntityId) -> Result<RunWithStages, OrchestratorError> {
        let _claim = self.claim(run_id)?;
        self.drive_claimed(run_id).await
    }

    async fn drive_claimed(&self, run_id: EntityId) -> Result<RunWithStages, OrchestratorError> {
        loop {
            let run = self.load_run(run_id).await?;
            if run.run.status != RunStatus::Running {
                return Ok(run);
            }

            let Some(kind) = run.run.current_stage else {
                self.finish_run(
                    &run.run,
                    UpdatePipelineRun::finished(&run.run, RunStatus::Failed)
                        .with_error("Run has no current stage"),
                )
                .await?;
                continue;
            };
            let stage = run.stage(kind).cloned().ok_or_else(|| {
                OrchestratorError::not_found("PipelineStage", format!("{run_id}/{kind}"))
            })?;

            let started_at = self.begin_stage(&run, &stage).await?;
            let report = self.run_stage(&run, kind).await;
            self.settle_stage(&run.run, &stage, started_at, report)
                .await?;
        }
    }

    async fn begin_stage(
        &self,
        run: &RunWithStages,
        stage: &PipelineStage,
    ) -> Result<Timestamp, OrchestratorError> {
        let now = Utc::now();
        let previous_output = run
            .stages
            .iter()
            .find(|s| s.order == stage.order - 1)
            .and_then(|s| s.output.clone());
        let update = UpdatePipelineStage {
            status: Some(StageStatus::Running),
            started_at: Some(now),
            input: previous_output,
            error: Some(None),
            ..Default::default()
        };
        self.stores.runs.update_stage(stage.id, &update).await?;

        tracing::info!(run_id = %run.run.id, stage = %stage.stage, "Stage started");
        self.events.publish_stage_update(StageUpdateEvent::new(
            run.run.id,
            stage.stage,
            StageStatus::Running,
        ));
        Ok(now)
    }

    async fn settle_stage(
        &self,
        run: &PipelineRun,
        stage: &PipelineStage,
        started_at: Timestamp,
        report: Result<StageReport, OrchestratorError>,
    ) -> Result<(), OrchestratorError> {
        let report = match report {
            Ok(report) => report,
            Err(e) => {
                return self
                    .fail_stage(run, stage, started_at, None, e.to_string())
                    .await;
            }
        };
        let StageReport {
            outcome,
            output,
            detail,
            cost,
        } = report;
        let kind = stage.stage;

        match outcome {
            StageOutcome::Blocked(error) => {
                self.fail_stage(run, stage, started_at, output, error).await
            }
            StageOutcome::Finished(result) if !result.overall_success => {
                self.fail_stage(run, stage, started_at, output, result.summary())
                    .await
            }
            StageOutcome::Finished(result) => {
                self.complete_stage(run, stage, started_at, output, detail, cost)
                    .await?;
                let result = serde_json::to_value(&result).unwrap_or(Value::Null);
                self.finish_run(
                    run,
                    UpdatePipelineRun::finished(run, RunStatus::Completed).with_result(result),
                )
                .await
            }
            StageOutcome::AwaitApproval => {
                self.complete_stage(run, stage, started_at, output, detail, cost)
                    .await?;
                self.update_run(
                    run.id,
                    UpdatePipelineRun::status(RunStatus::AwaitingApproval)
                        .with_stage(Some(StageKind::Executing)),
                )
                .await?;
                tracing::info!(run_id = %run.id, "Plan awaiting approval");
                Ok(())
            }
            StageOutcome::Advance => {
                self.complete_stage(run, stage, started_at, output, detail, cost)
                    .await?;
                match (run.mode, kind.next()) {
                    (_, None) => {
                        self.finish_run(run, UpdatePipelineRun::finished(run, RunStatus::Completed))
                            .await
                    }
                    (RunMode::Step, Some(_)) => {
                        self.update_run(run.id, UpdatePipelineRun::status(RunStatus::PausedAt(kind)))
                            .await?;
                        tracing::info!(run_id = %run.id, stage = %kind, "Pipeline run paused");
                        Ok(())
                    }
                    (RunMode::Auto, Some(next)) => {
                        self.update_run(
                            run.id,
                            UpdatePipelineRun::status(RunStatus::Running).with_stage(Some(next)),
                        )
                        .await?;
                        Ok(())
                    }
                }
            }
        }
    }

    async fn complete_stage(
        &self,
        run: &PipelineRun,
        stage: &PipelineStage,
        started_at: Timestamp,
        output: Option<Value>,
        detail: Option<String>,
        cost: Option<CostEstimate>,
    ) -> Result<(), OrchestratorError> {
        let now = Utc::now();
        let duration_ms = (now - started_at).num_milliseconds().max(0);
        let update = UpdatePipelineStage {
            status: Some(StageStatus::Completed),
            completed_at: Some(now),
            duration_ms: Some(duration_ms),
            detail: detail.clone(),
            output,
            cost_estimate: cost,
            ..Default::default()
        };
        self.stores.runs.update_stage(stage.id, &update).await?;

        tracing::info!(
            run_id = %run.id,
            stage = %stage.stage,
            duration_ms,
            "Stage completed",
        );
        let mut event = StageUpdateEvent::new(run.id, stage.stage, StageStatus::Completed);
        event.detail = detail;
        self.events.publish_stage_update(event);
        Ok(())
    }

    /// Fail `stage` and with it the whole run.
    async fn fail_stage(
        &self,
        run: &PipelineRun,
        stage: &PipelineStage,
        started_at: Timestamp,
        output: Option<Value>,
        error: String,
    ) -> Result<(), OrchestratorError> {
        let now = Utc::now();
        let update = UpdatePipelineStage {
            status: Some(StageStatus::Failed),
            completed_at: Some(now),
            duration_ms: Some((now - started_at).num_milliseconds().max(0)),
            output,
            error: Some(Some(error.clone())),
            ..Default::default()
        };
        self.stores.runs.update_stage(stage.id, &update).await?;

        tracing::warn!(run_id = %run.id, stage = %stage.stage, error = %error, "Stage failed");
        self.events.publish_stage_update(
            StageUpdateEvent::new(run.id, stage.stage, StageStatus::Failed).with_error(&error),
        );
        self.finish_run(
            run,
            UpdatePipelineRun::finished(run, RunStatus::Failed).with_error(error),
        )
        .await
    }

    /// Persist a terminal status, then announce it.
    async fn finish_run(
        &self,
        run: &PipelineRun,
        update: UpdatePipelineRun,
    ) -> Result<(), OrchestratorError> {
        let finished = self.update_run(run.id, update).await?;
        tracing::info!(
            run_id = %finished.id,
            status = %finished.status,
            duration_ms = ?finished.duration_ms,
            "Pipeline run finished",
        );
        self.events.publish_run_complete(RunCompleteEvent {
            run_id: finished.id,
            status: finished.status,
            result: finished.result,
            error: finished.error,
            timestamp: Utc::now(),
        });
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Recovery
    // -----------------------------------------------------------------------

    /// Bring a run orphaned by a crashed process back to a definite state.
    ///
    /// Stages before executing carry no downstream side effects, so they are
    /// reset and driven again. A run caught in executing may have applied
    /// some of its actions already and is failed instead.
    pub async fn recover_run(&self, run: &PipelineRun) -> Result<Recovery, OrchestratorError> {
        if run.status != RunStatus::Running || self.is_driving(run.id) {
            tracing::debug!(run_id = %run.id, status = %run.status, "Stale run left as is");
            return Ok(Recovery::Untouched);
        }
        let _claim = self.claim(run.id)?;
        let current = self.load_run(run.id).await?;
        if current.run.status != RunStatus::Running {
            return Ok(Recovery::Untouched);
        }

        match current.run.current_stage {
            Some(kind) if kind != StageKind::Executing => {
                if let Some(stage) = current.stage(kind) {
                    self.stores
                        .runs
                        .update_stage(stage.id, &UpdatePipelineStage::reset())
                        .await?;
                }
                tracing::warn!(run_id = %run.id, stage = %kind, "Re-driving stale run");
                self.drive_claimed(run.id).await?;
                Ok(Recovery::Redriven)
            }
            stuck => {
                if let Some(stage) = stuck.and_then(|kind| current.stage(kind)) {
                    let update = UpdatePipelineStage {
                        status: Some(StageStatus::Failed),
                        completed_at: Some(Utc::now()),
                        error: Some(Some(INTERRUPTED_DURING_EXECUTION.to_string())),
                        ..Default::default()
                    };
                    self.stores.runs.update_stage(stage.id, &update).await?;
                }
                tracing::warn!(run_id = %run.id, "Failing run interrupted during execution");
                self.finish_run(
                    &current.run,
                    UpdatePipelineRun::finished(&current.run, RunStatus::Failed)
                        .with_error(INTERRUPTED_DURING_EXECUTION),
                )
                .await?;
                Ok(Recovery::Failed)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Store helpers
    // -----------------------------------------------------------------------

    async fn load_run(&self, run_id: EntityId) -> Result<RunWithStages, OrchestratorError> {
        self.stores
            .runs
            .find_run_with_stages(run_id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found("PipelineRun", run_id))
    }

    async fn update_run(
        &self,
        run_id: EntityId,
        update: UpdatePipelineRun,
    ) -> Result<PipelineRun, OrchestratorError> {
        self.stores
            .runs
            .update_run(run_id, &update)
            .await?
            .ok_or_else(|| OrchestratorError::not_found("PipelineRun", run_id))
    }

    /// History and active entities of a conversation, for the parser.
    async fn conversation_context(
        &self,
        conversation_id: Option<EntityId>,
    ) -> Result<Option<ConversationContext>, OrchestratorError> {
        let Some(conversation_id) = conversation_id else {
            return Ok(None);
        };
        let (history, active_entities) = tokio::try_join!(
            self.stores
                .conversations
                .recent_messages(conversation_id, self.config.conversation_history_limit),
            self.stores.conversations.active_entities(conversation_id),
        )?;
        Ok(Some(ConversationContext {
            conversation_id: Some(conversation_id),
            history,
            active_entities,
        }))
    }
}
