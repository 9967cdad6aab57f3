//! The work behind each pipeline stage.
//!
//! Every stage reads the recorded output of the stage before it and returns a
//! [`StageReport`]; persisting the report is the drive loop's job. The
//! audited parse/validate/resolve/plan/execute steps are shared with the
//! one-shot message path.

use std::time::Instant;

use opsagent_core::audit::AuditPhase;
use opsagent_core::intent::{ParsedIntent, ResolvedIntent};
use opsagent_core::plan::{ExecutionPlan, ExecutionResult, PlanStatus};
use opsagent_core::run::{
    CostEstimate, PipelineRun, ProgressItem, ProgressStatus, RunWithStages, StageKind,
};
use opsagent_core::types::{DbId, EntityId};
use opsagent_core::validation::ValidationOutcome;
use opsagent_db::models::plan::{NewPlan, StoredPlan};
use opsagent_db::StoreError;
use opsagent_events::StageUpdateEvent;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::AgentOrchestrator;
use crate::audit_logger::{AuditContext, AuditRecord};
use crate::error::OrchestratorError;
use crate::executor::elapsed_ms;
use crate::parser::{ConversationContext, ParseOutput, ParserError};

/// Error recorded when the parser finds nothing to do.
pub const NO_ACTIONABLE_REQUEST: &str = "No actionable request found in the input";

// ---------------------------------------------------------------------------
// Stage outputs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsingOutput {
    pub intents: Vec<ParsedIntent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unhandled_content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidatingOutput {
    pub intents: Vec<ParsedIntent>,
    pub outcomes: Vec<ValidationOutcome>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvingOutput {
    pub items: Vec<ResolvedIntent>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanningOutput {
    pub plan: ExecutionPlan,
}

// ---------------------------------------------------------------------------
// Stage reports
// ---------------------------------------------------------------------------

/// How the drive loop should proceed after a stage.
#[derive(Debug)]
pub(crate) enum StageOutcome {
    Advance,
    AwaitApproval,
    Finished(ExecutionResult),
    /// The stage cannot succeed with the data at hand.
    Blocked(String),
}

#[derive(Debug)]
pub(crate) struct StageReport {
    pub outcome: StageOutcome,
    pub output: Option<Value>,
    pub detail: Option<String>,
    pub cost: Option<CostEstimate>,
}

impl StageReport {
    fn new(outcome: StageOutcome, output: &impl Serialize) -> Result<Self, OrchestratorError> {
        Ok(Self {
            outcome,
            output: Some(serde_json::to_value(output).map_err(StoreError::from)?),
            detail: None,
            cost: None,
        })
    }

    fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    fn with_cost(mut self, cost: Option<CostEstimate>) -> Self {
        self.cost = cost;
        self
    }
}

pub(crate) fn audit_context(run: &PipelineRun) -> AuditContext {
    AuditContext {
        conversation_id: run.conversation_id,
        run_id: Some(run.id),
        user_id: run.user_id,
    }
}

/// Decode the recorded output of an earlier stage.
pub(crate) fn stage_output<T: DeserializeOwned>(
    run: &RunWithStages,
    kind: StageKind,
) -> Result<T, OrchestratorError> {
    let output = run
        .stage(kind)
        .and_then(|s| s.output.clone())
        .ok_or_else(|| {
            OrchestratorError::InvalidState(format!("The {kind} stage has no recorded output"))
        })?;
    serde_json::from_value(output).map_err(|e| {
        OrchestratorError::ExecutionFailed(format!("Unreadable {kind} stage output: {e}"))
    })
}

/// Validation problems joined into one message, if any.
pub(crate) fn validation_blocker(
    intents: &[ParsedIntent],
    outcomes: &[ValidationOutcome],
) -> Option<String> {
    let problems: Vec<String> = intents
        .iter()
        .zip(outcomes)
        .filter_map(|(intent, outcome)| outcome.problem(&intent.intent))
        .collect();
    (!problems.is_empty()).then(|| problems.join("; "))
}

/// Ambiguous or unmatched references joined into one message, if any.
pub(crate) fn resolution_blocker(items: &[ResolvedIntent]) -> Option<String> {
    let problems: Vec<String> = items
        .iter()
        .flat_map(|item| item.unresolved())
        .map(|entity| match &entity.candidates {
            Some(candidates) => {
                let labels: Vec<&str> = candidates.iter().map(|c| c.label.as_str()).collect();
                format!(
                    "'{}' matches several line items: {}",
                    entity.original,
                    labels.join(", ")
                )
            }
            None => format!("'{}': {}", entity.original, entity.label),
        })
        .collect();
    (!problems.is_empty()).then(|| format!("Could not resolve {}", problems.join("; ")))
}

// ---------------------------------------------------------------------------
// Audited steps shared with the one-shot message path
// ---------------------------------------------------------------------------

impl AgentOrchestrator {
    pub(crate) async fn parse_audited(
        &self,
        input: &str,
        context: Option<&ConversationContext>,
        ctx: AuditContext,
    ) -> Result<ParseOutput, ParserError> {
        let started = Instant::now();
        let parsed = self.parser.parse(input, context).await;
        let duration_ms = elapsed_ms(started);
        let record = AuditRecord::new(AuditPhase::Parse, ctx)
            .with_input(json!({ "message": input }))
            .with_duration(duration_ms);

        match &parsed {
            Ok(output) => {
                self.audit
                    .log(
                        record
                            .with_output(serde_json::to_value(output).unwrap_or(Value::Null))
                            .with_usage(output.usage.clone()),
                    )
                    .await;
            }
            Err(e) => {
                tracing::warn!(run_id = ?ctx.run_id, error = %e, "Parser call failed");
                let record = AuditRecord {
                    phase: AuditPhase::Error,
                    ..record
                };
                self.audit
                    .log(record.with_output(json!({ "error": e.to_string() })))
                    .await;
            }
        }
        parsed
    }

    pub(crate) async fn validate_audited(
        &self,
        intents: &[ParsedIntent],
        ctx: AuditContext,
    ) -> Vec<ValidationOutcome> {
        let outcomes: Vec<ValidationOutcome> =
            intents.iter().map(|i| self.validator.validate(i)).collect();
        self.audit
            .log(
                AuditRecord::new(AuditPhase::Validate, ctx)
                    .with_input(serde_json::to_value(intents).unwrap_or(Value::Null))
                    .with_output(serde_json::to_value(&outcomes).unwrap_or(Value::Null)),
            )
            .await;
        outcomes
    }

    pub(crate) async fn audit_resolution(
        &self,
        items: &[ResolvedIntent],
        ctx: AuditContext,
        duration_ms: i64,
    ) {
        let entities: Vec<_> = items.iter().flat_map(|i| &i.resolved_entities).collect();
        self.audit
            .log(
                AuditRecord::new(AuditPhase::Resolve, ctx)
                    .with_output(serde_json::to_value(&entities).unwrap_or(Value::Null))
                    .with_duration(duration_ms),
            )
            .await;
    }

    /// Build a plan, persist it as `pending` and audit it.
    pub(crate) async fn plan_audited(
        &self,
        items: &[ResolvedIntent],
        run_id: Option<EntityId>,
        ctx: AuditContext,
        user_id: Option<DbId>,
    ) -> Result<StoredPlan, OrchestratorError> {
        let plan = self.plan_builder.build(items);
        let stored = self
            .stores
            .plans
            .save_plan(NewPlan {
                plan,
                conversation_id: ctx.conversation_id,
                run_id,
                user_id,
            })
            .await?;
        self.audit
            .log(
                AuditRecord::new(AuditPhase::Plan, ctx)
                    .with_plan(stored.id)
                    .with_output(serde_json::to_value(&stored.plan).unwrap_or(Value::Null)),
            )
            .await;
        Ok(stored)
    }

    /// Execute a stored plan and move it from its current status to
    /// `executed` or `failed`.
    pub(crate) async fn execute_stored(
        &self,
        stored: &StoredPlan,
        ctx: AuditContext,
    ) -> Result<(StoredPlan, ExecutionResult), OrchestratorError> {
        if !matches!(stored.status, PlanStatus::Pending | PlanStatus::Approved) {
            return Err(OrchestratorError::InvalidState(format!(
                "Plan {} is {} and cannot be executed",
                stored.id, stored.status
            )));
        }
        let result = self.executor.execute(&stored.plan, ctx).await;
        let next = if result.overall_success {
            PlanStatus::Executed
        } else {
            PlanStatus::Failed
        };
        let updated = self
            .stores
            .plans
            .transition_plan(stored.id, stored.status, next, Some(&result))
            .await?
            .ok_or_else(|| {
                OrchestratorError::InvalidState(format!(
                    "Plan {} changed status during execution",
                    stored.id
                ))
            })?;
        Ok((updated, result))
    }
}

// ---------------------------------------------------------------------------
// Per-stage work of a durable run
// ---------------------------------------------------------------------------

impl AgentOrchestrator {
    pub(crate) async fn run_stage(
        &self,
        run: &RunWithStages,
        kind: StageKind,
    ) -> Result<StageReport, OrchestratorError> {
        match kind {
            StageKind::Parsing => self.parsing_stage(run).await,
            StageKind::Validating => self.validating_stage(run).await,
            StageKind::Resolving => self.resolving_stage(run).await,
            StageKind::Planning => self.planning_stage(run).await,
            StageKind::Executing => self.executing_stage(run).await,
        }
    }

    async fn parsing_stage(&self, run: &RunWithStages) -> Result<StageReport, OrchestratorError> {
        let ctx = audit_context(&run.run);
        let context = self.conversation_context(run.run.conversation_id).await?;
        let parsed = self
            .parse_audited(&run.run.input, context.as_ref(), ctx)
            .await
            .map_err(|e| OrchestratorError::ExecutionFailed(e.to_string()))?;

        let usage = parsed.usage;
        let output = ParsingOutput {
            intents: parsed.intents,
            unhandled_content: parsed.unhandled_content,
        };
        let outcome = if output.intents.is_empty() {
            StageOutcome::Blocked(NO_ACTIONABLE_REQUEST.to_string())
        } else {
            StageOutcome::Advance
        };
        let detail = format!("{} intent(s) extracted", output.intents.len());
        Ok(StageReport::new(outcome, &output)?
            .with_detail(detail)
            .with_cost(usage))
    }

    async fn validating_stage(&self, run: &RunWithStages) -> Result<StageReport, OrchestratorError> {
        let parsed: ParsingOutput = stage_output(run, StageKind::Parsing)?;
        let outcomes = self
            .validate_audited(&parsed.intents, audit_context(&run.run))
            .await;

        let blocker = validation_blocker(&parsed.intents, &outcomes);
        let output = ValidatingOutput {
            intents: parsed.intents,
            outcomes,
        };
        let report = match blocker {
            Some(problem) => StageReport::new(StageOutcome::Blocked(problem), &output)?,
            None => StageReport::new(StageOutcome::Advance, &output)?
                .with_detail(format!("{} intent(s) valid", output.intents.len())),
        };
        Ok(report)
    }

    async fn resolving_stage(&self, run: &RunWithStages) -> Result<StageReport, OrchestratorError> {
        let validated: ValidatingOutput = stage_output(run, StageKind::Validating)?;
        let stage_id = run
            .stage(StageKind::Resolving)
            .map(|s| s.id)
            .ok_or_else(|| OrchestratorError::not_found("PipelineStage", StageKind::Resolving))?;

        let started = Instant::now();
        let mut items = Vec::with_capacity(validated.intents.len());
        for (index, intent) in validated.intents.into_iter().enumerate() {
            let key = format!("intent-{index}");
            let label = intent.intent.clone();
            self.report_progress(
                run.run.id,
                stage_id,
                ProgressItem::new(&key, &label, ProgressStatus::Running),
            )
            .await?;

            let resolved = self.resolver.resolve(intent).await;
            let unresolved = resolved.unresolved().count();
            let item = if unresolved == 0 {
                ProgressItem::new(&key, &label, ProgressStatus::Done)
            } else {
                ProgressItem::new(&key, &label, ProgressStatus::Failed)
                    .with_detail(format!("{unresolved} reference(s) unresolved"))
            };
            self.report_progress(run.run.id, stage_id, item).await?;
            items.push(resolved);
        }
        self.audit_resolution(&items, audit_context(&run.run), elapsed_ms(started))
            .await;

        let output = ResolvingOutput { items };
        let report = match resolution_blocker(&output.items) {
            Some(problem) => StageReport::new(StageOutcome::Blocked(problem), &output)?,
            None => {
                let resolved: usize = output.items.iter().map(|i| i.resolved_entities.len()).sum();
                StageReport::new(StageOutcome::Advance, &output)?
                    .with_detail(format!("{resolved} reference(s) resolved"))
            }
        };
        Ok(report)
    }

    async fn planning_stage(&self, run: &RunWithStages) -> Result<StageReport, OrchestratorError> {
        let resolved: ResolvingOutput = stage_output(run, StageKind::Resolving)?;
        let stored = self
            .plan_audited(
                &resolved.items,
                Some(run.run.id),
                audit_context(&run.run),
                run.run.user_id,
            )
            .await?;

        let outcome = if stored.plan.requires_approval {
            StageOutcome::AwaitApproval
        } else {
            StageOutcome::Advance
        };
        let detail = stored.plan.summary.clone();
        let output = PlanningOutput { plan: stored.plan };
        Ok(StageReport::new(outcome, &output)?.with_detail(detail))
    }

    async fn executing_stage(&self, run: &RunWithStages) -> Result<StageReport, OrchestratorError> {
        let planned: PlanningOutput = stage_output(run, StageKind::Planning)?;
        let stored = self
            .stores
            .plans
            .find_plan(planned.plan.id)
            .await?
            .ok_or_else(|| OrchestratorError::not_found("ExecutionPlan", planned.plan.id))?;

        let (_, result) = self.execute_stored(&stored, audit_context(&run.run)).await?;
        let detail = result.summary();
        Ok(StageReport::new(StageOutcome::Finished(result.clone()), &result)?.with_detail(detail))
    }

    async fn report_progress(
        &self,
        run_id: EntityId,
        stage_id: EntityId,
        item: ProgressItem,
    ) -> Result<(), OrchestratorError> {
        let stage = self
            .stores
            .runs
            .append_progress_item(stage_id, item)
            .await?
            .ok_or_else(|| OrchestratorError::not_found("PipelineStage", stage_id))?;
        self.events.publish_stage_update(
            StageUpdateEvent::new(run_id, stage.stage, stage.status)
                .with_progress(stage.progress_items),
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
