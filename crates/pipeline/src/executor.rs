//! Runs an [`ExecutionPlan`] against the [`ActionBackend`].
//!
//! Actions run strictly in plan order. After the first failure every later
//! mutating action is skipped; reads keep running.

use std::sync::Arc;
use std::time::Instant;

use opsagent_core::audit::AuditPhase;
use opsagent_core::catalog::{HttpMethod, IntentCatalog};
use opsagent_core::plan::{
    ActionError, ActionOutcome, ActionResult, ExecutionPlan, ExecutionResult, PlannedAction,
};
use serde_json::{json, Value};

use crate::audit_logger::{AuditContext, AuditLogger, AuditRecord};
use crate::backend::ActionBackend;

/// Executes plans one action at a time, auditing each action.
#[derive(Clone)]
pub struct Executor {
    backend: Arc<dyn ActionBackend>,
    catalog: Arc<IntentCatalog>,
    audit: AuditLogger,
}

impl Executor {
    pub fn new(
        backend: Arc<dyn ActionBackend>,
        catalog: Arc<IntentCatalog>,
        audit: AuditLogger,
    ) -> Self {
        Self {
            backend,
            catalog,
            audit,
        }
    }

    pub async fn execute(&self, plan: &ExecutionPlan, ctx: AuditContext) -> ExecutionResult {
        let mut results = Vec::with_capacity(plan.actions.len());
        let mut prior_failure = false;

        for (index, action) in plan.actions.iter().enumerate() {
            let started = Instant::now();

            let (outcome, data, error) = if prior_failure && action.call.method.is_mutating() {
                (
                    ActionOutcome::Skipped,
                    None,
                    Some(ActionError::local(
                        "SKIPPED_PRIOR_FAILURE",
                        "Skipped because an earlier action failed",
                    )),
                )
            } else {
                match self.dispatch(action).await {
                    Ok(data) => (ActionOutcome::Succeeded, Some(data), None),
                    Err(e) => (ActionOutcome::Failed, None, Some(e)),
                }
            };
            let duration_ms = elapsed_ms(started);
            let success = outcome == ActionOutcome::Succeeded;

            match &error {
                None => tracing::info!(
                    plan_id = %plan.id,
                    index,
                    intent = %action.intent,
                    duration_ms,
                    "Action succeeded",
                ),
                Some(e) => tracing::warn!(
                    plan_id = %plan.id,
                    index,
                    intent = %action.intent,
                    code = %e.code,
                    error = %e.message,
                    "Action did not succeed",
                ),
            }

            let result = ActionResult {
                index,
                intent: action.intent.clone(),
                description: action.description.clone(),
                outcome,
                success,
                data,
                error,
                duration_ms,
            };

            let phase = if success {
                AuditPhase::Execute
            } else {
                AuditPhase::Error
            };
            self.audit
                .log(
                    AuditRecord::new(phase, ctx)
                        .with_plan(plan.id)
                        .with_input(json!({
                            "intent": action.intent,
                            "method": action.call.method,
                            "path": action.call.path,
                            "body": action.call.body,
                        }))
                        .with_output(serde_json::to_value(&result).unwrap_or(Value::Null))
                        .with_duration(duration_ms),
                )
                .await;

            prior_failure |= !success;
            results.push(result);
        }

        let overall_success = results.iter().all(|r| r.success);
        ExecutionResult {
            plan_id: plan.id,
            completed_at: chrono::Utc::now(),
            results,
            overall_success,
        }
    }

    async fn dispatch(&self, action: &PlannedAction) -> Result<Value, ActionError> {
        let call = &action.call;
        if call.path.is_empty() {
            return Err(ActionError::local(
                "UNKNOWN_INTENT",
                format!("No action is defined for '{}'", action.intent),
            ));
        }
        if !call.missing_params.is_empty() {
            return Err(ActionError::local(
                "MISSING_IDENTIFIER",
                format!(
                    "Missing identifier(s) for '{}': {}",
                    action.intent,
                    call.missing_params.join(", ")
                ),
            ));
        }

        let empty = Value::Object(Default::default());
        let body = call.body.as_ref().unwrap_or(&empty);
        let response = match call.method {
            HttpMethod::Get if self.targets_single_record(&action.intent) => {
                self.backend.get(&call.path).await
            }
            HttpMethod::Get => self.backend.list(&call.path).await,
            HttpMethod::Post => self.backend.create(&call.path, body).await,
            HttpMethod::Put | HttpMethod::Patch => self.backend.update(&call.path, body).await,
            HttpMethod::Delete => self.backend.delete(&call.path).await,
        };
        response.map_err(ActionError::from)
    }

    fn targets_single_record(&self, intent: &str) -> bool {
        self.catalog
            .get(intent)
            .is_some_and(|def| def.action.targets_single_record())
    }
}

pub(crate) fn elapsed_ms(started: Instant) -> i64 {
    i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
