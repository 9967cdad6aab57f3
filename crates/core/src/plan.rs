//! Execution plans and their results.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::catalog::{HttpMethod, IntentCategory};
use crate::error::CoreError;
use crate::intent::ResolvedEntity;
use crate::types::{EntityId, Timestamp};

// ---------------------------------------------------------------------------
// Risk annotations
// ---------------------------------------------------------------------------

/// Risk annotation attached to a planned action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskFlag {
    /// The action permanently removes a record.
    Destructive,
    /// The action creates a new record with embedded line items.
    CreatesRecord,
}

impl RiskFlag {
    pub fn message(&self) -> &'static str {
        match self {
            Self::Destructive => "Destructive operation: this cannot be undone",
            Self::CreatesRecord => "A new record will be created",
        }
    }
}

// ---------------------------------------------------------------------------
// ActionCall / PlannedAction / ExecutionPlan
// ---------------------------------------------------------------------------

/// Concrete downstream call for one action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionCall {
    pub method: HttpMethod,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    /// Path parameters that could not be filled from the extracted fields.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_params: Vec<String>,
}

/// One step of an [`ExecutionPlan`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedAction {
    pub intent: String,
    pub category: IntentCategory,
    pub description: String,
    pub call: ActionCall,
    /// Extracted fields after resolution write-back.
    #[serde(default)]
    pub fields: Map<String, Value>,
    #[serde(default)]
    pub resolved_entities: Vec<ResolvedEntity>,
    pub requires_approval: bool,
    #[serde(default)]
    pub risks: Vec<RiskFlag>,
}

/// An ordered, approval-flagged list of actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub id: EntityId,
    pub created_at: Timestamp,
    pub actions: Vec<PlannedAction>,
    pub requires_approval: bool,
    pub summary: String,
}

// ---------------------------------------------------------------------------
// Execution results
// ---------------------------------------------------------------------------

/// Structured business error reported for a failed action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionError {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub details: Vec<String>,
}

impl ActionError {
    /// An error raised locally, before any downstream call.
    pub fn local(code: &str, message: impl Into<String>) -> Self {
        Self {
            http_status: None,
            code: code.to_string(),
            message: message.into(),
            details: Vec::new(),
        }
    }
}

/// What happened to a single action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionOutcome {
    Succeeded,
    Failed,
    /// Not attempted because an earlier action failed.
    Skipped,
}

/// Per-action entry of an [`ExecutionResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionResult {
    pub index: usize,
    pub intent: String,
    pub description: String,
    pub outcome: ActionOutcome,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ActionError>,
    pub duration_ms: i64,
}

/// Result of executing a whole plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub plan_id: EntityId,
    pub completed_at: Timestamp,
    pub results: Vec<ActionResult>,
    /// AND of every action's success.
    pub overall_success: bool,
}

impl ExecutionResult {
    pub fn failed_count(&self) -> usize {
        self.results.iter().filter(|r| !r.success).count()
    }

    /// Short text such as `"2 of 3 actions failed"`.
    pub fn summary(&self) -> String {
        if self.overall_success {
            format!("{} action(s) executed successfully", self.results.len())
        } else {
            format!(
                "{} of {} actions failed",
                self.failed_count(),
                self.results.len()
            )
        }
    }
}

// ---------------------------------------------------------------------------
// PlanStatus
// ---------------------------------------------------------------------------

/// Lifecycle of a persisted plan:
/// `pending -> {approved | rejected}`, `{pending | approved} -> {executed | failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Pending,
    Approved,
    Rejected,
    Executed,
    Failed,
}

impl PlanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Executed => "executed",
            Self::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, CoreError> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "executed" => Ok(Self::Executed),
            "failed" => Ok(Self::Failed),
            _ => Err(CoreError::Validation(format!(
                "Invalid plan status: '{s}'. Must be one of: pending, approved, rejected, \
                 executed, failed"
            ))),
        }
    }

    /// Plans that need no approval go straight from pending to executed.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Approved)
                | (Self::Pending, Self::Rejected)
                | (Self::Pending, Self::Executed)
                | (Self::Pending, Self::Failed)
                | (Self::Approved, Self::Executed)
                | (Self::Approved, Self::Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Rejected | Self::Executed | Self::Failed)
    }
}

impl std::fmt::Display for PlanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
