//! Pipeline run and stage models, status enums and the start-run DTO.
//!
//! A run moves through five fixed stages (parse, validate, resolve, plan,
//! execute). Every run owns exactly five [`PipelineStage`] records created
//! together with it.

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::CoreError;
use crate::types::{DbId, EntityId, Timestamp};

/// Maximum accepted length of a run's input text.
pub const MAX_INPUT_LENGTH: u64 = 10_000;

/// Maximum length of an optional run name.
pub const MAX_RUN_NAME_LENGTH: u64 = 200;

// ---------------------------------------------------------------------------
// StageKind
// ---------------------------------------------------------------------------

/// One of the five pipeline stages, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Parsing,
    Validating,
    Resolving,
    Planning,
    Executing,
}

impl StageKind {
    /// All stages in order.
    pub const ALL: [StageKind; 5] = [
        Self::Parsing,
        Self::Validating,
        Self::Resolving,
        Self::Planning,
        Self::Executing,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Parsing => "parsing",
            Self::Validating => "validating",
            Self::Resolving => "resolving",
            Self::Planning => "planning",
            Self::Executing => "executing",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, CoreError> {
        Self::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| {
                CoreError::Validation(format!(
                    "Invalid stage: '{s}'. Must be one of: parsing, validating, resolving, \
                     planning, executing"
                ))
            })
    }

    /// Fixed 0-4 sequence index.
    pub fn order(&self) -> i16 {
        match self {
            Self::Parsing => 0,
            Self::Validating => 1,
            Self::Resolving => 2,
            Self::Planning => 3,
            Self::Executing => 4,
        }
    }

    pub fn next(&self) -> Option<Self> {
        match self {
            Self::Parsing => Some(Self::Validating),
            Self::Validating => Some(Self::Resolving),
            Self::Resolving => Some(Self::Planning),
            Self::Planning => Some(Self::Executing),
            Self::Executing => None,
        }
    }

    pub fn is_last(&self) -> bool {
        self.next().is_none()
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// StageStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
}

impl StageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, CoreError> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            _ => Err(CoreError::Validation(format!(
                "Invalid stage status: '{s}'. Must be one of: pending, running, completed, \
                 failed, skipped"
            ))),
        }
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// RunStatus
// ---------------------------------------------------------------------------

/// Run state machine. `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
    AwaitingApproval,
    /// Stopped after completing the given stage, waiting for a continue call.
    PausedAt(StageKind),
}

impl RunStatus {
    /// Every value the status column can hold.
    pub const ALL: [RunStatus; 9] = [
        Self::Running,
        Self::Completed,
        Self::Failed,
        Self::AwaitingApproval,
        Self::PausedAt(StageKind::Parsing),
        Self::PausedAt(StageKind::Validating),
        Self::PausedAt(StageKind::Resolving),
        Self::PausedAt(StageKind::Planning),
        Self::PausedAt(StageKind::Executing),
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::AwaitingApproval => "awaiting_approval",
            Self::PausedAt(StageKind::Parsing) => "paused_at_parsing",
            Self::PausedAt(StageKind::Validating) => "paused_at_validating",
            Self::PausedAt(StageKind::Resolving) => "paused_at_resolving",
            Self::PausedAt(StageKind::Planning) => "paused_at_planning",
            Self::PausedAt(StageKind::Executing) => "paused_at_executing",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, CoreError> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| CoreError::Validation(format!("Invalid run status: '{s}'")))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn is_paused(&self) -> bool {
        matches!(self, Self::PausedAt(_))
    }

    /// Statuses a crashed process could leave behind.
    pub fn non_terminal() -> Vec<RunStatus> {
        Self::ALL.into_iter().filter(|s| !s.is_terminal()).collect()
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<RunStatus> for String {
    fn from(value: RunStatus) -> Self {
        value.as_str().to_string()
    }
}

impl TryFrom<String> for RunStatus {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_str(&value)
    }
}

// ---------------------------------------------------------------------------
// RunMode
// ---------------------------------------------------------------------------

/// `Auto` drives straight through; `Step` pauses after every stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    #[default]
    Auto,
    Step,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Step => "step",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, CoreError> {
        match s {
            "auto" => Ok(Self::Auto),
            "step" => Ok(Self::Step),
            _ => Err(CoreError::Validation(format!(
                "Invalid run mode: '{s}'. Must be one of: auto, step"
            ))),
        }
    }
}

impl std::fmt::Display for RunMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Progress items / cost
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Pending,
    Running,
    Done,
    Failed,
}

/// Sub-task progress within a stage, keyed by `item`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressItem {
    pub item: String,
    pub label: String,
    pub status: ProgressStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub updated_at: Timestamp,
}

impl ProgressItem {
    pub fn new(item: impl Into<String>, label: impl Into<String>, status: ProgressStatus) -> Self {
        Self {
            item: item.into(),
            label: label.into(),
            status,
            detail: None,
            updated_at: chrono::Utc::now(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Insert `item`, replacing any existing entry with the same key in place.
pub fn upsert_progress_item(items: &mut Vec<ProgressItem>, item: ProgressItem) {
    match items.iter_mut().find(|existing| existing.item == item.item) {
        Some(existing) => *existing = item,
        None => items.push(item),
    }
}

/// Token and cost accounting for a stage that called a priced capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

// ---------------------------------------------------------------------------
// PipelineRun / PipelineStage
// ---------------------------------------------------------------------------

/// A durable pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: EntityId,
    pub name: Option<String>,
    pub conversation_id: Option<EntityId>,
    pub input: String,
    pub status: RunStatus,
    pub mode: RunMode,
    pub current_stage: Option<StageKind>,
    /// Set only on successful completion.
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    /// `None` bypasses ownership checks.
    pub user_id: Option<DbId>,
    pub started_at: Timestamp,
    pub completed_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub duration_ms: Option<i64>,
}

impl PipelineRun {
    /// Whether `user_id` may see and act on this run.
    pub fn is_visible_to(&self, user_id: Option<DbId>) -> bool {
        match (self.user_id, user_id) {
            (None, _) => true,
            (Some(owner), Some(caller)) => owner == caller,
            (Some(_), None) => false,
        }
    }
}

/// One of the five stage records of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStage {
    pub id: EntityId,
    pub run_id: EntityId,
    pub stage: StageKind,
    pub status: StageStatus,
    pub order: i16,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub duration_ms: Option<i64>,
    pub detail: Option<String>,
    pub input: Option<serde_json::Value>,
    pub output: Option<serde_json::Value>,
    pub progress_items: Vec<ProgressItem>,
    pub error: Option<String>,
    pub cost_estimate: Option<CostEstimate>,
}

/// A run with its stages in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunWithStages {
    #[serde(flatten)]
    pub run: PipelineRun,
    pub stages: Vec<PipelineStage>,
}

impl RunWithStages {
    pub fn stage(&self, kind: StageKind) -> Option<&PipelineStage> {
        self.stages.iter().find(|s| s.stage == kind)
    }
}

// ---------------------------------------------------------------------------
// StartRun DTO
// ---------------------------------------------------------------------------

/// Request to start a new run.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct StartRun {
    #[validate(length(
        min = 1,
        max = MAX_INPUT_LENGTH,
        message = "input must be 1-10000 characters"
    ))]
    pub input: String,
    #[validate(length(max = MAX_RUN_NAME_LENGTH))]
    pub name: Option<String>,
    pub conversation_id: Option<EntityId>,
    pub user_id: Option<DbId>,
    #[serde(default)]
    pub mode: RunMode,
}

impl StartRun {
    pub fn new(input: impl Into<String>, mode: RunMode) -> Self {
        Self {
            input: input.into(),
            name: None,
            conversation_id: None,
            user_id: None,
            mode,
        }
    }

    /// Validate and normalise the request (trims the input).
    pub fn checked(mut self) -> Result<Self, CoreError> {
        self.input = self.input.trim().to_string();
        self.validate()
            .map_err(|e| CoreError::Validation(e.to_string()))?;
        Ok(self)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_order_is_fixed() {
        let orders: Vec<i16> = StageKind::ALL.iter().map(|s| s.order()).collect();
        assert_eq!(orders, vec![0, 1, 2, 3, 4]);
        assert_eq!(StageKind::Planning.next(), Some(StageKind::Executing));
        assert!(StageKind::Executing.is_last());
    }

    #[test]
    fn run_status_string_forms() {
        for status in RunStatus::ALL {
            assert_eq!(RunStatus::from_str(status.as_str()).unwrap(), status);
        }
        assert_eq!(
            serde_json::to_string(&RunStatus::PausedAt(StageKind::Resolving)).unwrap(),
            "\"paused_at_resolving\""
        );
        let parsed: RunStatus = serde_json::from_str("\"awaiting_approval\"").unwrap();
        assert_eq!(parsed, RunStatus::AwaitingApproval);
        assert!(serde_json::from_str::<RunStatus>("\"sleeping\"").is_err());
    }

    #[test]
    fn non_terminal_statuses_exclude_completed_and_failed() {
        let statuses = RunStatus::non_terminal();
        assert_eq!(statuses.len(), 7);
        assert!(!statuses.contains(&RunStatus::Completed));
        assert!(!statuses.contains(&RunStatus::Failed));
    }

    #[test]
    fn upsert_replaces_by_key_in_place() {
        let mut items = vec![
            ProgressItem::new("a", "A", ProgressStatus::Running),
            ProgressItem::new("b", "B", ProgressStatus::Running),
        ];
        upsert_progress_item(&mut items, ProgressItem::new("a", "A", ProgressStatus::Done));
        upsert_progress_item(&mut items, ProgressItem::new("c", "C", ProgressStatus::Pending));
        let keys: Vec<&str> = items.iter().map(|i| i.item.as_str()).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
        assert_eq!(items[0].status, ProgressStatus::Done);
    }

    #[test]
    fn ownership_visibility() {
        let now = chrono::Utc::now();
        let mut run = PipelineRun {
            id: crate::types::new_id(),
            name: None,
            conversation_id: None,
            input: "show po 1".into(),
            status: RunStatus::Running,
            mode: RunMode::Auto,
            current_stage: Some(StageKind::Parsing),
            result: None,
            error: None,
            user_id: None,
            started_at: now,
            completed_at: None,
            created_at: now,
            duration_ms: None,
        };
        assert!(run.is_visible_to(None));
        assert!(run.is_visible_to(Some(9)));
        run.user_id = Some(7);
        assert!(run.is_visible_to(Some(7)));
        assert!(!run.is_visible_to(Some(9)));
        assert!(!run.is_visible_to(None));
    }

    #[test]
    fn start_run_rejects_blank_input() {
        let result = StartRun::new("   ", RunMode::Auto).checked();
        assert!(matches!(result, Err(CoreError::Validation(_))));
        let ok = StartRun::new("  show po 1 ", RunMode::Step).checked().unwrap();
        assert_eq!(ok.input, "show po 1");
    }

    #[test]
    fn start_run_length_limits_follow_the_constants() {
        let at_limit = "x".repeat(MAX_INPUT_LENGTH as usize);
        assert!(StartRun::new(at_limit.clone(), RunMode::Auto).checked().is_ok());
        let over = format!("{at_limit}x");
        assert!(matches!(
            StartRun::new(over, RunMode::Auto).checked(),
            Err(CoreError::Validation(_))
        ));

        let mut named = StartRun::new("show po 1", RunMode::Auto);
        named.name = Some("n".repeat(MAX_RUN_NAME_LENGTH as usize));
        assert!(named.clone().checked().is_ok());
        named.name = Some("n".repeat(MAX_RUN_NAME_LENGTH as usize + 1));
        assert!(matches!(named.checked(), Err(CoreError::Validation(_))));
    }
}
