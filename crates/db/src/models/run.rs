//! Pipeline run/stage DTOs used by [`RunStore`](crate::store::RunStore).

use opsagent_core::run::{
    CostEstimate, PipelineRun, RunMode, RunStatus, StageKind, StageStatus, StartRun,
};
use opsagent_core::types::{DbId, EntityId, Timestamp};
use serde::Deserialize;

/// Default page size for run listings.
pub const DEFAULT_RUN_PAGE_SIZE: i64 = 50;

/// Largest page a caller may request.
pub const MAX_RUN_PAGE_SIZE: i64 = 200;

/// Insert DTO for a new run. Stages are created alongside it.
#[derive(Debug, Clone)]
pub struct NewPipelineRun {
    pub name: Option<String>,
    pub conversation_id: Option<EntityId>,
    pub input: String,
    pub mode: RunMode,
    pub user_id: Option<DbId>,
}

impl From<StartRun> for NewPipelineRun {
    fn from(req: StartRun) -> Self {
        Self {
            name: req.name,
            conversation_id: req.conversation_id,
            input: req.input,
            mode: req.mode,
            user_id: req.user_id,
        }
    }
}

/// Partial update of a run. Only `Some` fields are written; the nested
/// options on nullable columns distinguish "leave" from "clear".
#[derive(Debug, Clone, Default)]
pub struct UpdatePipelineRun {
    pub status: Option<RunStatus>,
    pub current_stage: Option<Option<StageKind>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<Option<String>>,
    pub completed_at: Option<Timestamp>,
    pub duration_ms: Option<i64>,
}

impl UpdatePipelineRun {
    pub fn status(status: RunStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_stage(mut self, stage: Option<StageKind>) -> Self {
        self.current_stage = Some(stage);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(Some(error.into()));
        self
    }

    pub fn with_result(mut self, result: serde_json::Value) -> Self {
        self.result = Some(result);
        self
    }

    /// Move `run` into a terminal status, stamping `completed_at` and
    /// `duration_ms` together.
    pub fn finished(run: &PipelineRun, status: RunStatus) -> Self {
        let now = chrono::Utc::now();
        Self {
            status: Some(status),
            current_stage: Some(None),
            completed_at: Some(now),
            duration_ms: Some((now - run.started_at).num_milliseconds().max(0)),
            ..Default::default()
        }
    }
}

/// Partial update of a stage. Only `Some` fields are written.
#[derive(Debug, Clone, Default)]
pub struct UpdatePipelineStage {
    pub status: Option<StageStatus>,
    pub started_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
    pub duration_ms: Option<i64>,
    pub detail: Option<String>,
    pub input: Option<serde_json::Value>,
    pub output: Option<serde_json::Value>,
    pub error: Option<Option<String>>,
    pub cost_estimate: Option<CostEstimate>,
}

impl UpdatePipelineStage {
    pub fn status(status: StageStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    /// Put a stage back to `pending` so that it can be driven again.
    pub fn reset() -> Self {
        Self {
            status: Some(StageStatus::Pending),
            error: Some(None),
            detail: Some("Reset for retry".to_string()),
            ..Default::default()
        }
    }
}

/// Filter for listing runs. Newest first.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RunQuery {
    pub status: Option<RunStatus>,
    pub user_id: Option<DbId>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl RunQuery {
    pub fn effective_limit(&self) -> i64 {
        self.limit
            .unwrap_or(DEFAULT_RUN_PAGE_SIZE)
            .clamp(1, MAX_RUN_PAGE_SIZE)
    }

    pub fn effective_offset(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }
}
