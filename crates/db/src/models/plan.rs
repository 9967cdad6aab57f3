//! Persisted execution plans (PlanStore).

use opsagent_core::plan::{ExecutionPlan, ExecutionResult, PlanStatus};
use opsagent_core::types::{DbId, EntityId, Timestamp};
use serde::Serialize;

/// A plan owned by the store, with its approval/execution lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredPlan {
    pub id: EntityId,
    pub conversation_id: Option<EntityId>,
    pub run_id: Option<EntityId>,
    pub user_id: Option<DbId>,
    pub plan: ExecutionPlan,
    pub status: PlanStatus,
    pub result: Option<ExecutionResult>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// Insert DTO. The stored id is the plan's own id.
#[derive(Debug, Clone)]
pub struct NewPlan {
    pub plan: ExecutionPlan,
    pub conversation_id: Option<EntityId>,
    pub run_id: Option<EntityId>,
    pub user_id: Option<DbId>,
}
