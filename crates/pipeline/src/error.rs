use opsagent_core::error::CoreError;
use opsagent_db::StoreError;

/// Errors returned by the run lifecycle operations.
///
/// The variant set is closed; [`code`](Self::code) gives the stable string a
/// transport layer reports to callers.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// The target exists but is not in a state that accepts the operation.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl OrchestratorError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::InvalidState(_) => "INVALID_STATE",
            Self::Forbidden(_) => "FORBIDDEN",
            Self::ExecutionFailed(_) => "EXECUTION_FAILED",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::Store(_) => "STORE_ERROR",
        }
    }

    /// Suggested HTTP status for a transport layer.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotFound { .. } => 404,
            Self::InvalidState(_) => 409,
            Self::Forbidden(_) => 403,
            Self::ExecutionFailed(_) => 502,
            Self::Validation(_) => 400,
            Self::Store(_) => 500,
        }
    }
}

impl From<CoreError> for OrchestratorError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::NotFound { entity, id } => Self::NotFound { entity, id },
            CoreError::Validation(msg) => Self::Validation(msg),
            CoreError::Conflict(msg) => Self::InvalidState(msg),
            CoreError::Unauthorized(msg) | CoreError::Forbidden(msg) => Self::Forbidden(msg),
            CoreError::Internal(msg) => Self::ExecutionFailed(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_and_statuses_line_up() {
        let cases = [
            (OrchestratorError::not_found("PipelineRun", "x"), "NOT_FOUND", 404),
            (OrchestratorError::InvalidState("done".into()), "INVALID_STATE", 409),
            (OrchestratorError::Forbidden("no".into()), "FORBIDDEN", 403),
            (OrchestratorError::ExecutionFailed("boom".into()), "EXECUTION_FAILED", 502),
            (OrchestratorError::Validation("empty".into()), "VALIDATION_ERROR", 400),
        ];
        for (err, code, status) in cases {
            assert_eq!(err.code(), code);
            assert_eq!(err.http_status(), status);
        }
    }

    #[test]
    fn core_validation_maps_to_validation() {
        let err: OrchestratorError = CoreError::Validation("input too long".into()).into();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }
}
