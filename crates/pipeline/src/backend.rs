//! Downstream business-system client, consumed as an injected capability.
//!
//! The core never looks inside success payloads; failures arrive as the
//! structured [`BackendError`] envelope.

use async_trait::async_trait;
use opsagent_core::plan::ActionError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Structured business error returned by the downstream system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct BackendError {
    pub http_status: Option<u16>,
    pub code: String,
    pub message: String,
    #[serde(default)]
    pub details: Vec<String>,
}

impl BackendError {
    pub fn new(http_status: Option<u16>, code: &str, message: impl Into<String>) -> Self {
        Self {
            http_status,
            code: code.to_string(),
            message: message.into(),
            details: Vec::new(),
        }
    }
}

impl From<BackendError> for ActionError {
    fn from(err: BackendError) -> Self {
        Self {
            http_status: err.http_status,
            code: err.code,
            message: err.message,
            details: err.details,
        }
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

/// A purchase-order line item offered as a resolution candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItemCandidate {
    /// Canonical item number, e.g. `"00010"`.
    pub id: String,
    /// Human description, e.g. `"Steel Forks"`.
    pub label: String,
    /// Alternate key such as a material number.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secondary_key: Option<String>,
}

#[async_trait]
pub trait ActionBackend: Send + Sync {
    async fn get(&self, path: &str) -> BackendResult<Value>;

    async fn list(&self, path: &str) -> BackendResult<Value>;

    async fn create(&self, path: &str, body: &Value) -> BackendResult<Value>;

    async fn update(&self, path: &str, body: &Value) -> BackendResult<Value>;

    async fn delete(&self, path: &str) -> BackendResult<Value>;

    /// Live line items of a purchase order, for entity resolution.
    async fn list_po_items(&self, po_id: &str) -> BackendResult<Vec<LineItemCandidate>>;
}
