//! Collaborators wired into the worker when no extraction provider or
//! business-system client is configured for the process.
//!
//! Runs the recovery sweep re-drives then fail at their next stage with a
//! provider error instead of hanging in `running`.

use async_trait::async_trait;
use opsagent_pipeline::{
    ActionBackend, BackendError, BackendResult, ConversationContext, LineItemCandidate,
    ParseOutput, Parser, ParserError,
};
use serde_json::Value;

const BACKEND_UNAVAILABLE: &str = "BACKEND_UNAVAILABLE";

pub struct UnavailableParser;

#[async_trait]
impl Parser for UnavailableParser {
    async fn parse(
        &self,
        _message: &str,
        _context: Option<&ConversationContext>,
    ) -> Result<ParseOutput, ParserError> {
        Err(ParserError::Provider(
            "no intent extraction provider is configured for this worker".to_string(),
        ))
    }
}

pub struct UnavailableBackend;

impl UnavailableBackend {
    fn refuse<T>(path: &str) -> BackendResult<T> {
        Err(BackendError::new(
            Some(503),
            BACKEND_UNAVAILABLE,
            format!("no business-system client is configured (requested {path})"),
        ))
    }
}

#[async_trait]
impl ActionBackend for UnavailableBackend {
    async fn get(&self, path: &str) -> BackendResult<Value> {
        Self::refuse(path)
    }

    async fn list(&self, path: &str) -> BackendResult<Value> {
        Self::refuse(path)
    }

    async fn create(&self, path: &str, _body: &Value) -> BackendResult<Value> {
        Self::refuse(path)
    }

    async fn update(&self, path: &str, _body: &Value) -> BackendResult<Value> {
        Self::refuse(path)
    }

    async fn delete(&self, path: &str) -> BackendResult<Value> {
        Self::refuse(path)
    }

    async fn list_po_items(&self, po_id: &str) -> BackendResult<Vec<LineItemCandidate>> {
        Self::refuse(&format!("/purchase-orders/{po_id}/items"))
    }
}
