//! Text-to-intent extraction, consumed as an injected capability.

use async_trait::async_trait;
use opsagent_core::intent::ParsedIntent;
use opsagent_core::run::CostEstimate;
use opsagent_core::types::EntityId;
use opsagent_db::models::conversation::{ActiveEntity, Message};
use serde::{Deserialize, Serialize};

/// Recent history and entities in focus, handed to the parser so that it
/// can resolve references such as "that order".
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConversationContext {
    pub conversation_id: Option<EntityId>,
    /// Oldest first.
    pub history: Vec<Message>,
    pub active_entities: Vec<ActiveEntity>,
}

/// What the parser extracted from one message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParseOutput {
    pub intents: Vec<ParsedIntent>,
    /// Parts of the message that did not map to any intent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unhandled_content: Option<String>,
    /// Token accounting when the parser called a priced model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<CostEstimate>,
}

#[derive(Debug, thiserror::Error)]
pub enum ParserError {
    /// The extraction provider was unreachable or returned an error.
    #[error("Parser provider error: {0}")]
    Provider(String),

    /// The provider answered with something that is not a set of intents.
    #[error("Invalid parser response: {0}")]
    InvalidResponse(String),
}

#[async_trait]
pub trait Parser: Send + Sync {
    async fn parse(
        &self,
        message: &str,
        context: Option<&ConversationContext>,
    ) -> Result<ParseOutput, ParserError>;
}
