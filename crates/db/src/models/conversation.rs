//! Conversations, their message history and the entities in focus.

use opsagent_core::error::CoreError;
use opsagent_core::types::{DbId, EntityId, Timestamp};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Conversation {
    pub id: EntityId,
    pub user_id: Option<DbId>,
    pub title: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, CoreError> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            "system" => Ok(Self::System),
            _ => Err(CoreError::Validation(format!(
                "Invalid message role: '{s}'. Must be one of: user, assistant, system"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub id: EntityId,
    pub conversation_id: EntityId,
    pub role: MessageRole,
    pub content: String,
    pub metadata: Option<serde_json::Value>,
    pub created_at: Timestamp,
}

/// Insert DTO for a message.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub role: MessageRole,
    pub content: String,
    pub metadata: Option<serde_json::Value>,
}

impl NewMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
            metadata: None,
        }
    }

    pub fn assistant(content: impl Into<String>, metadata: Option<serde_json::Value>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: content.into(),
            metadata,
        }
    }
}

/// An entity the conversation is currently talking about, e.g. "that order".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveEntity {
    pub conversation_id: EntityId,
    pub entity_type: String,
    pub entity_id: String,
    pub label: Option<String>,
    pub updated_at: Timestamp,
}

/// Insert DTO for an active entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewActiveEntity {
    pub entity_type: String,
    pub entity_id: String,
    pub label: Option<String>,
}
