//! Repository for `conversations`, `messages` and `active_entities`.

use opsagent_core::types::{new_id, DbId, EntityId, Timestamp};
use sqlx::{FromRow, PgPool};

use crate::models::conversation::{
    ActiveEntity, Conversation, Message, MessageRole, NewActiveEntity, NewMessage,
};
use crate::store::StoreError;

/// Column list for `conversations` queries.
const COLUMNS: &str = "id, user_id, title, created_at, updated_at";

/// Column list for `messages` queries.
const MESSAGE_COLUMNS: &str = "id, conversation_id, role, content, metadata, created_at";

/// Column list for `active_entities` queries.
const ENTITY_COLUMNS: &str = "conversation_id, entity_type, entity_id, label, updated_at";

#[derive(Debug, Clone, FromRow)]
pub struct ConversationRow {
    pub id: EntityId,
    pub user_id: Option<DbId>,
    pub title: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl From<ConversationRow> for Conversation {
    fn from(row: ConversationRow) -> Self {
        Self {
            id: row.id,
            user_id: row.user_id,
            title: row.title,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct MessageRow {
    pub id: EntityId,
    pub conversation_id: EntityId,
    pub role: String,
    pub content: String,
    pub metadata: Option<serde_json::Value>,
    pub created_at: Timestamp,
}

impl TryFrom<MessageRow> for Message {
    type Error = StoreError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            conversation_id: row.conversation_id,
            role: MessageRole::from_str(&row.role)?,
            content: row.content,
            metadata: row.metadata,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct ActiveEntityRow {
    pub conversation_id: EntityId,
    pub entity_type: String,
    pub entity_id: String,
    pub label: Option<String>,
    pub updated_at: Timestamp,
}

impl From<ActiveEntityRow> for ActiveEntity {
    fn from(row: ActiveEntityRow) -> Self {
        Self {
            conversation_id: row.conversation_id,
            entity_type: row.entity_type,
            entity_id: row.entity_id,
            label: row.label,
            updated_at: row.updated_at,
        }
    }
}

/// Provides CRUD for conversations and their history.
pub struct ConversationRepo;

impl ConversationRepo {
    pub async fn create(
        pool: &PgPool,
        user_id: Option<DbId>,
        title: Option<&str>,
    ) -> Result<ConversationRow, sqlx::Error> {
        let query = format!(
            "INSERT INTO conversations (id, user_id, title) VALUES ($1, $2, $3) \
             RETURNING {COLUMNS}"
        );
        sqlx::query_as::<_, ConversationRow>(&query)
            .bind(new_id())
            .bind(user_id)
            .bind(title)
            .fetch_one(pool)
            .await
    }

    pub async fn find_by_id(
        pool: &PgPool,
        id: EntityId,
    ) -> Result<Option<ConversationRow>, sqlx::Error> {
        let query = format!("SELECT {COLUMNS} FROM conversations WHERE id = $1");
        sqlx::query_as::<_, ConversationRow>(&query)
            .bind(id)
            .fetch_optional(pool)
            .await
    }

    /// Append a message and bump the conversation's `updated_at`.
    ///
    /// Returns `None` when the conversation does not exist.
    pub async fn append_message(
        pool: &PgPool,
        conversation_id: EntityId,
        message: &NewMessage,
    ) -> Result<Option<MessageRow>, sqlx::Error> {
        let mut tx = pool.begin().await?;

        let touched = sqlx::query("UPDATE conversations SET updated_at = NOW() WHERE id = $1")
            .bind(conversation_id)
            .execute(&mut *tx)
            .await?;
        if touched.rows_affected() == 0 {
            return Ok(None);
        }

        let query = format!(
            "INSERT INTO messages (id, conversation_id, role, content, metadata) \
             VALUES ($1, $2, $3, $4, $5) \
             RETURNING {MESSAGE_COLUMNS}"
        );
        let row = sqlx::query_as::<_, MessageRow>(&query)
            .bind(new_id())
            .bind(conversation_id)
            .bind(message.role.as_str())
            .bind(&message.content)
            .bind(&message.metadata)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Some(row))
    }

    /// The newest `limit` messages, returned oldest first.
    pub async fn recent_messages(
        pool: &PgPool,
        conversation_id: EntityId,
        limit: i64,
    ) -> Result<Vec<MessageRow>, sqlx::Error> {
        let query = format!(
            "SELECT {MESSAGE_COLUMNS} FROM ( \
                 SELECT {MESSAGE_COLUMNS} FROM messages \
                 WHERE conversation_id = $1 \
                 ORDER BY created_at DESC, id DESC \
                 LIMIT $2 \
             ) recent \
             ORDER BY created_at ASC, id ASC"
        );
        sqlx::query_as::<_, MessageRow>(&query)
            .bind(conversation_id)
            .bind(limit.max(0))
            .fetch_all(pool)
            .await
    }

    /// Swap the whole set of active entities in one transaction.
    pub async fn replace_active_entities(
        pool: &PgPool,
        conversation_id: EntityId,
        entities: &[NewActiveEntity],
    ) -> Result<Vec<ActiveEntityRow>, sqlx::Error> {
        let mut tx = pool.begin().await?;

        sqlx::query("DELETE FROM active_entities WHERE conversation_id = $1")
            .bind(conversation_id)
            .execute(&mut *tx)
            .await?;

        let query = format!(
            "INSERT INTO active_entities (conversation_id, entity_type, entity_id, label) \
             VALUES ($1, $2, $3, $4) \
             ON CONFLICT (conversation_id, entity_type, entity_id) \
             DO UPDATE SET label = EXCLUDED.label, updated_at = NOW() \
             RETURNING {ENTITY_COLUMNS}"
        );
        let mut rows = Vec::with_capacity(entities.len());
        for entity in entities {
            let row = sqlx::query_as::<_, ActiveEntityRow>(&query)
                .bind(conversation_id)
                .bind(&entity.entity_type)
                .bind(&entity.entity_id)
                .bind(&entity.label)
                .fetch_one(&mut *tx)
                .await?;
            rows.push(row);
        }

        tx.commit().await?;
        Ok(rows)
    }

    pub async fn active_entities(
        pool: &PgPool,
        conversation_id: EntityId,
    ) -> Result<Vec<ActiveEntityRow>, sqlx::Error> {
        let query = format!(
            "SELECT {ENTITY_COLUMNS} FROM active_entities \
             WHERE conversation_id = $1 ORDER BY updated_at ASC, entity_type, entity_id"
        );
        sqlx::query_as::<_, ActiveEntityRow>(&query)
            .bind(conversation_id)
            .fetch_all(pool)
            .await
    }

    /// Delete a conversation. Foreign keys cascade to messages, entities,
    /// plans and audit rows and null out `pipeline_runs.conversation_id`.
    pub async fn delete(pool: &PgPool, id: EntityId) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM conversations WHERE id = $1")
            .bind(id)
            .execute(pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}
