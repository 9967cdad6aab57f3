//! One-shot conversational turn without a durable run.

use std::time::Instant;

use opsagent_core::intent::{ResolvedEntity, ResolvedIntent};
use opsagent_core::plan::ExecutionResult;
use opsagent_core::run::{StageKind, StageStatus};
use opsagent_core::types::{DbId, EntityId};
use opsagent_db::models::conversation::{Conversation, NewActiveEntity, NewMessage};
use opsagent_db::models::plan::StoredPlan;
use serde::Serialize;
use serde_json::json;

use super::stages::{resolution_blocker, NO_ACTIONABLE_REQUEST};
use super::AgentOrchestrator;
use crate::audit_logger::AuditContext;
use crate::error::OrchestratorError;
use crate::executor::elapsed_ms;

/// Longest conversation title derived from a first message.
const TITLE_MAX_CHARS: usize = 80;

/// Entity type recorded for resolved purchase-order line items.
const PO_ITEM_ENTITY: &str = "po_item";

/// Invoked after each stage of a one-shot turn.
pub type StageCallback = dyn Fn(StageKind, StageStatus) + Send + Sync;

#[derive(Debug, Clone)]
pub struct ProcessMessage {
    pub message: String,
    /// Continue this conversation; a new one is started when `None`.
    pub conversation_id: Option<EntityId>,
    pub user_id: Option<DbId>,
}

/// Required fields one intent is still missing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MissingFields {
    pub intent: String,
    pub fields: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProcessOutcome {
    Error {
        conversation_id: EntityId,
        message: String,
    },
    /// The request needs more input before anything can be planned.
    Clarification {
        conversation_id: EntityId,
        message: String,
        missing_fields: Vec<MissingFields>,
        ambiguities: Vec<ResolvedEntity>,
    },
    PlanPending {
        conversation_id: EntityId,
        plan: StoredPlan,
    },
    Executed {
        conversation_id: EntityId,
        plan: StoredPlan,
        result: ExecutionResult,
    },
}

impl ProcessOutcome {
    pub fn conversation_id(&self) -> EntityId {
        match self {
            Self::Error {
                conversation_id, ..
            }
            | Self::Clarification {
                conversation_id, ..
            }
            | Self::PlanPending {
                conversation_id, ..
            }
            | Self::Executed {
                conversation_id, ..
            } => *conversation_id,
        }
    }
}

fn notify(callback: Option<&StageCallback>, stage: StageKind, status: StageStatus) {
    if let Some(callback) = callback {
        callback(stage, status);
    }
}

impl AgentOrchestrator {
    /// Parse, validate, resolve and plan one message; execute straight away
    /// when the plan needs no approval. Both sides of the exchange are
    /// appended to the conversation.
    pub async fn process_message(
        &self,
        req: ProcessMessage,
        on_stage_update: Option<&StageCallback>,
    ) -> Result<ProcessOutcome, OrchestratorError> {
        let message = req.message.trim();
        if message.is_empty() {
            return Err(OrchestratorError::Validation(
                "message must not be empty".to_string(),
            ));
        }

        let conversation = self.open_conversation(&req, message).await?;
        let conversation_id = conversation.id;
        let ctx = AuditContext {
            conversation_id: Some(conversation_id),
            run_id: None,
            user_id: req.user_id,
        };

        // Context is read before the new message lands so history holds
        // only earlier turns.
        let context = self.conversation_context(Some(conversation_id)).await?;
        self.stores
            .conversations
            .append_message(conversation_id, NewMessage::user(message))
            .await?;

        // Parsing
        notify(on_stage_update, StageKind::Parsing, StageStatus::Running);
        let parsed = match self.parse_audited(message, context.as_ref(), ctx).await {
            Ok(parsed) => parsed,
            Err(e) => {
                notify(on_stage_update, StageKind::Parsing, StageStatus::Failed);
                return self
                    .reply_error(conversation_id, format!("Could not understand the request: {e}"))
                    .await;
            }
        };
        if parsed.intents.is_empty() {
            notify(on_stage_update, StageKind::Parsing, StageStatus::Failed);
            return self
                .reply_error(conversation_id, NO_ACTIONABLE_REQUEST.to_string())
                .await;
        }
        notify(on_stage_update, StageKind::Parsing, StageStatus::Completed);

        // Validating
        let outcomes = self.validate_audited(&parsed.intents, ctx).await;
        if let Some((intent, _)) = parsed
            .intents
            .iter()
            .zip(&outcomes)
            .find(|(_, outcome)| outcome.is_unknown_intent())
        {
            notify(on_stage_update, StageKind::Validating, StageStatus::Failed);
            return self
                .reply_error(
                    conversation_id,
                    format!("'{}' is not a supported request", intent.intent),
                )
                .await;
        }
        let missing_fields: Vec<MissingFields> = parsed
            .intents
            .iter()
            .zip(&outcomes)
            .filter_map(|(intent, outcome)| {
                let fields = outcome.missing_fields.clone().unwrap_or_default();
                (!fields.is_empty()).then(|| MissingFields {
                    intent: intent.intent.clone(),
                    fields,
                })
            })
            .collect();
        if !missing_fields.is_empty() {
            notify(on_stage_update, StageKind::Validating, StageStatus::Failed);
            let asks: Vec<String> = missing_fields
                .iter()
                .map(|m| format!("{} needs {}", m.intent, m.fields.join(", ")))
                .collect();
            let reply = format!("I need a bit more information: {}.", asks.join("; "));
            return self
                .reply_clarification(conversation_id, reply, missing_fields, Vec::new())
                .await;
        }
        notify(on_stage_update, StageKind::Validating, StageStatus::Completed);

        // Resolving
        let started = Instant::now();
        let mut items: Vec<ResolvedIntent> = Vec::with_capacity(parsed.intents.len());
        for intent in parsed.intents {
            items.push(self.resolver.resolve(intent).await);
        }
        self.audit_resolution(&items, ctx, elapsed_ms(started)).await;
        self.remember_entities(conversation_id, &items).await?;

        let ambiguities: Vec<ResolvedEntity> = items
            .iter()
            .flat_map(|item| item.unresolved().cloned())
            .collect();
        if !ambiguities.is_empty() {
            notify(on_stage_update, StageKind::Resolving, StageStatus::Failed);
            let reply = resolution_blocker(&items)
                .unwrap_or_else(|| "Some references could not be resolved".to_string());
            return self
                .reply_clarification(conversation_id, reply, Vec::new(), ambiguities)
                .await;
        }
        notify(on_stage_update, StageKind::Resolving, StageStatus::Completed);

        // Planning
        let stored = self.plan_audited(&items, None, ctx, req.user_id).await?;
        notify(on_stage_update, StageKind::Planning, StageStatus::Completed);

        if stored.plan.requires_approval {
            self.append_reply(
                conversation_id,
                format!("{} Approve the plan to continue.", stored.plan.summary),
                json!({ "plan_id": stored.id, "requires_approval": true }),
            )
            .await?;
            return Ok(ProcessOutcome::PlanPending {
                conversation_id,
                plan: stored,
            });
        }

        // Executing
        notify(on_stage_update, StageKind::Executing, StageStatus::Running);
        let (executed, result) = self.execute_stored(&stored, ctx).await?;
        let status = if result.overall_success {
            StageStatus::Completed
        } else {
            StageStatus::Failed
        };
        notify(on_stage_update, StageKind::Executing, status);

        self.append_reply(
            conversation_id,
            result.summary(),
            json!({ "plan_id": executed.id, "overall_success": result.overall_success }),
        )
        .await?;
        Ok(ProcessOutcome::Executed {
            conversation_id,
            plan: executed,
            result,
        })
    }

    /// The requested conversation, or a fresh one titled after `message`.
    async fn open_conversation(
        &self,
        req: &ProcessMessage,
        message: &str,
    ) -> Result<Conversation, OrchestratorError> {
        match req.conversation_id {
            Some(id) => self.find_owned_conversation(id, req.user_id).await,
            None => {
                let title: String = message.chars().take(TITLE_MAX_CHARS).collect();
                Ok(self
                    .stores
                    .conversations
                    .create_conversation(req.user_id, Some(title))
                    .await?)
            }
        }
    }

    /// Replace the conversation's focus with the line items just resolved.
    /// Turns that resolved nothing leave the previous focus in place.
    async fn remember_entities(
        &self,
        conversation_id: EntityId,
        items: &[ResolvedIntent],
    ) -> Result<(), OrchestratorError> {
        let entities: Vec<NewActiveEntity> = items
            .iter()
            .flat_map(|item| &item.resolved_entities)
            .filter(|e| e.confidence.is_usable())
            .map(|e| NewActiveEntity {
                entity_type: PO_ITEM_ENTITY.to_string(),
                entity_id: e.resolved.clone(),
                label: Some(e.label.clone()),
            })
            .collect();
        if entities.is_empty() {
            return Ok(());
        }
        self.stores
            .conversations
            .replace_active_entities(conversation_id, entities)
            .await?;
        Ok(())
    }

    async fn append_reply(
        &self,
        conversation_id: EntityId,
        content: String,
        metadata: serde_json::Value,
    ) -> Result<(), OrchestratorError> {
        self.stores
            .conversations
            .append_message(conversation_id, NewMessage::assistant(content, Some(metadata)))
            .await?;
        Ok(())
    }

    async fn reply_error(
        &self,
        conversation_id: EntityId,
        message: String,
    ) -> Result<ProcessOutcome, OrchestratorError> {
        self.append_reply(conversation_id, message.clone(), json!({ "kind": "error" }))
            .await?;
        Ok(ProcessOutcome::Error {
            conversation_id,
            message,
        })
    }

    async fn reply_clarification(
        &self,
        conversation_id: EntityId,
        message: String,
        missing_fields: Vec<MissingFields>,
        ambiguities: Vec<ResolvedEntity>,
    ) -> Result<ProcessOutcome, OrchestratorError> {
        self.append_reply(
            conversation_id,
            message.clone(),
            json!({ "kind": "clarification" }),
        )
        .await?;
        Ok(ProcessOutcome::Clarification {
            conversation_id,
            message,
            missing_fields,
            ambiguities,
        })
    }
}
