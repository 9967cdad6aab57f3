//! The run orchestration core.
//!
//! [`AgentOrchestrator`] drives a run through parse, validate, resolve, plan
//! and execute, persisting every transition through the
//! [`Stores`](opsagent_db::Stores) before announcing it on the
//! [`RunEventBus`](opsagent_events::RunEventBus). Text understanding and the
//! downstream business system are injected as [`Parser`] and
//! [`ActionBackend`] implementations.

pub mod audit_logger;
pub mod backend;
pub mod config;
pub mod error;
pub mod executor;
pub mod orchestrator;
pub mod parser;
pub mod recovery;
pub mod resolver;

pub use audit_logger::{AuditContext, AuditLogger, AuditRecord};
pub use backend::{ActionBackend, BackendError, BackendResult, LineItemCandidate};
pub use config::OrchestratorConfig;
pub use error::OrchestratorError;
pub use executor::Executor;
pub use orchestrator::{
    AgentOrchestrator, MissingFields, ProcessMessage, ProcessOutcome, Recovery, StageCallback,
};
pub use parser::{ConversationContext, ParseOutput, Parser, ParserError};
pub use recovery::{RecoverySweep, SweepReport};
pub use resolver::EntityResolver;
