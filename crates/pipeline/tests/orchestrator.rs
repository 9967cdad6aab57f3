//! End-to-end runs against the in-memory store with scripted collaborators.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use opsagent_core::catalog::IntentCatalog;
use opsagent_core::intent::{Confidence, ParsedIntent};
use opsagent_core::plan::{ActionOutcome, PlanStatus};
use opsagent_core::run::{
    CostEstimate, RunMode, RunStatus, RunWithStages, StageKind, StageStatus, StartRun,
};
use opsagent_db::models::audit::{AuditEntry, AuditPage, AuditQuery, CreateAuditEntry};
use opsagent_db::models::run::UpdatePipelineRun;
use opsagent_db::{
    AuditStore, ConversationStore, MemoryStore, PlanStore, RunStore, StoreError, StoreResult,
    Stores,
};
use opsagent_events::{RunEvent, RunEventBus};
use opsagent_pipeline::orchestrator::{PlanningOutput, INTERRUPTED_DURING_EXECUTION, PLAN_REJECTED};
use opsagent_pipeline::{
    ActionBackend, AgentOrchestrator, BackendError, BackendResult, ConversationContext,
    LineItemCandidate, OrchestratorConfig, OrchestratorError, ParseOutput, Parser, ParserError,
    ProcessMessage, ProcessOutcome, RecoverySweep, StageCallback,
};
use serde_json::{json, Value};

// ---------------------------------------------------------------------------
// Scripted collaborators
// ---------------------------------------------------------------------------

/// Answers each known input with a fixed set of intents.
#[derive(Default)]
struct ScriptedParser {
    scripts: HashMap<String, Result<Vec<ParsedIntent>, String>>,
    /// History length seen on each call.
    history_seen: Mutex<Vec<usize>>,
}

impl ScriptedParser {
    fn on(mut self, input: &str, intents: Vec<ParsedIntent>) -> Self {
        self.scripts.insert(input.to_string(), Ok(intents));
        self
    }

    fn failing(mut self, input: &str, error: &str) -> Self {
        self.scripts.insert(input.to_string(), Err(error.to_string()));
        self
    }
}

#[async_trait]
impl Parser for ScriptedParser {
    async fn parse(
        &self,
        message: &str,
        context: Option<&ConversationContext>,
    ) -> Result<ParseOutput, ParserError> {
        self.history_seen
            .lock()
            .unwrap()
            .push(context.map_or(0, |c| c.history.len()));
        match self.scripts.get(message) {
            Some(Ok(intents)) => Ok(ParseOutput {
                intents: intents.clone(),
                unhandled_content: None,
                usage: Some(CostEstimate {
                    input_tokens: 1200,
                    output_tokens: 85,
                    cost_usd: 0.004_321,
                    model: Some("scripted".into()),
                }),
            }),
            Some(Err(error)) => Err(ParserError::Provider(error.clone())),
            None => Ok(ParseOutput::default()),
        }
    }
}

/// Purchase order 45001 with two fork line items. Mutations fail when
/// `fail_mutations` is set.
#[derive(Default)]
struct FakeBackend {
    calls: Mutex<Vec<String>>,
    fail_mutations: bool,
}

impl FakeBackend {
    fn record(&self, op: &str, path: &str) -> BackendResult<Value> {
        self.calls.lock().unwrap().push(format!("{op} {path}"));
        if self.fail_mutations && !matches!(op, "get" | "list") {
            return Err(BackendError::new(
                Some(409),
                "PO_RELEASED",
                "Purchase order is released and locked",
            ));
        }
        Ok(json!({ "path": path }))
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ActionBackend for FakeBackend {
    async fn get(&self, path: &str) -> BackendResult<Value> {
        self.record("get", path)
    }
    async fn list(&self, path: &str) -> BackendResult<Value> {
        self.record("list", path)
    }
    async fn create(&self, path: &str, _body: &Value) -> BackendResult<Value> {
        self.record("create", path)
    }
    async fn update(&self, path: &str, _body: &Value) -> BackendResult<Value> {
        self.record("update", path)
    }
    async fn delete(&self, path: &str) -> BackendResult<Value> {
        self.record("delete", path)
    }
    async fn list_po_items(&self, _po_id: &str) -> BackendResult<Vec<LineItemCandidate>> {
        Ok(vec![
            LineItemCandidate {
                id: "00010".into(),
                label: "Steel Forks".into(),
                secondary_key: None,
            },
            LineItemCandidate {
                id: "00020".into(),
                label: "Plastic Forks".into(),
                secondary_key: None,
            },
        ])
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

const SHOW_PO: &str = "show me purchase order 45001";
const DELETE_ITEM: &str = "delete item 10 from 45001";
const DELETE_FORKS: &str = "delete the forks from 45001";
const RAISE_QTY: &str = "set item 10 on 45001 to 12 pieces";

fn script() -> ScriptedParser {
    ScriptedParser::default()
        .on(
            SHOW_PO,
            vec![ParsedIntent::new("get_purchase_order", 0.95).with_field("poId", "45001")],
        )
        .on(
            DELETE_ITEM,
            vec![ParsedIntent::new("delete_po_item", 0.9)
                .with_field("poId", "45001")
                .with_field("item", "10")],
        )
        .on(
            DELETE_FORKS,
            vec![ParsedIntent::new("delete_po_item", 0.9)
                .with_field("poId", "45001")
                .with_field("item", "forks")],
        )
        .on(
            RAISE_QTY,
            vec![ParsedIntent::new("update_po_item", 0.9)
                .with_field("poId", "45001")
                .with_field("item", "10")
                .with_field("quantity", 12)],
        )
        .on(
            "update something",
            vec![ParsedIntent::new("update_po_item", 0.6).with_field("quantity", 3)],
        )
        .failing("provider down", "upstream timeout")
}

struct Harness {
    orchestrator: Arc<AgentOrchestrator>,
    store: Arc<MemoryStore>,
    backend: Arc<FakeBackend>,
    parser: Arc<ScriptedParser>,
}

fn orchestrator_over(
    stores: Stores,
    parser: Arc<dyn Parser>,
    backend: Arc<dyn ActionBackend>,
    config: OrchestratorConfig,
) -> Arc<AgentOrchestrator> {
    Arc::new(AgentOrchestrator::new(
        stores,
        parser,
        backend,
        Arc::new(IntentCatalog::purchase_orders()),
        RunEventBus::new(),
        config,
    ))
}

fn harness_configured(backend: FakeBackend, config: OrchestratorConfig) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let backend = Arc::new(backend);
    let parser = Arc::new(script());
    let orchestrator = orchestrator_over(
        Stores::from_shared(store.clone()),
        parser.clone(),
        backend.clone(),
        config,
    );
    Harness {
        orchestrator,
        store,
        backend,
        parser,
    }
}

fn harness_with(backend: FakeBackend) -> Harness {
    harness_configured(backend, OrchestratorConfig::default())
}

fn harness() -> Harness {
    harness_with(FakeBackend::default())
}

fn stage_status(run: &RunWithStages, kind: StageKind) -> StageStatus {
    run.stage(kind).unwrap().status
}

fn planned_plan_id(run: &RunWithStages) -> opsagent_core::types::EntityId {
    let output = run.stage(StageKind::Planning).unwrap().output.clone().unwrap();
    serde_json::from_value::<PlanningOutput>(output).unwrap().plan.id
}

// ---------------------------------------------------------------------------
// Durable runs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn auto_run_drives_through_to_completed() {
    let h = harness();
    let run = h
        .orchestrator
        .start_run(StartRun::new(SHOW_PO, RunMode::Auto))
        .await
        .unwrap();

    assert_eq!(run.run.status, RunStatus::Completed);
    assert!(run.run.current_stage.is_none());
    assert!(run.run.completed_at.is_some());
    assert!(run.stages.iter().all(|s| s.status == StageStatus::Completed));
    assert_eq!(run.run.result.as_ref().unwrap()["overall_success"], true);
    assert_eq!(h.backend.calls(), vec!["get /purchase-orders/45001"]);

    let parsing = run.stage(StageKind::Parsing).unwrap();
    assert_eq!(parsing.cost_estimate.as_ref().unwrap().cost_usd, 0.004_321);
    let validating = run.stage(StageKind::Validating).unwrap();
    assert_eq!(validating.input, parsing.output);
}

#[tokio::test]
async fn step_run_pauses_after_every_stage() {
    let h = harness();
    let run = h
        .orchestrator
        .start_run(StartRun::new(SHOW_PO, RunMode::Step))
        .await
        .unwrap();
    assert_eq!(run.run.status, RunStatus::PausedAt(StageKind::Parsing));
    assert_eq!(stage_status(&run, StageKind::Validating), StageStatus::Pending);
    let run_id = run.run.id;

    for paused in [
        StageKind::Validating,
        StageKind::Resolving,
        StageKind::Planning,
    ] {
        let run = h.orchestrator.continue_run(run_id, None).await.unwrap();
        assert_eq!(run.run.status, RunStatus::PausedAt(paused));
        assert!(h.backend.calls().is_empty());
    }

    let run = h.orchestrator.continue_run(run_id, None).await.unwrap();
    assert_eq!(run.run.status, RunStatus::Completed);
    assert_eq!(h.backend.calls().len(), 1);

    let err = h.orchestrator.continue_run(run_id, None).await.unwrap_err();
    assert_matches!(err, OrchestratorError::InvalidState(_));
}

#[tokio::test]
async fn destructive_plan_waits_for_approval_then_executes() {
    let h = harness();
    let run = h
        .orchestrator
        .start_run(StartRun::new(DELETE_ITEM, RunMode::Auto))
        .await
        .unwrap();

    assert_eq!(run.run.status, RunStatus::AwaitingApproval);
    assert_eq!(run.run.current_stage, Some(StageKind::Executing));
    assert_eq!(stage_status(&run, StageKind::Planning), StageStatus::Completed);
    assert!(h.backend.calls().is_empty());

    let run = h
        .orchestrator
        .approve_run(run.run.id, true, None)
        .await
        .unwrap();
    assert_eq!(run.run.status, RunStatus::Completed);
    assert_eq!(
        h.backend.calls(),
        vec!["delete /purchase-orders/45001/items/00010"]
    );

    let plan = h.store.find_plan(planned_plan_id(&run)).await.unwrap().unwrap();
    assert_eq!(plan.status, PlanStatus::Executed);
    assert_eq!(plan.run_id, Some(run.run.id));
    assert!(plan.result.unwrap().overall_success);
}

#[tokio::test]
async fn rejected_plan_fails_the_run_without_backend_calls() {
    let h = harness();
    let run = h
        .orchestrator
        .start_run(StartRun::new(DELETE_ITEM, RunMode::Step))
        .await
        .unwrap();
    let run_id = run.run.id;
    // Step mode still stops for approval rather than pausing after planning.
    for _ in 0..3 {
        h.orchestrator.continue_run(run_id, None).await.unwrap();
    }
    let run = h.orchestrator.get_run(run_id, None).await.unwrap();
    assert_eq!(run.run.status, RunStatus::AwaitingApproval);

    let run = h
        .orchestrator
        .approve_run(run_id, false, None)
        .await
        .unwrap();
    assert_eq!(run.run.status, RunStatus::Failed);
    assert_eq!(run.run.error.as_deref(), Some(PLAN_REJECTED));
    assert_eq!(stage_status(&run, StageKind::Executing), StageStatus::Skipped);
    assert!(h.backend.calls().is_empty());

    let plan = h.store.find_plan(planned_plan_id(&run)).await.unwrap().unwrap();
    assert_eq!(plan.status, PlanStatus::Rejected);

    let err = h
        .orchestrator
        .approve_run(run_id, true, None)
        .await
        .unwrap_err();
    assert_matches!(err, OrchestratorError::InvalidState(_));
}

#[tokio::test]
async fn empty_parse_fails_the_run() {
    let h = harness();
    let run = h
        .orchestrator
        .start_run(StartRun::new("hello there", RunMode::Auto))
        .await
        .unwrap();

    assert_eq!(run.run.status, RunStatus::Failed);
    assert!(run.run.result.is_none());
    assert_eq!(stage_status(&run, StageKind::Parsing), StageStatus::Failed);
    assert_eq!(stage_status(&run, StageKind::Validating), StageStatus::Pending);
    assert!(run.run.error.unwrap().contains("No actionable request"));
}

#[tokio::test]
async fn parser_outage_fails_the_parsing_stage() {
    let h = harness();
    let run = h
        .orchestrator
        .start_run(StartRun::new("provider down", RunMode::Auto))
        .await
        .unwrap();

    assert_eq!(run.run.status, RunStatus::Failed);
    let parsing = run.stage(StageKind::Parsing).unwrap();
    assert_eq!(parsing.status, StageStatus::Failed);
    assert!(parsing.error.as_deref().unwrap().contains("upstream timeout"));
}

#[tokio::test]
async fn missing_fields_block_at_validation() {
    let h = harness();
    let run = h
        .orchestrator
        .start_run(StartRun::new("update something", RunMode::Auto))
        .await
        .unwrap();

    assert_eq!(run.run.status, RunStatus::Failed);
    assert_eq!(stage_status(&run, StageKind::Validating), StageStatus::Failed);
    let error = run.run.error.unwrap();
    assert!(error.contains("poId"));
    assert!(error.contains("item"));
}

#[tokio::test]
async fn ambiguous_reference_blocks_at_resolution() {
    let h = harness();
    let run = h
        .orchestrator
        .start_run(StartRun::new(DELETE_FORKS, RunMode::Auto))
        .await
        .unwrap();

    assert_eq!(run.run.status, RunStatus::Failed);
    let resolving = run.stage(StageKind::Resolving).unwrap();
    assert_eq!(resolving.status, StageStatus::Failed);
    assert!(resolving
        .error
        .as_deref()
        .unwrap()
        .contains("Steel Forks, Plastic Forks"));
    assert_eq!(resolving.progress_items.len(), 1);
    assert!(h.backend.calls().is_empty());
}

#[tokio::test]
async fn failed_execution_keeps_result_on_stage_only() {
    let h = harness_with(FakeBackend {
        fail_mutations: true,
        ..Default::default()
    });
    let run = h
        .orchestrator
        .start_run(StartRun::new(DELETE_ITEM, RunMode::Auto))
        .await
        .unwrap();
    let run = h
        .orchestrator
        .approve_run(run.run.id, true, None)
        .await
        .unwrap();

    assert_eq!(run.run.status, RunStatus::Failed);
    assert!(run.run.result.is_none());
    assert_eq!(run.run.error.as_deref(), Some("1 of 1 actions failed"));
    let executing = run.stage(StageKind::Executing).unwrap();
    assert_eq!(executing.status, StageStatus::Failed);
    assert_eq!(
        executing.output.as_ref().unwrap()["results"][0]["error"]["code"],
        "PO_RELEASED"
    );

    let plan = h.store.find_plan(planned_plan_id(&run)).await.unwrap().unwrap();
    assert_eq!(plan.status, PlanStatus::Failed);
}

#[tokio::test]
async fn viewers_see_stage_updates_then_one_completion() {
    let h = harness();
    let created = h
        .orchestrator
        .create_run(StartRun::new(SHOW_PO, RunMode::Auto))
        .await
        .unwrap();
    let (snapshot, mut sub) = h
        .orchestrator
        .watch_run(created.run.id, None)
        .await
        .unwrap();
    assert_eq!(snapshot.run.status, RunStatus::Running);

    h.orchestrator.drive_run(created.run.id).await.unwrap();

    let mut events = Vec::new();
    while let Some(event) = sub.next_event_within(Duration::from_millis(50)).await {
        events.push(event);
    }
    assert_matches!(
        events.first(),
        Some(RunEvent::StageUpdate(e)) if e.stage == StageKind::Parsing && e.status == StageStatus::Running
    );
    assert_matches!(
        events.last(),
        Some(RunEvent::RunComplete(e)) if e.status == RunStatus::Completed
    );
    let completions = events
        .iter()
        .filter(|e| matches!(e, RunEvent::RunComplete(_)))
        .count();
    assert_eq!(completions, 1);
    assert_eq!(h.orchestrator.events().subscriber_count(created.run.id), 0);
}

#[tokio::test]
async fn idle_viewer_stream_ends_after_the_configured_timeout() {
    let h = harness_configured(
        FakeBackend::default(),
        OrchestratorConfig {
            viewer_idle_timeout: Duration::from_millis(30),
            ..OrchestratorConfig::default()
        },
    );
    let created = h
        .orchestrator
        .create_run(StartRun::new(SHOW_PO, RunMode::Auto))
        .await
        .unwrap();
    let (_, mut sub) = h
        .orchestrator
        .watch_run(created.run.id, None)
        .await
        .unwrap();
    assert_eq!(h.orchestrator.events().subscriber_count(created.run.id), 1);

    // Nobody drives the run, so the viewer sees nothing and gives up.
    let ended = tokio::time::timeout(Duration::from_secs(1), sub.next_event()).await;
    assert_matches!(ended, Ok(None));
    assert_eq!(h.orchestrator.events().subscriber_count(created.run.id), 0);
}

#[tokio::test]
async fn watching_a_finished_run_ends_the_stream_at_once() {
    let h = harness();
    let run = h
        .orchestrator
        .start_run(StartRun::new(SHOW_PO, RunMode::Auto))
        .await
        .unwrap();
    assert_eq!(run.run.status, RunStatus::Completed);

    let (snapshot, mut sub) = h.orchestrator.watch_run(run.run.id, None).await.unwrap();
    assert_eq!(snapshot.run.status, RunStatus::Completed);
    assert_eq!(h.orchestrator.events().subscriber_count(run.run.id), 0);

    let ended = tokio::time::timeout(Duration::from_secs(1), sub.next_event()).await;
    assert_matches!(ended, Ok(None));
}

#[tokio::test]
async fn detached_start_finishes_in_the_background() {
    let h = harness();
    let created = h
        .orchestrator
        .start_run_detached(StartRun::new(SHOW_PO, RunMode::Auto))
        .await
        .unwrap();

    let mut status = created.run.status;
    for _ in 0..50 {
        status = h
            .orchestrator
            .get_run(created.run.id, None)
            .await
            .unwrap()
            .run
            .status;
        if status.is_terminal() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(status, RunStatus::Completed);
}

#[tokio::test]
async fn runs_of_other_users_read_as_missing() {
    let h = harness();
    let mut req = StartRun::new(SHOW_PO, RunMode::Step);
    req.user_id = Some(7);
    let run = h.orchestrator.start_run(req).await.unwrap();

    assert!(h.orchestrator.get_run(run.run.id, Some(7)).await.is_ok());
    let err = h
        .orchestrator
        .get_run(run.run.id, Some(8))
        .await
        .unwrap_err();
    assert_matches!(err, OrchestratorError::NotFound { .. });
    let err = h
        .orchestrator
        .continue_run(run.run.id, Some(8))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "NOT_FOUND");
}

#[tokio::test]
async fn runs_cannot_use_another_users_conversation() {
    let h = harness();
    let first = h
        .orchestrator
        .process_message(
            ProcessMessage {
                message: RAISE_QTY.into(),
                conversation_id: None,
                user_id: Some(1),
            },
            None,
        )
        .await
        .unwrap();
    let conversation_id = first.conversation_id();

    let mut req = StartRun::new(SHOW_PO, RunMode::Auto);
    req.conversation_id = Some(conversation_id);
    req.user_id = Some(2);
    let err = h.orchestrator.start_run(req.clone()).await.unwrap_err();
    assert_matches!(err, OrchestratorError::NotFound { .. });

    req.user_id = None;
    let err = h.orchestrator.start_run(req.clone()).await.unwrap_err();
    assert_matches!(err, OrchestratorError::NotFound { .. });

    // Nothing was persisted and the parser never saw the owner's history.
    assert!(h
        .orchestrator
        .list_runs(&Default::default())
        .await
        .unwrap()
        .is_empty());
    assert_eq!(*h.parser.history_seen.lock().unwrap(), vec![0]);

    req.user_id = Some(1);
    let run = h.orchestrator.start_run(req).await.unwrap();
    assert_eq!(run.run.status, RunStatus::Completed);
}

#[tokio::test]
async fn overlong_input_is_rejected_before_persisting() {
    let h = harness();
    let err = h
        .orchestrator
        .start_run(StartRun::new("x".repeat(10_001), RunMode::Auto))
        .await
        .unwrap_err();
    assert_matches!(err, OrchestratorError::Validation(_));
    assert!(h
        .orchestrator
        .list_runs(&Default::default())
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn every_phase_is_audited() {
    let h = harness();
    let run = h
        .orchestrator
        .start_run(StartRun::new(DELETE_ITEM, RunMode::Auto))
        .await
        .unwrap();
    h.orchestrator
        .approve_run(run.run.id, true, None)
        .await
        .unwrap();

    let page = h
        .store
        .query_audit(&AuditQuery {
            run_id: Some(run.run.id),
            ..Default::default()
        })
        .await
        .unwrap();
    let mut phases: Vec<&str> = page.items.iter().rev().map(|e| e.phase.as_str()).collect();
    phases.dedup();
    assert_eq!(
        phases,
        vec!["parse", "validate", "resolve", "plan", "approve", "execute"]
    );
    let parse = page.items.last().unwrap();
    assert_eq!(parse.input_tokens, Some(1200));
}

/// Rejects every write, as a full or read-only audit table would.
struct FailingAudit;

#[async_trait]
impl AuditStore for FailingAudit {
    async fn insert_audit(&self, _entry: CreateAuditEntry) -> StoreResult<AuditEntry> {
        Err(StoreError::Conflict("audit_log is read-only".into()))
    }

    async fn query_audit(&self, _query: &AuditQuery) -> StoreResult<AuditPage> {
        Ok(AuditPage {
            items: Vec::new(),
            total: 0,
        })
    }
}

#[tokio::test]
async fn audit_write_failures_do_not_change_the_outcome() {
    let store = Arc::new(MemoryStore::new());
    let backend = Arc::new(FakeBackend::default());
    let orchestrator = orchestrator_over(
        Stores {
            audit: Arc::new(FailingAudit),
            ..Stores::from_shared(store.clone())
        },
        Arc::new(script()),
        backend.clone(),
        OrchestratorConfig::default(),
    );

    let run = orchestrator
        .start_run(StartRun::new(SHOW_PO, RunMode::Auto))
        .await
        .unwrap();
    assert_eq!(run.run.status, RunStatus::Completed);
    assert!(run.stages.iter().all(|s| s.status == StageStatus::Completed));
    let result = run.run.result.as_ref().unwrap();
    assert_eq!(result["overall_success"], true);
    assert_eq!(result["results"][0]["outcome"], "succeeded");

    let outcome = orchestrator
        .process_message(
            ProcessMessage {
                message: SHOW_PO.into(),
                conversation_id: None,
                user_id: None,
            },
            None,
        )
        .await
        .unwrap();
    assert_matches!(&outcome, ProcessOutcome::Executed { result, plan, .. } => {
        assert!(result.overall_success);
        assert_eq!(result.results[0].outcome, ActionOutcome::Succeeded);
        assert_eq!(plan.status, PlanStatus::Executed);
    });
    assert_eq!(backend.calls().len(), 2);
}

// ---------------------------------------------------------------------------
// One-shot surfaces
// ---------------------------------------------------------------------------

#[tokio::test]
async fn read_message_executes_immediately() {
    let h = harness();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let callback = move |stage: StageKind, status: StageStatus| {
        sink.lock().unwrap().push((stage, status));
    };

    let outcome = h
        .orchestrator
        .process_message(
            ProcessMessage {
                message: SHOW_PO.into(),
                conversation_id: None,
                user_id: Some(3),
            },
            Some(&callback as &StageCallback),
        )
        .await
        .unwrap();

    assert_matches!(&outcome, ProcessOutcome::Executed { result, plan, .. } => {
        assert!(result.overall_success);
        assert_eq!(result.results[0].outcome, ActionOutcome::Succeeded);
        assert_eq!(plan.status, PlanStatus::Executed);
        assert!(plan.run_id.is_none());
    });
    assert_eq!(
        seen.lock().unwrap().last(),
        Some(&(StageKind::Executing, StageStatus::Completed))
    );

    let messages = h
        .store
        .recent_messages(outcome.conversation_id(), 10)
        .await
        .unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].content, SHOW_PO);
}

#[tokio::test]
async fn write_message_stops_at_pending_plan_then_executes_on_approval() {
    let h = harness();
    let outcome = h
        .orchestrator
        .process_message(
            ProcessMessage {
                message: RAISE_QTY.into(),
                conversation_id: None,
                user_id: Some(3),
            },
            None,
        )
        .await
        .unwrap();
    let plan = assert_matches!(outcome, ProcessOutcome::PlanPending { plan, .. } => plan);
    assert_eq!(plan.status, PlanStatus::Pending);
    assert!(h.backend.calls().is_empty());

    let err = h
        .orchestrator
        .execute_plan(plan.id, true, Some(4))
        .await
        .unwrap_err();
    assert_matches!(err, OrchestratorError::Forbidden(_));

    let executed = h
        .orchestrator
        .execute_plan(plan.id, true, Some(3))
        .await
        .unwrap();
    assert_eq!(executed.status, PlanStatus::Executed);
    assert_eq!(
        h.backend.calls(),
        vec!["update /purchase-orders/45001/items/00010"]
    );

    let err = h
        .orchestrator
        .execute_plan(plan.id, true, Some(3))
        .await
        .unwrap_err();
    assert_matches!(err, OrchestratorError::InvalidState(msg) if msg.contains("not pending"));
}

#[tokio::test]
async fn rejected_one_shot_plan_is_never_executed() {
    let h = harness();
    let outcome = h
        .orchestrator
        .process_message(
            ProcessMessage {
                message: DELETE_ITEM.into(),
                conversation_id: None,
                user_id: None,
            },
            None,
        )
        .await
        .unwrap();
    let plan = assert_matches!(outcome, ProcessOutcome::PlanPending { plan, .. } => plan);

    let rejected = h
        .orchestrator
        .execute_plan(plan.id, false, None)
        .await
        .unwrap();
    assert_eq!(rejected.status, PlanStatus::Rejected);
    assert!(rejected.result.is_none());
    assert!(h.backend.calls().is_empty());
}

#[tokio::test]
async fn unknown_plan_is_not_found() {
    let h = harness();
    let err = h
        .orchestrator
        .execute_plan(opsagent_core::types::new_id(), true, None)
        .await
        .unwrap_err();
    assert_matches!(err, OrchestratorError::NotFound { .. });
}

#[tokio::test]
async fn run_plans_cannot_be_executed_one_shot() {
    let h = harness();
    let run = h
        .orchestrator
        .start_run(StartRun::new(DELETE_ITEM, RunMode::Auto))
        .await
        .unwrap();
    let err = h
        .orchestrator
        .execute_plan(planned_plan_id(&run), true, None)
        .await
        .unwrap_err();
    assert_matches!(err, OrchestratorError::InvalidState(_));
}

#[tokio::test]
async fn incomplete_or_ambiguous_messages_ask_for_clarification() {
    let h = harness();
    let outcome = h
        .orchestrator
        .process_message(
            ProcessMessage {
                message: "update something".into(),
                conversation_id: None,
                user_id: None,
            },
            None,
        )
        .await
        .unwrap();
    assert_matches!(&outcome, ProcessOutcome::Clarification { missing_fields, .. } => {
        assert_eq!(missing_fields[0].intent, "update_po_item");
        assert_eq!(missing_fields[0].fields, vec!["poId", "item"]);
    });

    let outcome = h
        .orchestrator
        .process_message(
            ProcessMessage {
                message: DELETE_FORKS.into(),
                conversation_id: Some(outcome.conversation_id()),
                user_id: None,
            },
            None,
        )
        .await
        .unwrap();
    assert_matches!(&outcome, ProcessOutcome::Clarification { ambiguities, .. } => {
        assert_eq!(ambiguities[0].confidence, Confidence::Ambiguous);
        assert_eq!(ambiguities[0].candidates.as_ref().unwrap().len(), 2);
    });
    assert!(h.backend.calls().is_empty());
}

#[tokio::test]
async fn conversation_history_and_entities_carry_over() {
    let h = harness();
    let first = h
        .orchestrator
        .process_message(
            ProcessMessage {
                message: RAISE_QTY.into(),
                conversation_id: None,
                user_id: None,
            },
            None,
        )
        .await
        .unwrap();
    let conversation_id = first.conversation_id();

    let entities = h.store.active_entities(conversation_id).await.unwrap();
    assert_eq!(entities.len(), 1);
    assert_eq!(entities[0].entity_id, "00010");

    h.orchestrator
        .process_message(
            ProcessMessage {
                message: SHOW_PO.into(),
                conversation_id: Some(conversation_id),
                user_id: None,
            },
            None,
        )
        .await
        .unwrap();

    // First turn saw no history; the second saw the first exchange.
    assert_eq!(*h.parser.history_seen.lock().unwrap(), vec![0, 2]);
}

#[tokio::test]
async fn unknown_conversation_and_parser_errors() {
    let h = harness();
    let err = h
        .orchestrator
        .process_message(
            ProcessMessage {
                message: SHOW_PO.into(),
                conversation_id: Some(opsagent_core::types::new_id()),
                user_id: None,
            },
            None,
        )
        .await
        .unwrap_err();
    assert_matches!(err, OrchestratorError::NotFound { .. });

    let outcome = h
        .orchestrator
        .process_message(
            ProcessMessage {
                message: "provider down".into(),
                conversation_id: None,
                user_id: None,
            },
            None,
        )
        .await
        .unwrap();
    assert_matches!(outcome, ProcessOutcome::Error { message, .. } if message.contains("upstream timeout"));
}

// ---------------------------------------------------------------------------
// Recovery
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sweep_redrives_early_stages_and_fails_interrupted_execution() {
    let h = harness();

    let orphan = h
        .orchestrator
        .create_run(StartRun::new(SHOW_PO, RunMode::Auto))
        .await
        .unwrap();
    let executing = h
        .orchestrator
        .create_run(StartRun::new(SHOW_PO, RunMode::Auto))
        .await
        .unwrap();
    h.store
        .update_run(
            executing.run.id,
            &UpdatePipelineRun::status(RunStatus::Running).with_stage(Some(StageKind::Executing)),
        )
        .await
        .unwrap();
    let paused = h
        .orchestrator
        .start_run(StartRun::new(SHOW_PO, RunMode::Step))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    let report = RecoverySweep::new(h.orchestrator.clone())
        .with_stale_after(Duration::ZERO)
        .sweep_once()
        .await
        .unwrap();
    assert_eq!(report.redriven, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.untouched, 1);

    let orphan = h.orchestrator.get_run(orphan.run.id, None).await.unwrap();
    assert_eq!(orphan.run.status, RunStatus::Completed);

    let executing = h.orchestrator.get_run(executing.run.id, None).await.unwrap();
    assert_eq!(executing.run.status, RunStatus::Failed);
    assert_eq!(
        executing.run.error.as_deref(),
        Some(INTERRUPTED_DURING_EXECUTION)
    );

    let paused = h.orchestrator.get_run(paused.run.id, None).await.unwrap();
    assert_eq!(paused.run.status, RunStatus::PausedAt(StageKind::Parsing));

    // Only the re-driven orphan reached the backend.
    assert_eq!(h.backend.calls().len(), 1);
}

/// Parks every parse until two are in flight at once.
struct RendezvousParser {
    barrier: tokio::sync::Barrier,
    inner: ScriptedParser,
}

#[async_trait]
impl Parser for RendezvousParser {
    async fn parse(
        &self,
        message: &str,
        context: Option<&ConversationContext>,
    ) -> Result<ParseOutput, ParserError> {
        self.barrier.wait().await;
        self.inner.parse(message, context).await
    }
}

#[tokio::test]
async fn sweep_recovers_stale_runs_concurrently() {
    let store = Arc::new(MemoryStore::new());
    let orchestrator = orchestrator_over(
        Stores::from_shared(store.clone()),
        Arc::new(RendezvousParser {
            barrier: tokio::sync::Barrier::new(2),
            inner: script(),
        }),
        Arc::new(FakeBackend::default()),
        OrchestratorConfig::default(),
    );
    let mut ids = Vec::new();
    for _ in 0..2 {
        let created = orchestrator
            .create_run(StartRun::new(SHOW_PO, RunMode::Auto))
            .await
            .unwrap();
        ids.push(created.run.id);
    }
    tokio::time::sleep(Duration::from_millis(5)).await;

    // One run at a time would leave the first parse waiting forever.
    let sweep = RecoverySweep::new(orchestrator.clone()).with_stale_after(Duration::ZERO);
    let report = tokio::time::timeout(Duration::from_secs(2), sweep.sweep_once())
        .await
        .expect("stale runs were recovered one at a time")
        .unwrap();
    assert_eq!(report.redriven, 2);
    assert_eq!(report.errors, 0);

    for id in ids {
        let run = orchestrator.get_run(id, None).await.unwrap();
        assert_eq!(run.run.status, RunStatus::Completed);
    }
}
