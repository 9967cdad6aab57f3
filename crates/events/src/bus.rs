//! Per-run subscription registry.
//!
//! Each subscriber owns an unbounded channel, so a slow viewer never holds
//! up delivery to the others. Publishing never fails: a send to a closed
//! channel only drops that one listener.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use opsagent_core::run::{ProgressItem, RunStatus, StageKind, StageStatus};
use opsagent_core::types::EntityId;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// A stage changed status or reported progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageUpdateEvent {
    pub run_id: EntityId,
    pub stage: StageKind,
    pub status: StageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub progress_items: Vec<ProgressItem>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl StageUpdateEvent {
    pub fn new(run_id: EntityId, stage: StageKind, status: StageStatus) -> Self {
        Self {
            run_id,
            stage,
            status,
            detail: None,
            progress_items: Vec::new(),
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_progress(mut self, items: Vec<ProgressItem>) -> Self {
        self.progress_items = items;
        self
    }
}

/// The run reached a terminal status. Sent at most once per run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunCompleteEvent {
    pub run_id: EntityId,
    pub status: RunStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    StageUpdate(StageUpdateEvent),
    RunComplete(RunCompleteEvent),
}

impl RunEvent {
    pub fn run_id(&self) -> EntityId {
        match self {
            Self::StageUpdate(e) => e.run_id,
            Self::RunComplete(e) => e.run_id,
        }
    }
}

// ---------------------------------------------------------------------------
// RunEventBus
// ---------------------------------------------------------------------------

struct Listener {
    id: u64,
    sender: mpsc::UnboundedSender<RunEvent>,
}

#[derive(Default)]
struct Registry {
    listeners: Mutex<HashMap<EntityId, Vec<Listener>>>,
    next_id: AtomicU64,
}

/// In-process per-run event fan-out. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct RunEventBus {
    registry: Arc<Registry>,
}

impl RunEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn listeners(&self) -> MutexGuard<'_, HashMap<EntityId, Vec<Listener>>> {
        // A panic while holding the lock leaves the map itself consistent.
        self.registry
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start receiving events for `run_id`. Dropping the subscription
    /// removes only this listener.
    pub fn subscribe(&self, run_id: EntityId) -> RunSubscription {
        let id = self.registry.next_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::unbounded_channel();
        self.listeners()
            .entry(run_id)
            .or_default()
            .push(Listener { id, sender });
        RunSubscription {
            run_id,
            id,
            receiver,
            idle_timeout: None,
            bus: self.clone(),
        }
    }

    fn unsubscribe(&self, run_id: EntityId, id: u64) {
        let mut listeners = self.listeners();
        if let Some(list) = listeners.get_mut(&run_id) {
            list.retain(|l| l.id != id);
            if list.is_empty() {
                listeners.remove(&run_id);
            }
        }
    }

    /// Number of live listeners on `run_id`.
    pub fn subscriber_count(&self, run_id: EntityId) -> usize {
        self.listeners().get(&run_id).map_or(0, Vec::len)
    }

    fn deliver(&self, event: RunEvent) {
        let run_id = event.run_id();
        let mut listeners = self.listeners();
        let Some(list) = listeners.get_mut(&run_id) else {
            return;
        };
        let before = list.len();
        list.retain(|l| l.sender.send(event.clone()).is_ok());
        let dropped = before - list.len();
        if dropped > 0 {
            tracing::debug!(run_id = %run_id, dropped, "Pruned disconnected run listeners");
        }
        if list.is_empty() {
            listeners.remove(&run_id);
        }
    }

    pub fn publish_stage_update(&self, event: StageUpdateEvent) {
        self.deliver(RunEvent::StageUpdate(event));
    }

    /// Deliver the run-complete event, then retire every listener of the run.
    pub fn publish_run_complete(&self, event: RunCompleteEvent) {
        let run_id = event.run_id;
        self.deliver(RunEvent::RunComplete(event));
        self.cleanup_run(run_id);
    }

    /// Remove all listeners for a run whose lifecycle is over. Receivers
    /// drain what was already sent and then see the stream end.
    pub fn cleanup_run(&self, run_id: EntityId) {
        self.listeners().remove(&run_id);
    }
}

// ---------------------------------------------------------------------------
// RunSubscription
// ---------------------------------------------------------------------------

/// One viewer's handle on a run's event stream.
pub struct RunSubscription {
    run_id: EntityId,
    id: u64,
    receiver: mpsc::UnboundedReceiver<RunEvent>,
    idle_timeout: Option<Duration>,
    bus: RunEventBus,
}

impl RunSubscription {
    pub fn run_id(&self) -> EntityId {
        self.run_id
    }

    /// End the stream after `idle` passes with no event.
    pub fn with_idle_timeout(mut self, idle: Duration) -> Self {
        self.idle_timeout = Some(idle);
        self
    }

    /// Stop listening. Events already queued are still returned, after
    /// which the stream ends.
    pub fn close(&mut self) {
        self.receiver.close();
        self.bus.unsubscribe(self.run_id, self.id);
    }

    /// Next event, or `None` once the run's listeners have been retired,
    /// the subscription was closed, or the idle timeout elapsed.
    pub async fn next_event(&mut self) -> Option<RunEvent> {
        let Some(idle) = self.idle_timeout else {
            return self.receiver.recv().await;
        };
        match tokio::time::timeout(idle, self.receiver.recv()).await {
            Ok(event) => event,
            Err(_) => {
                tracing::debug!(run_id = %self.run_id, "Run viewer idle, closing stream");
                self.close();
                None
            }
        }
    }

    /// Like [`next_event`](Self::next_event) but gives up after `idle`
    /// without traffic, so viewers can self-terminate.
    pub async fn next_event_within(&mut self, idle: Duration) -> Option<RunEvent> {
        tokio::time::timeout(idle, self.receiver.recv())
            .await
            .ok()
            .flatten()
    }
}

impl Drop for RunSubscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.run_id, self.id);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use opsagent_core::types::new_id;

    use super::*;

    fn complete(run_id: EntityId) -> RunCompleteEvent {
        RunCompleteEvent {
            run_id,
            status: RunStatus::Completed,
            result: None,
            error: None,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn every_subscriber_of_a_run_receives_updates() {
        let bus = RunEventBus::new();
        let run_id = new_id();
        let mut a = bus.subscribe(run_id);
        let mut b = bus.subscribe(run_id);

        bus.publish_stage_update(StageUpdateEvent::new(
            run_id,
            StageKind::Parsing,
            StageStatus::Running,
        ));

        assert_matches!(a.next_event().await, Some(RunEvent::StageUpdate(e)) if e.stage == StageKind::Parsing);
        assert_matches!(b.next_event().await, Some(RunEvent::StageUpdate(_)));
    }

    #[tokio::test]
    async fn events_are_scoped_to_their_run() {
        let bus = RunEventBus::new();
        let watched = new_id();
        let mut sub = bus.subscribe(watched);

        bus.publish_stage_update(StageUpdateEvent::new(
            new_id(),
            StageKind::Parsing,
            StageStatus::Running,
        ));

        assert!(sub
            .next_event_within(Duration::from_millis(20))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn dropping_one_viewer_keeps_the_others() {
        let bus = RunEventBus::new();
        let run_id = new_id();
        let first = bus.subscribe(run_id);
        let mut second = bus.subscribe(run_id);
        assert_eq!(bus.subscriber_count(run_id), 2);

        drop(first);
        assert_eq!(bus.subscriber_count(run_id), 1);

        bus.publish_stage_update(StageUpdateEvent::new(
            run_id,
            StageKind::Validating,
            StageStatus::Completed,
        ));
        assert_matches!(second.next_event().await, Some(RunEvent::StageUpdate(_)));
    }

    #[tokio::test]
    async fn run_complete_is_delivered_once_then_stream_ends() {
        let bus = RunEventBus::new();
        let run_id = new_id();
        let mut sub = bus.subscribe(run_id);

        bus.publish_run_complete(complete(run_id));
        bus.publish_run_complete(complete(run_id));

        assert_matches!(sub.next_event().await, Some(RunEvent::RunComplete(_)));
        assert!(sub.next_event().await.is_none());
        assert_eq!(bus.subscriber_count(run_id), 0);
    }

    #[tokio::test]
    async fn closed_subscription_drains_then_ends() {
        let bus = RunEventBus::new();
        let run_id = new_id();
        let mut sub = bus.subscribe(run_id);

        bus.publish_stage_update(StageUpdateEvent::new(
            run_id,
            StageKind::Parsing,
            StageStatus::Completed,
        ));
        sub.close();
        assert_eq!(bus.subscriber_count(run_id), 0);

        bus.publish_stage_update(StageUpdateEvent::new(
            run_id,
            StageKind::Validating,
            StageStatus::Running,
        ));
        assert_matches!(sub.next_event().await, Some(RunEvent::StageUpdate(e)) if e.stage == StageKind::Parsing);
        assert!(sub.next_event().await.is_none());
    }

    #[tokio::test]
    async fn idle_subscription_ends_and_unregisters() {
        let bus = RunEventBus::new();
        let run_id = new_id();
        let mut sub = bus.subscribe(run_id).with_idle_timeout(Duration::from_millis(20));

        bus.publish_stage_update(StageUpdateEvent::new(
            run_id,
            StageKind::Parsing,
            StageStatus::Running,
        ));
        assert_matches!(sub.next_event().await, Some(RunEvent::StageUpdate(_)));

        let ended = tokio::time::timeout(Duration::from_secs(1), sub.next_event()).await;
        assert_matches!(ended, Ok(None));
        assert_eq!(bus.subscriber_count(run_id), 0);

        bus.publish_stage_update(StageUpdateEvent::new(
            run_id,
            StageKind::Validating,
            StageStatus::Running,
        ));
        assert!(sub.next_event().await.is_none());
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let bus = RunEventBus::new();
        bus.publish_run_complete(complete(new_id()));
    }

    #[test]
    fn event_serializes_with_type_tag() {
        let event = RunEvent::StageUpdate(
            StageUpdateEvent::new(new_id(), StageKind::Planning, StageStatus::Completed)
                .with_detail("1 action(s)"),
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "stage_update");
        assert_eq!(json["stage"], "planning");
        assert_eq!(json["detail"], "1 action(s)");
    }
}
