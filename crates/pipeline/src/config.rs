use std::time::Duration;

use opsagent_core::audit::MAX_AUDIT_PAYLOAD_BYTES;

/// Runtime knobs of the orchestrator and its background sweep.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Byte ceiling of each serialized audit payload.
    pub audit_payload_max_bytes: usize,
    /// Messages of history handed to the parser.
    pub conversation_history_limit: i64,
    /// Age after which a non-terminal run counts as orphaned.
    pub stale_run_after: Duration,
    pub recovery_sweep_interval: Duration,
    /// Idle ceiling for live viewer subscriptions.
    pub viewer_idle_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            audit_payload_max_bytes: MAX_AUDIT_PAYLOAD_BYTES,
            conversation_history_limit: 20,
            stale_run_after: Duration::from_secs(900),
            recovery_sweep_interval: Duration::from_secs(60),
            viewer_idle_timeout: Duration::from_secs(600),
        }
    }
}
