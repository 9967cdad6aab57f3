use std::time::Duration;

use opsagent_pipeline::OrchestratorConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{var} must be {expected}, got '{value}'")]
    Invalid {
        var: &'static str,
        expected: &'static str,
        value: String,
    },
}

/// Output format of the operational log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Worker configuration loaded from environment variables.
///
/// Everything except the database URL has a default suitable for local
/// development.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub database_url: String,
    pub database_max_connections: u32,
    /// Age after which a non-terminal run is treated as orphaned.
    pub stale_run_after: Duration,
    pub recovery_sweep_interval: Duration,
    pub viewer_idle_timeout: Duration,
    pub audit_payload_max_bytes: usize,
    pub conversation_history_limit: i64,
    /// JSON intent catalog; the built-in purchase-order catalog when unset.
    pub intent_catalog_path: Option<String>,
    pub log_format: LogFormat,
}

impl WorkerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                        | Default    |
    /// |--------------------------------|------------|
    /// | `DATABASE_URL`                 | (required) |
    /// | `DATABASE_MAX_CONNECTIONS`     | `20`       |
    /// | `STALE_RUN_AFTER_SECS`         | `900`      |
    /// | `RECOVERY_SWEEP_INTERVAL_SECS` | `60`       |
    /// | `VIEWER_IDLE_TIMEOUT_SECS`     | `600`      |
    /// | `AUDIT_PAYLOAD_MAX_BYTES`      | `10000`    |
    /// | `CONVERSATION_HISTORY_LIMIT`   | `20`       |
    /// | `INTENT_CATALOG_PATH`          | (unset)    |
    /// | `LOG_FORMAT`                   | `text`     |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) but reads through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL")
            .filter(|v| !v.trim().is_empty())
            .ok_or(ConfigError::Missing("DATABASE_URL"))?;

        let database_max_connections: u32 = parse_or(&lookup, "DATABASE_MAX_CONNECTIONS", 20)?;
        let stale_run_after_secs: u64 = parse_or(&lookup, "STALE_RUN_AFTER_SECS", 900)?;
        let sweep_interval_secs: u64 = parse_or(&lookup, "RECOVERY_SWEEP_INTERVAL_SECS", 60)?;
        let viewer_idle_secs: u64 = parse_or(&lookup, "VIEWER_IDLE_TIMEOUT_SECS", 600)?;
        let audit_payload_max_bytes: usize = parse_or(&lookup, "AUDIT_PAYLOAD_MAX_BYTES", 10_000)?;
        let conversation_history_limit: i64 = parse_or(&lookup, "CONVERSATION_HISTORY_LIMIT", 20)?;

        if sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid {
                var: "RECOVERY_SWEEP_INTERVAL_SECS",
                expected: "greater than zero",
                value: "0".into(),
            });
        }

        let log_format = match lookup("LOG_FORMAT").as_deref().map(str::trim) {
            None | Some("") | Some("text") => LogFormat::Text,
            Some("json") => LogFormat::Json,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    var: "LOG_FORMAT",
                    expected: "'text' or 'json'",
                    value: other.to_string(),
                })
            }
        };

        Ok(Self {
            database_url,
            database_max_connections,
            stale_run_after: Duration::from_secs(stale_run_after_secs),
            recovery_sweep_interval: Duration::from_secs(sweep_interval_secs),
            viewer_idle_timeout: Duration::from_secs(viewer_idle_secs),
            audit_payload_max_bytes,
            conversation_history_limit,
            intent_catalog_path: lookup("INTENT_CATALOG_PATH").filter(|v| !v.trim().is_empty()),
            log_format,
        })
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            audit_payload_max_bytes: self.audit_payload_max_bytes,
            conversation_history_limit: self.conversation_history_limit,
            stale_run_after: self.stale_run_after,
            recovery_sweep_interval: self.recovery_sweep_interval,
            viewer_idle_timeout: self.viewer_idle_timeout,
        }
    }
}

fn parse_or<F, T>(lookup: &F, var: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(var) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid {
            var,
            expected: "a non-negative integer",
            value: raw,
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use assert_matches::assert_matches;

    use super::*;

    fn load(vars: &[(&str, &str)]) -> Result<WorkerConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        WorkerConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_only_the_database_is_set() {
        let config = load(&[("DATABASE_URL", "postgres://localhost/opsagent")]).unwrap();
        assert_eq!(config.database_max_connections, 20);
        assert_eq!(config.stale_run_after, Duration::from_secs(900));
        assert_eq!(config.recovery_sweep_interval, Duration::from_secs(60));
        assert_eq!(config.audit_payload_max_bytes, 10_000);
        assert_eq!(config.log_format, LogFormat::Text);
        assert!(config.intent_catalog_path.is_none());
    }

    #[test]
    fn database_url_is_required() {
        assert_matches!(load(&[]), Err(ConfigError::Missing("DATABASE_URL")));
        assert_matches!(
            load(&[("DATABASE_URL", "  ")]),
            Err(ConfigError::Missing("DATABASE_URL"))
        );
    }

    #[test]
    fn overrides_flow_into_the_orchestrator() {
        let config = load(&[
            ("DATABASE_URL", "postgres://db/opsagent"),
            ("STALE_RUN_AFTER_SECS", "120"),
            ("CONVERSATION_HISTORY_LIMIT", "5"),
            ("LOG_FORMAT", "json"),
        ])
        .unwrap();
        assert_eq!(config.log_format, LogFormat::Json);

        let orchestrator = config.orchestrator_config();
        assert_eq!(orchestrator.stale_run_after, Duration::from_secs(120));
        assert_eq!(orchestrator.conversation_history_limit, 5);
    }

    #[test]
    fn malformed_values_are_rejected() {
        let err = load(&[
            ("DATABASE_URL", "postgres://db/opsagent"),
            ("STALE_RUN_AFTER_SECS", "soon"),
        ])
        .unwrap_err();
        assert_matches!(err, ConfigError::Invalid { var: "STALE_RUN_AFTER_SECS", .. });

        let err = load(&[
            ("DATABASE_URL", "postgres://db/opsagent"),
            ("LOG_FORMAT", "xml"),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("LOG_FORMAT"));

        let err = load(&[
            ("DATABASE_URL", "postgres://db/opsagent"),
            ("RECOVERY_SWEEP_INTERVAL_SECS", "0"),
        ])
        .unwrap_err();
        assert_matches!(err, ConfigError::Invalid { .. });
    }
}
