//! Audit trail phases and payload handling.
//!
//! Lives in `core` so that both the store layer and the pipeline can share
//! the phase vocabulary and the exact truncation contract.

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Phases
// ---------------------------------------------------------------------------

/// Pipeline phase an audit entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditPhase {
    Parse,
    Validate,
    Resolve,
    Plan,
    Approve,
    Execute,
    Error,
}

impl AuditPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Parse => "parse",
            Self::Validate => "validate",
            Self::Resolve => "resolve",
            Self::Plan => "plan",
            Self::Approve => "approve",
            Self::Execute => "execute",
            Self::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, CoreError> {
        match s {
            "parse" => Ok(Self::Parse),
            "validate" => Ok(Self::Validate),
            "resolve" => Ok(Self::Resolve),
            "plan" => Ok(Self::Plan),
            "approve" => Ok(Self::Approve),
            "execute" => Ok(Self::Execute),
            "error" => Ok(Self::Error),
            _ => Err(CoreError::Validation(format!(
                "Invalid audit phase: '{s}'. Must be one of: parse, validate, resolve, plan, \
                 approve, execute, error"
            ))),
        }
    }
}

impl std::fmt::Display for AuditPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Payload truncation
// ---------------------------------------------------------------------------

/// Byte ceiling for a serialized audit payload, excluding the marker.
pub const MAX_AUDIT_PAYLOAD_BYTES: usize = 10_000;

/// Appended to every payload cut at the ceiling.
pub const TRUNCATION_MARKER: &str = "...[truncated]";

/// Cut `text` to at most `max_bytes` on a char boundary and append
/// [`TRUNCATION_MARKER`]. Text within the ceiling is returned unchanged.
pub fn truncate_payload(text: String, max_bytes: usize) -> String {
    if text.len() <= max_bytes {
        return text;
    }
    let mut cut = max_bytes;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut out = String::with_capacity(cut + TRUNCATION_MARKER.len());
    out.push_str(&text[..cut]);
    out.push_str(TRUNCATION_MARKER);
    out
}

/// Redact, serialize and cap an audit payload.
pub fn serialize_payload(value: &serde_json::Value, max_bytes: usize) -> String {
    let redacted = redact_sensitive_fields(value);
    truncate_payload(redacted.to_string(), max_bytes)
}

// ---------------------------------------------------------------------------
// Sensitive field redaction
// ---------------------------------------------------------------------------

/// Keys whose values never reach the audit trail.
pub const SENSITIVE_FIELDS: &[&str] = &[
    "password",
    "token",
    "secret",
    "api_key",
    "apikey",
    "private_key",
    "authorization",
    "credential",
];

/// Replace the value of any key containing a [`SENSITIVE_FIELDS`] entry with
/// `"[REDACTED]"`, recursing through objects and arrays.
pub fn redact_sensitive_fields(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut redacted = serde_json::Map::new();
            for (key, val) in map {
                let lower_key = key.to_lowercase();
                if SENSITIVE_FIELDS.iter().any(|f| lower_key.contains(f)) {
                    redacted.insert(
                        key.clone(),
                        serde_json::Value::String("[REDACTED]".to_string()),
                    );
                } else {
                    redacted.insert(key.clone(), redact_sensitive_fields(val));
                }
            }
            serde_json::Value::Object(redacted)
        }
        serde_json::Value::Array(arr) => {
            serde_json::Value::Array(arr.iter().map(redact_sensitive_fields).collect())
        }
        other => other.clone(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
