//! Parsed and resolved intents.
//!
//! A [`ParsedIntent`] is what the external text parser extracts from a user
//! message. Entity resolution turns its free-text references into concrete
//! downstream identifiers, producing [`ResolvedEntity`] records.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

// ---------------------------------------------------------------------------
// ParsedIntent
// ---------------------------------------------------------------------------

/// A field the extractor could not pin down to one value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmbiguousField {
    pub field: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

/// One structured intent extracted from free text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedIntent {
    pub intent: String,
    /// Extractor confidence in `[0, 1]`.
    pub confidence: f64,
    #[serde(default)]
    pub fields: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missing_fields: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ambiguous_fields: Option<Vec<AmbiguousField>>,
}

impl ParsedIntent {
    pub fn new(intent: impl Into<String>, confidence: f64) -> Self {
        Self {
            intent: intent.into(),
            confidence: confidence.clamp(0.0, 1.0),
            fields: Map::new(),
            missing_fields: None,
            ambiguous_fields: None,
        }
    }

    /// Builder-style field setter.
    pub fn with_field(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(name.to_string(), value.into());
        self
    }

    pub fn with_missing_fields(mut self, fields: &[&str]) -> Self {
        self.missing_fields = Some(fields.iter().map(|f| f.to_string()).collect());
        self
    }

    /// Whether `name` carries a usable value (present, non-null, non-empty).
    pub fn has_value(&self, name: &str) -> bool {
        self.fields.get(name).is_some_and(|v| !is_empty_value(v))
    }

    /// Field value rendered as text. Strings are returned as-is, numbers and
    /// booleans in their JSON form; empty values yield `None`.
    pub fn field_text(&self, name: &str) -> Option<String> {
        self.fields.get(name).and_then(value_as_text)
    }
}

/// Null, blank strings, and empty arrays/objects count as "not provided".
pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

/// Render a scalar JSON value as path/identifier text.
pub fn value_as_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Confidence / ResolvedEntity
// ---------------------------------------------------------------------------

/// How sure entity resolution is about a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    Exact,
    High,
    Low,
    Ambiguous,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::High => "high",
            Self::Low => "low",
            Self::Ambiguous => "ambiguous",
        }
    }

    /// Only exact and high matches may be written back into an intent.
    pub fn is_usable(&self) -> bool {
        matches!(self, Self::Exact | Self::High)
    }
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A possible match offered for disambiguation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityCandidate {
    pub value: String,
    pub label: String,
    pub confidence: Confidence,
}

/// Outcome of resolving one free-text reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedEntity {
    /// Intent field the raw value came from.
    #[serde(default)]
    pub field: String,
    pub original: String,
    pub resolved: String,
    pub label: String,
    pub confidence: Confidence,
    /// Populated only when `confidence` is `Ambiguous`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidates: Option<Vec<EntityCandidate>>,
}

impl ResolvedEntity {
    pub fn new(original: &str, resolved: &str, label: &str, confidence: Confidence) -> Self {
        Self {
            field: String::new(),
            original: original.to_string(),
            resolved: resolved.to_string(),
            label: label.to_string(),
            confidence,
            candidates: None,
        }
    }

    pub fn for_field(mut self, field: &str) -> Self {
        self.field = field.to_string();
        self
    }
}

/// An intent together with the entities resolved for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedIntent {
    pub intent: ParsedIntent,
    #[serde(default)]
    pub resolved_entities: Vec<ResolvedEntity>,
}

impl ResolvedIntent {
    /// Entities that could not be used (ambiguous or low confidence).
    pub fn unresolved(&self) -> impl Iterator<Item = &ResolvedEntity> {
        self.resolved_entities
            .iter()
            .filter(|e| !e.confidence.is_usable())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
