//! Required-field validation of parsed intents.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::catalog::IntentCatalog;
use crate::intent::ParsedIntent;

/// Result of validating one intent against the catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub valid: bool,
    /// `None` when the intent kind is not in the catalog.
    pub missing_fields: Option<Vec<String>>,
}

impl ValidationOutcome {
    pub fn is_unknown_intent(&self) -> bool {
        self.missing_fields.is_none()
    }

    /// Human-readable reason the intent cannot proceed, if any.
    pub fn problem(&self, intent: &str) -> Option<String> {
        match &self.missing_fields {
            None => Some(format!("Unknown intent '{intent}'")),
            Some(fields) if !fields.is_empty() => Some(format!(
                "Missing required fields for '{intent}': {}",
                fields.join(", ")
            )),
            Some(_) => None,
        }
    }
}

/// Checks extracted fields against the catalog's required-field lists.
#[derive(Debug, Clone)]
pub struct Validator {
    catalog: Arc<IntentCatalog>,
}

impl Validator {
    pub fn new(catalog: Arc<IntentCatalog>) -> Self {
        Self { catalog }
    }

    /// Validate `intent`. Catalog-required fields that are absent, null or
    /// empty are unioned with the extractor's own missing-field flags; each
    /// field is reported once.
    pub fn validate(&self, intent: &ParsedIntent) -> ValidationOutcome {
        let Some(def) = self.catalog.get(&intent.intent) else {
            return ValidationOutcome {
                valid: false,
                missing_fields: None,
            };
        };

        let mut missing: Vec<String> = Vec::new();
        for field in &def.required_fields {
            if !intent.has_value(&field.name) && !missing.contains(&field.name) {
                missing.push(field.name.clone());
            }
        }
        for flagged in intent.missing_fields.iter().flatten() {
            if !missing.contains(flagged) {
                missing.push(flagged.clone());
            }
        }

        ValidationOutcome {
            valid: missing.is_empty(),
            missing_fields: Some(missing),
        }
    }
}
