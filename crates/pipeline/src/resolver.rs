//! Entity resolution: turns free-text line item references into item numbers.
//!
//! Matching is tiered. Numeric input is taken as an item number outright.
//! Anything else is compared against the live line items of the parent
//! purchase order, first for a whole-label match and then for a substring
//! match.

use std::sync::Arc;

use opsagent_core::catalog::{IntentCatalog, ResolutionStrategy};
use opsagent_core::intent::{
    Confidence, EntityCandidate, ParsedIntent, ResolvedEntity, ResolvedIntent,
};
use serde_json::Value;

use crate::backend::{ActionBackend, LineItemCandidate};

/// Canonical width of a purchase-order item number (`10` -> `00010`).
pub const ITEM_NUMBER_WIDTH: usize = 5;

/// Resolves catalog fields tagged with a lookup strategy.
#[derive(Clone)]
pub struct EntityResolver {
    catalog: Arc<IntentCatalog>,
    backend: Arc<dyn ActionBackend>,
}

impl EntityResolver {
    pub fn new(catalog: Arc<IntentCatalog>, backend: Arc<dyn ActionBackend>) -> Self {
        Self { catalog, backend }
    }

    /// Resolve `raw` to a line item of purchase order `po_id`. Never fails;
    /// lookup problems come back as `low` confidence.
    pub async fn resolve_po_item(&self, po_id: &str, raw: &str) -> ResolvedEntity {
        let query = raw.trim();

        if !query.is_empty() && query.chars().all(|c| c.is_ascii_digit()) {
            let padded = format!("{query:0>width$}", width = ITEM_NUMBER_WIDTH);
            let label = format!("Item {padded}");
            return ResolvedEntity::new(raw, &padded, &label, Confidence::Exact);
        }

        let candidates = match self.backend.list_po_items(po_id).await {
            Ok(candidates) => candidates,
            Err(e) => {
                tracing::warn!(po_id, error = %e, "Line item lookup failed");
                let label = format!("Could not look up items of purchase order {po_id}: {e}");
                return ResolvedEntity::new(raw, raw, &label, Confidence::Low);
            }
        };

        match_candidates(raw, &candidates)
    }

    /// Resolve every lookup-tagged field of `intent`. Usable matches are
    /// written back under the strategy's resolved key; ambiguous and low
    /// matches are reported without touching the intent.
    pub async fn resolve(&self, mut intent: ParsedIntent) -> ResolvedIntent {
        let mut resolved_entities = Vec::new();
        let Some(def) = self.catalog.get(&intent.intent) else {
            return ResolvedIntent {
                intent,
                resolved_entities,
            };
        };

        for spec in def.all_fields() {
            let Some(ResolutionStrategy::PoItemLookup {
                parent_field,
                resolved_key,
            }) = &spec.resolution
            else {
                continue;
            };
            let (Some(raw), Some(parent)) =
                (intent.field_text(&spec.name), intent.field_text(parent_field))
            else {
                continue;
            };

            let entity = self.resolve_po_item(&parent, &raw).await.for_field(&spec.name);
            if entity.confidence.is_usable() {
                intent
                    .fields
                    .insert(resolved_key.clone(), Value::String(entity.resolved.clone()));
            }
            resolved_entities.push(entity);
        }

        ResolvedIntent {
            intent,
            resolved_entities,
        }
    }
}

/// Pure matching step against an already fetched candidate list.
pub fn match_candidates(raw: &str, candidates: &[LineItemCandidate]) -> ResolvedEntity {
    let needle = raw.trim().to_lowercase();

    let exact: Vec<&LineItemCandidate> = candidates
        .iter()
        .filter(|c| {
            c.label.to_lowercase() == needle
                || c.secondary_key
                    .as_deref()
                    .is_some_and(|k| k.to_lowercase() == needle)
        })
        .collect();
    if let [only] = exact.as_slice() {
        return ResolvedEntity::new(raw, &only.id, &only.label, Confidence::Exact);
    }

    let partial: Vec<&LineItemCandidate> = candidates
        .iter()
        .filter(|c| {
            c.label.to_lowercase().contains(&needle)
                || c.secondary_key
                    .as_deref()
                    .is_some_and(|k| k.to_lowercase().contains(&needle))
        })
        .collect();

    match partial.as_slice() {
        [] => ResolvedEntity::new(raw, raw, "No matching line item", Confidence::Low),
        [only] => ResolvedEntity::new(raw, &only.id, &only.label, Confidence::High),
        many => {
            let label = format!("{} matching line items", many.len());
            let mut entity = ResolvedEntity::new(raw, raw, &label, Confidence::Ambiguous);
            entity.candidates = Some(
                many.iter()
                    .map(|c| EntityCandidate {
                        value: c.id.clone(),
                        label: c.label.clone(),
                        confidence: Confidence::High,
                    })
                    .collect(),
            );
            entity
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
