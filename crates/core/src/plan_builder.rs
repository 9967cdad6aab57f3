//! Compiles resolved intents into an ordered [`ExecutionPlan`].
//!
//! Actions are stable-sorted read, create, update, delete so that lookups
//! surface information before any mutation commits. Approval is decided per
//! action from the catalog policy and rolled up to the plan.

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::catalog::{
    HttpMethod, IntentCatalog, IntentCategory, IntentDefinition, FALLBACK_PATH_PARAM,
};
use crate::intent::{is_empty_value, value_as_text, ResolvedEntity, ResolvedIntent};
use crate::plan::{ActionCall, ExecutionPlan, PlannedAction, RiskFlag};
use crate::types::new_id;

/// Builds execution plans from validated, resolved intents.
#[derive(Debug, Clone)]
pub struct PlanBuilder {
    catalog: Arc<IntentCatalog>,
}

impl PlanBuilder {
    pub fn new(catalog: Arc<IntentCatalog>) -> Self {
        Self { catalog }
    }

    pub fn build(&self, items: &[ResolvedIntent]) -> ExecutionPlan {
        let mut ordered: Vec<(&ResolvedIntent, Option<&IntentDefinition>)> = items
            .iter()
            .map(|item| (item, self.catalog.get(&item.intent.intent)))
            .collect();
        // Unknown intents sort with the reads. `sort_by_key` is stable.
        ordered.sort_by_key(|(_, def)| def.map_or(0, |d| d.category.sort_rank()));

        let actions: Vec<PlannedAction> = ordered
            .into_iter()
            .map(|(item, def)| build_action(item, def))
            .collect();

        let requires_approval = actions.iter().any(|a| a.requires_approval);
        let summary = summarize(&actions, requires_approval);

        ExecutionPlan {
            id: new_id(),
            created_at: chrono::Utc::now(),
            actions,
            requires_approval,
            summary,
        }
    }
}

// ---------------------------------------------------------------------------
// Action assembly
// ---------------------------------------------------------------------------

fn build_action(item: &ResolvedIntent, def: Option<&IntentDefinition>) -> PlannedAction {
    let intent = &item.intent;
    let fields = intent.fields.clone();

    let Some(def) = def else {
        return PlannedAction {
            intent: intent.intent.clone(),
            category: IntentCategory::Read,
            description: format!("Unsupported request '{}'", intent.intent),
            call: ActionCall {
                method: HttpMethod::Get,
                path: String::new(),
                body: None,
                missing_params: Vec::new(),
            },
            fields,
            resolved_entities: item.resolved_entities.clone(),
            requires_approval: false,
            risks: Vec::new(),
        };
    };

    let params = def.action.path_params();
    let mut path = def.action.path.clone();
    let mut missing_params = Vec::new();
    for param in &params {
        let value = field_text(&fields, param).or_else(|| {
            if param != FALLBACK_PATH_PARAM {
                field_text(&fields, FALLBACK_PATH_PARAM)
            } else {
                None
            }
        });
        match value {
            Some(v) => path = path.replace(&format!("{{{param}}}"), &encode_path_segment(&v)),
            None => missing_params.push(param.clone()),
        }
    }

    let body = match def.action.method {
        HttpMethod::Post | HttpMethod::Put | HttpMethod::Patch => {
            let mut body = Map::new();
            for spec in def.all_fields() {
                // Raw free-text identifiers are replaced by their resolved key.
                if params.contains(&spec.name) || spec.resolution.is_some() {
                    continue;
                }
                if let Some(value) = fields.get(&spec.name).filter(|v| !is_empty_value(v)) {
                    body.insert(spec.name.clone(), value.clone());
                }
            }
            Some(Value::Object(body))
        }
        HttpMethod::Get | HttpMethod::Delete => None,
    };

    let mut risks = Vec::new();
    if def.category == IntentCategory::Delete {
        risks.push(RiskFlag::Destructive);
    }
    if def.category == IntentCategory::Create
        && fields
            .get("lineItems")
            .and_then(Value::as_array)
            .is_some_and(|items| !items.is_empty())
    {
        risks.push(RiskFlag::CreatesRecord);
    }

    PlannedAction {
        intent: intent.intent.clone(),
        category: def.category,
        description: describe(def, &fields, &item.resolved_entities, body.as_ref()),
        call: ActionCall {
            method: def.action.method,
            path,
            body,
            missing_params,
        },
        fields,
        resolved_entities: item.resolved_entities.clone(),
        requires_approval: def.requires_approval(),
        risks,
    }
}

fn field_text(fields: &Map<String, Value>, name: &str) -> Option<String> {
    fields.get(name).and_then(value_as_text)
}

/// Escape the characters that would change the shape of a URL path.
fn encode_path_segment(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '%' => out.push_str("%25"),
            '/' => out.push_str("%2F"),
            '?' => out.push_str("%3F"),
            '#' => out.push_str("%23"),
            ' ' => out.push_str("%20"),
            _ => out.push(ch),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Descriptions
// ---------------------------------------------------------------------------

/// Label for a field: the resolved entity's label when one was usable,
/// otherwise the raw extracted value.
fn entity_label(fields: &Map<String, Value>, entities: &[ResolvedEntity], field: &str) -> String {
    if let Some(entity) = entities
        .iter()
        .find(|e| e.field == field && e.confidence.is_usable())
    {
        if entity.label.is_empty() || entity.label == entity.resolved {
            return entity.resolved.clone();
        }
        return format!("{} ({})", entity.label, entity.resolved);
    }
    field_text(fields, field).unwrap_or_else(|| "?".to_string())
}

fn describe_changes(body: Option<&Value>) -> String {
    let Some(Value::Object(map)) = body else {
        return String::new();
    };
    let changes: Vec<String> = map
        .iter()
        .map(|(k, v)| match v {
            Value::String(s) => format!("{k} to {s}"),
            other => format!("{k} to {other}"),
        })
        .collect();
    if changes.is_empty() {
        String::new()
    } else {
        format!(": set {}", changes.join(", "))
    }
}

fn describe(
    def: &IntentDefinition,
    fields: &Map<String, Value>,
    entities: &[ResolvedEntity],
    body: Option<&Value>,
) -> String {
    let po = || entity_label(fields, entities, "poId");
    let item = || entity_label(fields, entities, "item");

    match def.intent.as_str() {
        "get_purchase_order" => format!("Show purchase order {}", po()),
        "list_purchase_orders" => {
            let mut text = "List purchase orders".to_string();
            if let Some(vendor) = field_text(fields, "vendorId") {
                text.push_str(&format!(" for vendor {vendor}"));
            }
            if let Some(status) = field_text(fields, "status") {
                text.push_str(&format!(" with status {status}"));
            }
            text
        }
        "get_po_items" => format!("List line items of purchase order {}", po()),
        "create_purchase_order" => {
            let count = fields
                .get("lineItems")
                .and_then(Value::as_array)
                .map_or(0, Vec::len);
            format!(
                "Create purchase order for vendor {} with {count} line item(s)",
                entity_label(fields, entities, "vendorId")
            )
        }
        "update_purchase_order" => {
            format!("Update purchase order {}{}", po(), describe_changes(body))
        }
        "update_po_item" => format!(
            "Update line item {} on purchase order {}{}",
            item(),
            po(),
            describe_changes(body)
        ),
        "delete_po_item" => format!("Delete line item {} from purchase order {}", item(), po()),
        "delete_purchase_order" => format!("Delete purchase order {}", po()),
        _ if !def.description.is_empty() => def.description.clone(),
        other => other.replace('_', " "),
    }
}

fn summarize(actions: &[PlannedAction], requires_approval: bool) -> String {
    if actions.is_empty() {
        return "Nothing to do".to_string();
    }
    let mut parts = Vec::new();
    for category in [
        IntentCategory::Read,
        IntentCategory::Create,
        IntentCategory::Update,
        IntentCategory::Delete,
    ] {
        let n = actions.iter().filter(|a| a.category == category).count();
        if n > 0 {
            parts.push(format!("{n} {category}"));
        }
    }
    let mut summary = format!("{} action(s): {}", actions.len(), parts.join(", "));
    if requires_approval {
        summary.push_str(". Approval required");
    }
    summary
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::{Confidence, ParsedIntent};
    use serde_json::json;

    fn builder() -> PlanBuilder {
        PlanBuilder::new(Arc::new(IntentCatalog::purchase_orders()))
    }

    fn item(intent: ParsedIntent) -> ResolvedIntent {
        ResolvedIntent {
            intent,
            resolved_entities: vec![],
        }
    }

    #[test]
    fn reads_run_before_deletes_and_plan_needs_approval() {
        let plan = builder().build(&[
            item(ParsedIntent::new("delete_purchase_order", 0.9).with_field("poId", "4500000001")),
            item(ParsedIntent::new("get_purchase_order", 0.9).with_field("poId", "4500000002")),
        ]);
        let kinds: Vec<_> = plan.actions.iter().map(|a| a.category).collect();
        assert_eq!(kinds, vec![IntentCategory::Read, IntentCategory::Delete]);
        assert!(plan.requires_approval);
        assert!(!plan.actions[0].requires_approval);
        assert_eq!(plan.actions[1].risks, vec![RiskFlag::Destructive]);
    }

    #[test]
    fn sort_is_stable_within_category() {
        let plan = builder().build(&[
            item(ParsedIntent::new("get_purchase_order", 0.9).with_field("poId", "1")),
            item(ParsedIntent::new("get_purchase_order", 0.9).with_field("poId", "2")),
        ]);
        assert_eq!(plan.actions[0].call.path, "/purchase-orders/1");
        assert_eq!(plan.actions[1].call.path, "/purchase-orders/2");
        assert!(!plan.requires_approval);
    }

    #[test]
    fn unknown_intent_sorts_as_read() {
        let plan = builder().build(&[
            item(ParsedIntent::new("update_purchase_order", 0.9).with_field("poId", "1")),
            item(ParsedIntent::new("mystery", 0.9)),
        ]);
        assert_eq!(plan.actions[0].intent, "mystery");
        assert!(plan.actions[0].call.path.is_empty());
    }

    #[test]
    fn body_excludes_path_params_and_raw_identifier() {
        let intent = ParsedIntent::new("update_po_item", 0.9)
            .with_field("poId", "4500000001")
            .with_field("item", "forks")
            .with_field("itemId", "00010")
            .with_field("quantity", 12);
        let resolved = ResolvedIntent {
            intent,
            resolved_entities: vec![
                ResolvedEntity::new("forks", "00010", "Forks", Confidence::High).for_field("item"),
            ],
        };
        let plan = builder().build(&[resolved]);
        let action = &plan.actions[0];
        assert_eq!(action.call.method, HttpMethod::Patch);
        assert_eq!(action.call.path, "/purchase-orders/4500000001/items/00010");
        assert_eq!(action.call.body, Some(json!({"quantity": 12})));
        assert!(action.call.missing_params.is_empty());
        assert_eq!(
            action.description,
            "Update line item Forks (00010) on purchase order 4500000001: set quantity to 12"
        );
    }

    #[test]
    fn missing_path_param_is_recorded() {
        let plan = builder().build(&[item(
            ParsedIntent::new("delete_po_item", 0.9)
                .with_field("poId", "4500000001")
                .with_field("item", "forks"),
        )]);
        assert_eq!(plan.actions[0].call.missing_params, vec!["itemId"]);
        assert_eq!(
            plan.actions[0].description,
            "Delete line item forks from purchase order 4500000001"
        );
    }

    #[test]
    fn declared_param_falls_back_to_item_id() {
        let mut catalog = IntentCatalog::purchase_orders()
            .get("delete_po_item")
            .cloned()
            .unwrap();
        catalog.intent = "delete_line".into();
        catalog.action.path = "/purchase-orders/{poId}/lines/{lineId}".into();
        let catalog = IntentCatalog::from_definitions(vec![catalog]).unwrap();
        let plan = PlanBuilder::new(Arc::new(catalog)).build(&[item(
            ParsedIntent::new("delete_line", 0.9)
                .with_field("poId", "45")
                .with_field("itemId", "00020"),
        )]);
        assert_eq!(plan.actions[0].call.path, "/purchase-orders/45/lines/00020");
    }

    #[test]
    fn create_with_line_items_is_flagged() {
        let plan = builder().build(&[item(
            ParsedIntent::new("create_purchase_order", 0.9)
                .with_field("vendorId", "V100")
                .with_field("lineItems", json!([{"material": "M-1", "quantity": 2}])),
        )]);
        let action = &plan.actions[0];
        assert_eq!(action.risks, vec![RiskFlag::CreatesRecord]);
        assert_eq!(action.call.path, "/purchase-orders");
        assert_eq!(
            action.description,
            "Create purchase order for vendor V100 with 1 line item(s)"
        );
        assert!(plan.summary.contains("Approval required"));
    }

    #[test]
    fn path_values_are_escaped() {
        let plan = builder().build(&[item(
            ParsedIntent::new("get_purchase_order", 0.9).with_field("poId", "a/b c"),
        )]);
        assert_eq!(plan.actions[0].call.path, "/purchase-orders/a%2Fb%20c");
    }
}
