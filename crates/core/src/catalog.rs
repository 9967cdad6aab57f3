//! Intent catalog: the static description of every action the agent can plan.
//!
//! The catalog is loaded once at process start and never mutated. Each
//! [`IntentDefinition`] declares the fields an intent needs, how risky it is
//! ([`IntentCategory`]), when a human must sign off ([`ApprovalPolicy`]) and
//! the downstream endpoint it maps to ([`ActionTemplate`]).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Generic path parameter used when a template names a parameter that the
/// extracted fields do not carry.
pub const FALLBACK_PATH_PARAM: &str = "itemId";

// ---------------------------------------------------------------------------
// FieldType
// ---------------------------------------------------------------------------

/// Scalar type of an extracted field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Date,
    Array,
    Object,
}

// ---------------------------------------------------------------------------
// ResolutionStrategy
// ---------------------------------------------------------------------------

/// How a free-text field value is turned into a downstream identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Fuzzy match against the line items of a parent purchase order.
    ///
    /// `parent_field` names the field holding the parent id; the resolved
    /// canonical value is written back under `resolved_key`.
    PoItemLookup {
        parent_field: String,
        resolved_key: String,
    },
}

// ---------------------------------------------------------------------------
// FieldSpec
// ---------------------------------------------------------------------------

/// Declaration of a single intent field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<ResolutionStrategy>,
}

impl FieldSpec {
    pub fn new(name: &str, field_type: FieldType, description: &str) -> Self {
        Self {
            name: name.to_string(),
            field_type,
            description: description.to_string(),
            resolution: None,
        }
    }

    /// Tag the field for purchase-order line item lookup.
    pub fn with_po_item_lookup(mut self, parent_field: &str, resolved_key: &str) -> Self {
        self.resolution = Some(ResolutionStrategy::PoItemLookup {
            parent_field: parent_field.to_string(),
            resolved_key: resolved_key.to_string(),
        });
        self
    }
}

// ---------------------------------------------------------------------------
// IntentCategory
// ---------------------------------------------------------------------------

/// Risk category of an intent. Plans execute categories in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentCategory {
    Read,
    Create,
    Update,
    Delete,
}

impl IntentCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    /// Position in the execution order: read, create, update, delete.
    ///
    /// The category set is closed. An intent with no catalog entry has no
    /// category at all and [`PlanBuilder`](crate::plan_builder::PlanBuilder)
    /// ranks it as read.
    pub fn sort_rank(&self) -> u8 {
        match self {
            Self::Read => 0,
            Self::Create => 1,
            Self::Update => 2,
            Self::Delete => 3,
        }
    }

    pub fn is_write(&self) -> bool {
        !matches!(self, Self::Read)
    }
}

impl std::fmt::Display for IntentCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ApprovalPolicy
// ---------------------------------------------------------------------------

/// When an intent must be approved by a human before execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalPolicy {
    Always,
    Never,
    #[serde(alias = "write_only")]
    OnWrite,
}

impl ApprovalPolicy {
    /// Whether an intent of `category` under this policy needs sign-off.
    pub fn requires_approval(&self, category: IntentCategory) -> bool {
        match self {
            Self::Always => true,
            Self::Never => false,
            Self::OnWrite => category.is_write(),
        }
    }
}

// ---------------------------------------------------------------------------
// HttpMethod / ActionTemplate
// ---------------------------------------------------------------------------

/// Method of a downstream action call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }

    /// Everything except GET mutates downstream state.
    pub fn is_mutating(&self) -> bool {
        !matches!(self, Self::Get)
    }
}

impl std::fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Endpoint template with `{name}` path parameters, e.g.
/// `/purchase-orders/{poId}/items/{itemId}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionTemplate {
    pub method: HttpMethod,
    pub path: String,
}

impl ActionTemplate {
    pub fn new(method: HttpMethod, path: &str) -> Self {
        Self {
            method,
            path: path.to_string(),
        }
    }

    /// Names of the `{...}` parameters in path order.
    pub fn path_params(&self) -> Vec<String> {
        let mut params = Vec::new();
        let mut rest = self.path.as_str();
        while let Some(start) = rest.find('{') {
            let after = &rest[start + 1..];
            match after.find('}') {
                Some(end) => {
                    params.push(after[..end].to_string());
                    rest = &after[end + 1..];
                }
                None => break,
            }
        }
        params
    }

    /// Whether the path ends in a parameter, i.e. addresses a single record.
    pub fn targets_single_record(&self) -> bool {
        self.path.trim_end_matches('/').ends_with('}')
    }
}

// ---------------------------------------------------------------------------
// IntentDefinition
// ---------------------------------------------------------------------------

/// Catalog entry for one intent kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntentDefinition {
    pub intent: String,
    #[serde(default)]
    pub description: String,
    pub category: IntentCategory,
    pub approval: ApprovalPolicy,
    #[serde(default)]
    pub required_fields: Vec<FieldSpec>,
    #[serde(default)]
    pub optional_fields: Vec<FieldSpec>,
    pub action: ActionTemplate,
}

impl IntentDefinition {
    /// Required fields followed by optional ones.
    pub fn all_fields(&self) -> impl Iterator<Item = &FieldSpec> {
        self.required_fields.iter().chain(self.optional_fields.iter())
    }

    pub fn requires_approval(&self) -> bool {
        self.approval.requires_approval(self.category)
    }
}

// ---------------------------------------------------------------------------
// IntentCatalog
// ---------------------------------------------------------------------------

/// Read-only lookup of [`IntentDefinition`]s keyed by intent kind.
#[derive(Debug, Clone, Default)]
pub struct IntentCatalog {
    entries: BTreeMap<String, IntentDefinition>,
}

impl IntentCatalog {
    /// Build a catalog from definitions. Duplicate intent kinds are rejected.
    pub fn from_definitions(definitions: Vec<IntentDefinition>) -> Result<Self, CoreError> {
        let mut entries = BTreeMap::new();
        for def in definitions {
            if def.intent.trim().is_empty() {
                return Err(CoreError::Validation(
                    "Catalog entry has an empty intent name".to_string(),
                ));
            }
            let key = def.intent.clone();
            if entries.insert(key.clone(), def).is_some() {
                return Err(CoreError::Conflict(format!(
                    "Intent '{key}' is declared more than once"
                )));
            }
        }
        Ok(Self { entries })
    }

    /// Load a catalog from a JSON array of definitions.
    pub fn from_json_str(json: &str) -> Result<Self, CoreError> {
        let definitions: Vec<IntentDefinition> = serde_json::from_str(json)
            .map_err(|e| CoreError::Validation(format!("Invalid intent catalog: {e}")))?;
        Self::from_definitions(definitions)
    }

    pub fn get(&self, intent: &str) -> Option<&IntentDefinition> {
        self.entries.get(intent)
    }

    pub fn contains(&self, intent: &str) -> bool {
        self.entries.contains_key(intent)
    }

    pub fn intents(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The built-in purchase-order catalog.
    pub fn purchase_orders() -> Self {
        let po_id = || FieldSpec::new("poId", FieldType::String, "Purchase order number");
        let item = || {
            FieldSpec::new("item", FieldType::String, "Line item number or description")
                .with_po_item_lookup("poId", "itemId")
        };

        let definitions = vec![
            IntentDefinition {
                intent: "get_purchase_order".into(),
                description: "Show a purchase order".into(),
                category: IntentCategory::Read,
                approval: ApprovalPolicy::Never,
                required_fields: vec![po_id()],
                optional_fields: vec![],
                action: ActionTemplate::new(HttpMethod::Get, "/purchase-orders/{poId}"),
            },
            IntentDefinition {
                intent: "list_purchase_orders".into(),
                description: "List purchase orders".into(),
                category: IntentCategory::Read,
                approval: ApprovalPolicy::Never,
                required_fields: vec![],
                optional_fields: vec![
                    FieldSpec::new("vendorId", FieldType::String, "Vendor to filter by"),
                    FieldSpec::new("status", FieldType::String, "Order status to filter by"),
                ],
                action: ActionTemplate::new(HttpMethod::Get, "/purchase-orders"),
            },
            IntentDefinition {
                intent: "get_po_items".into(),
                description: "List the line items of a purchase order".into(),
                category: IntentCategory::Read,
                approval: ApprovalPolicy::Never,
                required_fields: vec![po_id()],
                optional_fields: vec![],
                action: ActionTemplate::new(HttpMethod::Get, "/purchase-orders/{poId}/items"),
            },
            IntentDefinition {
                intent: "create_purchase_order".into(),
                description: "Create a purchase order".into(),
                category: IntentCategory::Create,
                approval: ApprovalPolicy::OnWrite,
                required_fields: vec![
                    FieldSpec::new("vendorId", FieldType::String, "Vendor to order from"),
                    FieldSpec::new("lineItems", FieldType::Array, "Materials, quantities and prices"),
                ],
                optional_fields: vec![
                    FieldSpec::new("deliveryDate", FieldType::Date, "Requested delivery date"),
                    FieldSpec::new("notes", FieldType::String, "Free-text notes"),
                ],
                action: ActionTemplate::new(HttpMethod::Post, "/purchase-orders"),
            },
            IntentDefinition {
                intent: "update_purchase_order".into(),
                description: "Update purchase order header fields".into(),
                category: IntentCategory::Update,
                approval: ApprovalPolicy::OnWrite,
                required_fields: vec![po_id()],
                optional_fields: vec![
                    FieldSpec::new("deliveryDate", FieldType::Date, "New delivery date"),
                    FieldSpec::new("notes", FieldType::String, "Replacement notes"),
                ],
                action: ActionTemplate::new(HttpMethod::Patch, "/purchase-orders/{poId}"),
            },
            IntentDefinition {
                intent: "update_po_item".into(),
                description: "Update a purchase order line item".into(),
                category: IntentCategory::Update,
                approval: ApprovalPolicy::OnWrite,
                required_fields: vec![po_id(), item()],
                optional_fields: vec![
                    FieldSpec::new("quantity", FieldType::Number, "New quantity"),
                    FieldSpec::new("price", FieldType::Number, "New net price"),
                    FieldSpec::new("deliveryDate", FieldType::Date, "New delivery date"),
                ],
                action: ActionTemplate::new(
                    HttpMethod::Patch,
                    "/purchase-orders/{poId}/items/{itemId}",
                ),
            },
            IntentDefinition {
                intent: "delete_po_item".into(),
                description: "Delete a purchase order line item".into(),
                category: IntentCategory::Delete,
                approval: ApprovalPolicy::Always,
                required_fields: vec![po_id(), item()],
                optional_fields: vec![],
                action: ActionTemplate::new(
                    HttpMethod::Delete,
                    "/purchase-orders/{poId}/items/{itemId}",
                ),
            },
            IntentDefinition {
                intent: "delete_purchase_order".into(),
                description: "Delete a purchase order".into(),
                category: IntentCategory::Delete,
                approval: ApprovalPolicy::Always,
                required_fields: vec![po_id()],
                optional_fields: vec![],
                action: ActionTemplate::new(HttpMethod::Delete, "/purchase-orders/{poId}"),
            },
        ];

        let entries = definitions
            .into_iter()
            .map(|def| (def.intent.clone(), def))
            .collect();
        Self { entries }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // Approval policy
    // -----------------------------------------------------------------------

    #[test]
    fn on_write_policy_skips_reads() {
        assert!(!ApprovalPolicy::OnWrite.requires_approval(IntentCategory::Read));
        assert!(ApprovalPolicy::OnWrite.requires_approval(IntentCategory::Create));
        assert!(ApprovalPolicy::OnWrite.requires_approval(IntentCategory::Delete));
    }

    #[test]
    fn always_and_never_ignore_category() {
        assert!(ApprovalPolicy::Always.requires_approval(IntentCategory::Read));
        assert!(!ApprovalPolicy::Never.requires_approval(IntentCategory::Delete));
    }

    #[test]
    fn write_only_alias_deserializes() {
        let policy: ApprovalPolicy = serde_json::from_str("\"write_only\"").unwrap();
        assert_eq!(policy, ApprovalPolicy::OnWrite);
    }

    // -----------------------------------------------------------------------
    // Templates
    // -----------------------------------------------------------------------

    #[test]
    fn path_params_in_order() {
        let t = ActionTemplate::new(HttpMethod::Patch, "/purchase-orders/{poId}/items/{itemId}");
        assert_eq!(t.path_params(), vec!["poId", "itemId"]);
        assert!(t.targets_single_record());
    }

    #[test]
    fn collection_path_has_no_params() {
        let t = ActionTemplate::new(HttpMethod::Get, "/purchase-orders");
        assert!(t.path_params().is_empty());
        assert!(!t.targets_single_record());
    }

    #[test]
    fn category_order_is_read_create_update_delete() {
        let mut cats = vec![
            IntentCategory::Delete,
            IntentCategory::Read,
            IntentCategory::Update,
            IntentCategory::Create,
        ];
        cats.sort_by_key(|c| c.sort_rank());
        assert_eq!(
            cats,
            vec![
                IntentCategory::Read,
                IntentCategory::Create,
                IntentCategory::Update,
                IntentCategory::Delete,
            ]
        );
    }

    // -----------------------------------------------------------------------
    // Catalog loading
    // -----------------------------------------------------------------------

    #[test]
    fn builtin_catalog_has_item_lookup() {
        let catalog = IntentCatalog::purchase_orders();
        let def = catalog.get("update_po_item").unwrap();
        let item = def.required_fields.iter().find(|f| f.name == "item").unwrap();
        assert_eq!(
            item.resolution,
            Some(ResolutionStrategy::PoItemLookup {
                parent_field: "poId".into(),
                resolved_key: "itemId".into(),
            })
        );
        assert!(def.requires_approval());
        assert!(!catalog.get("get_purchase_order").unwrap().requires_approval());
    }

    #[test]
    fn loads_from_json() {
        let json = r#"[{
            "intent": "get_vendor",
            "category": "read",
            "approval": "never",
            "required_fields": [{"name": "vendorId", "type": "string"}],
            "action": {"method": "GET", "path": "/vendors/{vendorId}"}
        }]"#;
        let catalog = IntentCatalog::from_json_str(json).unwrap();
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.get("get_vendor").unwrap().action.method, HttpMethod::Get);
    }

    #[test]
    fn duplicate_intents_rejected() {
        let def = IntentCatalog::purchase_orders()
            .get("get_purchase_order")
            .cloned()
            .unwrap();
        let result = IntentCatalog::from_definitions(vec![def.clone(), def]);
        assert!(matches!(result, Err(CoreError::Conflict(_))));
    }

    #[test]
    fn malformed_json_is_validation_error() {
        let result = IntentCatalog::from_json_str("{not json");
        assert!(matches!(result, Err(CoreError::Validation(_))));
    }
}
