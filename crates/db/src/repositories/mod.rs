//! Repository layer.
//!
//! Each repository is a zero-sized struct providing async queries that
//! accept `&PgPool` as the first argument and return `FromRow` row structs.
//! Conversion into domain types happens in [`PgStore`](crate::PgStore).

pub mod audit_repo;
pub mod conversation_repo;
pub mod pipeline_run_repo;
pub mod plan_repo;

pub use audit_repo::AuditRepo;
pub use conversation_repo::ConversationRepo;
pub use pipeline_run_repo::PipelineRunRepo;
pub use plan_repo::PlanRepo;

use opsagent_core::types::{DbId, EntityId, Timestamp};

type PgQueryAs<'q, O> =
    sqlx::query::QueryAs<'q, sqlx::Postgres, O, sqlx::postgres::PgArguments>;

type PgQueryScalar<'q> =
    sqlx::query::QueryScalar<'q, sqlx::Postgres, i64, sqlx::postgres::PgArguments>;

/// Typed bind value for dynamically built queries.
#[derive(Debug, Clone)]
pub(crate) enum BindValue {
    BigInt(DbId),
    NullableBigInt(Option<i64>),
    Text(String),
    NullableText(Option<String>),
    Uuid(EntityId),
    Timestamp(Timestamp),
    Json(serde_json::Value),
}

/// Bind a slice of `BindValue` to a sqlx `QueryAs`.
pub(crate) fn bind_values<'q, O>(
    mut q: PgQueryAs<'q, O>,
    values: &'q [BindValue],
) -> PgQueryAs<'q, O> {
    for val in values {
        q = match val {
            BindValue::BigInt(v) => q.bind(*v),
            BindValue::NullableBigInt(v) => q.bind(*v),
            BindValue::Text(v) => q.bind(v.as_str()),
            BindValue::NullableText(v) => q.bind(v.as_deref()),
            BindValue::Uuid(v) => q.bind(*v),
            BindValue::Timestamp(v) => q.bind(*v),
            BindValue::Json(v) => q.bind(v),
        };
    }
    q
}

/// Bind a slice of `BindValue` to a sqlx `QueryScalar` (counts).
pub(crate) fn bind_values_scalar<'q>(
    mut q: PgQueryScalar<'q>,
    values: &'q [BindValue],
) -> PgQueryScalar<'q> {
    for val in values {
        q = match val {
            BindValue::BigInt(v) => q.bind(*v),
            BindValue::NullableBigInt(v) => q.bind(*v),
            BindValue::Text(v) => q.bind(v.as_str()),
            BindValue::NullableText(v) => q.bind(v.as_deref()),
            BindValue::Uuid(v) => q.bind(*v),
            BindValue::Timestamp(v) => q.bind(*v),
            BindValue::Json(v) => q.bind(v),
        };
    }
    q
}

/// Accumulates `column = $n` fragments and their bind values.
#[derive(Debug, Default)]
pub(crate) struct Clauses {
    pub fragments: Vec<String>,
    pub values: Vec<BindValue>,
}

impl Clauses {
    /// Index the next pushed value will bind to.
    pub fn next_idx(&self) -> usize {
        self.values.len() + 1
    }

    pub fn push(&mut self, column_op: &str, value: BindValue) {
        let idx = self.next_idx();
        self.fragments.push(format!("{column_op} ${idx}"));
        self.values.push(value);
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    pub fn where_clause(&self) -> String {
        if self.fragments.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", self.fragments.join(" AND "))
        }
    }

    pub fn set_clause(&self) -> String {
        self.fragments.join(", ")
    }
}
