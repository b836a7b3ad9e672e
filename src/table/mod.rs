// ============================================================================
// Table Service - Backend Abstraction
// ============================================================================
//
// The repository and the event store only talk to a TableService. It offers
// consistent point reads, scans, index queries, (conditional) writes and
// table lifecycle. Two backends ship with the crate:
//
// - MemoryTableService: in-process, used by tests and local development
// - ScyllaTableService: ScyllaDB via the scylla driver
//
// Filter expressions are opaque strings with positional `?` placeholders.
// Callers never parse them; each backend decides how to evaluate them.
//
// ============================================================================

mod filter;
pub mod marshal;
mod memory;
mod scylladb;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

pub(crate) use filter::FilterExpr;
pub use memory::MemoryTableService;
pub use scylladb::ScyllaTableService;

/// A stored record: attribute name to JSON value.
pub type Item = serde_json::Map<String, Value>;

#[derive(Debug, thiserror::Error)]
pub enum TableError {
    #[error("table not found: {0}")]
    TableNotFound(String),

    #[error("index not found: {0}")]
    IndexNotFound(String),

    #[error("conditional check failed")]
    ConditionFailed,

    #[error("invalid item: {0}")]
    InvalidItem(String),

    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    #[error("invalid filter expression: {0}")]
    Filter(String),

    #[error("encoding error: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("deadline exceeded")]
    DeadlineExceeded,

    #[error("backend error: {0}")]
    Backend(Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl TableError {
    pub fn backend<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        TableError::Backend(Box::new(err))
    }
}

// ============================================================================
// Schema
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeType {
    String,
    Number,
    Float,
    Bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyAttribute {
    pub name: String,
    pub kind: AttributeType,
}

impl KeyAttribute {
    pub fn new(name: impl Into<String>, kind: AttributeType) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// Secondary index definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
    pub name: String,
    pub partition_key: KeyAttribute,
    pub sort_key: Option<KeyAttribute>,
}

impl IndexSpec {
    pub fn new(name: impl Into<String>, partition_key: KeyAttribute) -> Self {
        Self {
            name: name.into(),
            partition_key,
            sort_key: None,
        }
    }

    pub fn with_sort_key(mut self, sort_key: KeyAttribute) -> Self {
        self.sort_key = Some(sort_key);
        self
    }
}

/// Table layout: primary key plus the attributes a backend must be able to
/// filter and index on. Other attributes are stored but opaque.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub partition_key: KeyAttribute,
    pub sort_key: Option<KeyAttribute>,
    pub attributes: Vec<KeyAttribute>,
}

impl TableSchema {
    pub fn new(partition_key: KeyAttribute) -> Self {
        Self {
            partition_key,
            sort_key: None,
            attributes: Vec::new(),
        }
    }

    pub fn with_sort_key(mut self, sort_key: KeyAttribute) -> Self {
        self.sort_key = Some(sort_key);
        self
    }

    pub fn with_attribute(mut self, attribute: KeyAttribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    /// Primary key of an item under this schema.
    pub fn key_of(&self, item: &Item) -> Result<Key, TableError> {
        let partition = key_value(item, &self.partition_key.name)?;
        let mut key = Key::partition(self.partition_key.name.clone(), partition);
        if let Some(sort_key) = &self.sort_key {
            key = key.with_sort(sort_key.name.clone(), key_value(item, &sort_key.name)?);
        }
        Ok(key)
    }
}

fn key_value(item: &Item, name: &str) -> Result<Value, TableError> {
    match item.get(name) {
        Some(value) if !value.is_null() => Ok(value.clone()),
        _ => Err(TableError::InvalidItem(format!("missing key attribute {name}"))),
    }
}

// ============================================================================
// Requests
// ============================================================================

/// Primary key of one item.
#[derive(Debug, Clone, PartialEq)]
pub struct Key {
    pub partition: (String, Value),
    pub sort: Option<(String, Value)>,
}

impl Key {
    pub fn partition(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            partition: (name.into(), value.into()),
            sort: None,
        }
    }

    pub fn with_sort(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.sort = Some((name.into(), value.into()));
        self
    }
}

/// Opaque filter expression with positional arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub expr: String,
    pub args: Vec<Value>,
}

impl Filter {
    pub fn new(expr: impl Into<String>, args: impl Into<Vec<Value>>) -> Self {
        Self {
            expr: expr.into(),
            args: args.into(),
        }
    }
}

/// Equality lookup on a key, either the table's own primary key
/// (`index == None`) or a named secondary index.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub index: Option<String>,
    pub partition: (String, Value),
    pub sort: Option<(String, Value)>,
    pub filter: Option<Filter>,
}

impl Query {
    pub fn primary(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            index: None,
            partition: (name.into(), value.into()),
            sort: None,
            filter: None,
        }
    }

    pub fn on_index(
        index: impl Into<String>,
        name: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        Self {
            index: Some(index.into()),
            ..Self::primary(name, value)
        }
    }

    pub fn with_sort(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.sort = Some((name.into(), value.into()));
        self
    }

    pub fn with_filter(mut self, filter: Filter) -> Self {
        self.filter = Some(filter);
        self
    }
}

/// Precondition on the item currently stored under the written key.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Exists,
    NotExists,
    AttributeEquals(String, Value),
}

/// One member of an all-or-nothing batch.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionalPut {
    pub item: Item,
    pub condition: Option<Condition>,
}

impl ConditionalPut {
    pub fn new(item: Item, condition: Option<Condition>) -> Self {
        Self { item, condition }
    }
}

// ============================================================================
// TableService Trait
// ============================================================================

#[async_trait]
pub trait TableService: Send + Sync {
    /// Create a table. Creating an existing table succeeds.
    async fn create_table(&self, name: &str, schema: &TableSchema) -> Result<(), TableError>;

    /// Delete a table. Deleting a missing table succeeds.
    async fn delete_table(&self, name: &str) -> Result<(), TableError>;

    async fn add_index(&self, table: &str, index: &IndexSpec) -> Result<(), TableError>;

    async fn remove_index(&self, table: &str, index_name: &str) -> Result<(), TableError>;

    async fn get(&self, table: &str, key: &Key, consistent: bool)
        -> Result<Option<Item>, TableError>;

    async fn scan(
        &self,
        table: &str,
        consistent: bool,
        filter: Option<&Filter>,
    ) -> Result<Vec<Item>, TableError>;

    async fn query(&self, table: &str, query: &Query) -> Result<Vec<Item>, TableError>;

    /// Write an item. A failed condition returns `ConditionFailed`.
    async fn put(
        &self,
        table: &str,
        item: Item,
        condition: Option<Condition>,
    ) -> Result<(), TableError>;

    /// Write all items or none. Every item must share one partition.
    async fn transact_put(&self, table: &str, puts: Vec<ConditionalPut>)
        -> Result<(), TableError>;

    async fn delete(
        &self,
        table: &str,
        key: &Key,
        condition: Option<Condition>,
    ) -> Result<(), TableError>;
}

// ============================================================================
// Value Helpers
// ============================================================================

/// Equality where numbers compare by value (123 == 123.0).
pub(crate) fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => x.as_f64() == y.as_f64(),
        },
        _ => a == b,
    }
}

/// Ordering for scalar values of the same type, `None` otherwise.
pub(crate) fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
        },
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}
