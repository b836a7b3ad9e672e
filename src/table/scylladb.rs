use async_trait::async_trait;
use futures_util::TryStreamExt;
use scylla::client::session::Session;
use scylla::client::session_builder::SessionBuilder;
use scylla::statement::batch::Batch;
use scylla::statement::unprepared::Statement;
use scylla::statement::Consistency;
use scylla::value::{CqlValue, Row};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::{
    Condition, ConditionalPut, Filter, IndexSpec, Item, Key, KeyAttribute, AttributeType, Query,
    TableError, TableSchema, TableService,
};
use crate::config::ScyllaConfig;
use crate::context::DEFAULT_NAMESPACE;
use crate::error::{ErrorKind, StoreError};

// ============================================================================
// ScyllaDB Table Service
// ============================================================================
//
// Row layout for a table:
//
//   <partition key>, [<sort key>], <declared attributes...>, doc text
//
// `doc` holds the whole item as JSON; key and declared attribute columns are
// typed copies used for addressing, filtering and indexing. Column names are
// unquoted, so CQL folds them to lower case and filter expressions written
// against attribute names (`Content = ?`) resolve without rewriting.
//
// Conditional writes are lightweight transactions. A transact_put batch is a
// single-partition conditional batch, which Scylla applies all-or-nothing.
//
// Schemas and index definitions are persisted as JSON in the keyspace's
// `tablestore_catalog` table, one row per table plus one per index, and
// cached in process. A cache miss reloads from the catalog, so tables and
// indexes created by another process are usable without re-registering them.
//
// ============================================================================

type Values = Vec<Option<CqlValue>>;

const DOC_COLUMN: &str = "doc";
const CATALOG_TABLE: &str = "tablestore_catalog";
/// Catalog entry holding the table schema; other entries are index names.
const SCHEMA_ENTRY: &str = "#schema";

pub struct ScyllaTableService {
    session: Arc<Session>,
    catalog: RwLock<HashMap<String, TableEntry>>,
}

#[derive(Clone, Debug, PartialEq)]
struct TableEntry {
    schema: TableSchema,
    indexes: HashMap<String, IndexSpec>,
}

impl ScyllaTableService {
    /// Connect to the cluster and switch to the configured keyspace,
    /// creating it when missing.
    pub async fn connect(config: &ScyllaConfig) -> Result<Self, StoreError> {
        let dial = |err: TableError| {
            StoreError::new(ErrorKind::DialFailure, DEFAULT_NAMESPACE).with_source(err)
        };

        tracing::info!(nodes = ?config.nodes, keyspace = %config.keyspace, "Connecting to ScyllaDB...");
        let session: Session = SessionBuilder::new()
            .known_nodes(&config.nodes)
            .build()
            .await
            .map_err(|e| dial(TableError::backend(e)))?;

        check_identifier(&config.keyspace).map_err(dial)?;
        session
            .query_unpaged(
                format!(
                    "CREATE KEYSPACE IF NOT EXISTS {} WITH REPLICATION = \
                     {{'class': 'SimpleStrategy', 'replication_factor': {}}}",
                    config.keyspace, config.replication_factor
                ),
                (),
            )
            .await
            .map_err(|e| dial(TableError::backend(e)))?;
        session
            .use_keyspace(&config.keyspace, false)
            .await
            .map_err(|e| dial(TableError::backend(e)))?;

        let service = Self::from_session(Arc::new(session));
        service.ensure_catalog().await.map_err(dial)?;
        Ok(service)
    }

    /// Wrap a session already switched to its keyspace. Call
    /// `ensure_catalog` once before use unless the keyspace was prepared by
    /// `connect`.
    pub fn from_session(session: Arc<Session>) -> Self {
        Self {
            session,
            catalog: RwLock::new(HashMap::new()),
        }
    }

    /// Create the catalog table of the current keyspace. Idempotent.
    pub async fn ensure_catalog(&self) -> Result<(), TableError> {
        self.session
            .query_unpaged(
                format!(
                    "CREATE TABLE IF NOT EXISTS {CATALOG_TABLE} \
                     (table_name text, entry text, spec text, PRIMARY KEY ((table_name), entry))"
                ),
                (),
            )
            .await
            .map_err(TableError::backend)?;
        Ok(())
    }

    /// Make an existing table known to this service without issuing DDL.
    pub async fn register_table(&self, name: &str, schema: TableSchema) {
        self.catalog.write().await.insert(
            name.to_string(),
            TableEntry {
                schema,
                indexes: HashMap::new(),
            },
        );
    }

    async fn entry(&self, table: &str) -> Result<TableEntry, TableError> {
        if let Some(entry) = self.catalog.read().await.get(table) {
            return Ok(entry.clone());
        }
        self.reload(table).await
    }

    /// Replace the cached entry of `table` with the persisted one.
    async fn reload(&self, table: &str) -> Result<TableEntry, TableError> {
        let mut statement = Statement::new(format!(
            "SELECT entry, spec FROM {CATALOG_TABLE} WHERE table_name = ?"
        ));
        statement.set_consistency(Consistency::Quorum);
        let pager = self
            .session
            .query_iter(statement, (table,))
            .await
            .map_err(TableError::backend)?;
        let rows: Vec<(String, String)> = pager
            .rows_stream::<(String, String)>()
            .map_err(TableError::backend)?
            .try_collect()
            .await
            .map_err(TableError::backend)?;

        let entry = entry_from_rows(rows)?
            .ok_or_else(|| TableError::TableNotFound(table.to_string()))?;
        tracing::debug!(table = %table, indexes = entry.indexes.len(), "Loaded table from catalog");
        self.catalog
            .write()
            .await
            .insert(table.to_string(), entry.clone());
        Ok(entry)
    }

    async fn persist(&self, table: &str, entry: &str, spec: String, if_absent: bool) -> Result<(), TableError> {
        let mut statement = Statement::new(format!(
            "INSERT INTO {CATALOG_TABLE} (table_name, entry, spec) VALUES (?, ?, ?){}",
            if if_absent { " IF NOT EXISTS" } else { "" }
        ));
        statement.set_consistency(Consistency::Quorum);
        self.session
            .query_unpaged(statement, (table, entry, spec))
            .await
            .map_err(TableError::backend)?;
        Ok(())
    }

    async fn forget(&self, table: &str, entry: Option<&str>) -> Result<(), TableError> {
        let result = match entry {
            Some(entry) => {
                self.session
                    .query_unpaged(
                        format!("DELETE FROM {CATALOG_TABLE} WHERE table_name = ? AND entry = ?"),
                        (table, entry),
                    )
                    .await
            }
            None => {
                self.session
                    .query_unpaged(
                        format!("DELETE FROM {CATALOG_TABLE} WHERE table_name = ?"),
                        (table,),
                    )
                    .await
            }
        };
        result.map_err(TableError::backend)?;
        Ok(())
    }

    async fn select_docs(&self, statement: Statement, values: Values) -> Result<Vec<Item>, TableError> {
        let pager = self
            .session
            .query_iter(statement, values)
            .await
            .map_err(TableError::backend)?;
        let mut rows = pager.rows_stream::<(String,)>().map_err(TableError::backend)?;

        let mut items = Vec::new();
        while let Some((doc,)) = rows.try_next().await.map_err(TableError::backend)? {
            items.push(parse_doc(&doc)?);
        }
        Ok(items)
    }

    async fn execute_conditional(&self, statement: Statement, values: Values) -> Result<(), TableError> {
        let result = self
            .session
            .query_unpaged(statement, values)
            .await
            .map_err(TableError::backend)?;
        check_applied(result)
    }
}

// ============================================================================
// Schema Helpers
// ============================================================================

fn check_identifier(name: &str) -> Result<(), TableError> {
    let mut chars = name.chars();
    let valid = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    let reserved = name.eq_ignore_ascii_case(DOC_COLUMN) || name.eq_ignore_ascii_case(CATALOG_TABLE);
    if valid && !reserved {
        Ok(())
    } else {
        Err(TableError::InvalidSchema(format!("{name:?} is not a usable CQL identifier")))
    }
}

fn cql_type(kind: AttributeType) -> &'static str {
    match kind {
        AttributeType::String => "text",
        AttributeType::Number => "bigint",
        AttributeType::Float => "double",
        AttributeType::Bool => "boolean",
    }
}

/// Every typed column of the table, keys first.
fn columns(schema: &TableSchema) -> Vec<&KeyAttribute> {
    let mut columns = vec![&schema.partition_key];
    columns.extend(schema.sort_key.iter());
    columns.extend(schema.attributes.iter());
    columns
}

fn is_key(schema: &TableSchema, name: &str) -> bool {
    schema.partition_key.name == name
        || schema.sort_key.as_ref().is_some_and(|k| k.name == name)
}

fn attribute<'a>(schema: &'a TableSchema, name: &str) -> Result<&'a KeyAttribute, TableError> {
    columns(schema)
        .into_iter()
        .find(|column| column.name == name)
        .ok_or_else(|| TableError::InvalidSchema(format!("{name} is not a declared attribute")))
}

fn create_table_cql(name: &str, schema: &TableSchema) -> Result<String, TableError> {
    check_identifier(name)?;
    let mut definitions = Vec::new();
    for column in columns(schema) {
        check_identifier(&column.name)?;
        definitions.push(format!("{} {}", column.name, cql_type(column.kind)));
    }
    definitions.push(format!("{DOC_COLUMN} text"));

    let primary_key = match &schema.sort_key {
        Some(sort_key) => format!("(({}), {})", schema.partition_key.name, sort_key.name),
        None => format!("(({}))", schema.partition_key.name),
    };
    Ok(format!(
        "CREATE TABLE IF NOT EXISTS {name} ({}, PRIMARY KEY {primary_key})",
        definitions.join(", ")
    ))
}

fn index_name(table: &str, index: &str) -> String {
    format!("{table}_{index}")
}

/// Rebuild a table entry from its catalog rows. No schema row means the
/// table is unknown.
fn entry_from_rows(rows: Vec<(String, String)>) -> Result<Option<TableEntry>, TableError> {
    let mut schema = None;
    let mut indexes = HashMap::new();
    for (entry, spec) in rows {
        if entry == SCHEMA_ENTRY {
            schema = Some(serde_json::from_str::<TableSchema>(&spec)?);
        } else {
            indexes.insert(entry, serde_json::from_str::<IndexSpec>(&spec)?);
        }
    }
    Ok(schema.map(|schema| TableEntry { schema, indexes }))
}

// ============================================================================
// Value Conversion
// ============================================================================

fn typed_value(kind: AttributeType, value: &Value) -> Result<Option<CqlValue>, TableError> {
    let converted = match (kind, value) {
        (_, Value::Null) => return Ok(None),
        (AttributeType::String, Value::String(s)) => Some(CqlValue::Text(s.clone())),
        (AttributeType::Number, Value::Number(n)) => n.as_i64().map(CqlValue::BigInt),
        (AttributeType::Float, Value::Number(n)) => n.as_f64().map(CqlValue::Double),
        (AttributeType::Bool, Value::Bool(b)) => Some(CqlValue::Boolean(*b)),
        _ => None,
    };
    converted
        .map(Some)
        .ok_or_else(|| TableError::InvalidItem(format!("{value} does not fit a {kind:?} column")))
}

/// Bind a positional filter argument by its JSON type.
fn argument_value(value: &Value) -> Option<CqlValue> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(CqlValue::Boolean(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Some(CqlValue::BigInt(i)),
            None => n.as_f64().map(CqlValue::Double),
        },
        Value::String(s) => Some(CqlValue::Text(s.clone())),
        other => Some(CqlValue::Text(other.to_string())),
    }
}

fn column_value(schema: &TableSchema, name: &str, value: &Value) -> Result<Option<CqlValue>, TableError> {
    typed_value(attribute(schema, name)?.kind, value)
}

fn item_values(schema: &TableSchema, item: &Item) -> Result<Vec<(String, Option<CqlValue>)>, TableError> {
    let mut values = Vec::new();
    for column in columns(schema) {
        let value = item.get(&column.name).unwrap_or(&Value::Null);
        values.push((column.name.clone(), typed_value(column.kind, value)?));
    }
    let doc = serde_json::to_string(item)?;
    values.push((DOC_COLUMN.to_string(), Some(CqlValue::Text(doc))));
    Ok(values)
}

fn parse_doc(doc: &str) -> Result<Item, TableError> {
    match serde_json::from_str(doc)? {
        Value::Object(item) => Ok(item),
        _ => Err(TableError::InvalidItem("stored document is not an object".to_string())),
    }
}

fn key_clause(schema: &TableSchema, key: &Key) -> Result<(String, Values), TableError> {
    let mut clause = format!("{} = ?", key.partition.0);
    let mut values = vec![column_value(schema, &key.partition.0, &key.partition.1)?];
    if let Some((name, value)) = &key.sort {
        clause.push_str(&format!(" AND {name} = ?"));
        values.push(column_value(schema, name, value)?);
    }
    Ok((clause, values))
}

fn consistency(consistent: bool) -> Consistency {
    if consistent {
        Consistency::Quorum
    } else {
        Consistency::One
    }
}

fn check_applied(result: scylla::response::query_result::QueryResult) -> Result<(), TableError> {
    let rows = result.into_rows_result().map_err(TableError::backend)?;
    let first = rows.maybe_first_row::<Row>().map_err(TableError::backend)?;
    match first.as_ref().and_then(|row| row.columns.first()) {
        Some(Some(CqlValue::Boolean(true))) => Ok(()),
        _ => Err(TableError::ConditionFailed),
    }
}

fn scan_statement(table: &str, filter: Option<&Filter>) -> (String, Values) {
    match filter {
        Some(filter) => (
            format!(
                "SELECT {DOC_COLUMN} FROM {table} WHERE {} ALLOW FILTERING",
                filter.expr
            ),
            filter.args.iter().map(argument_value).collect(),
        ),
        None => (format!("SELECT {DOC_COLUMN} FROM {table}"), Vec::new()),
    }
}

/// Equality on the partition (and sort) attribute, followed by the caller's
/// filter as further relations.
fn query_statement(table: &str, schema: &TableSchema, query: &Query) -> Result<(String, Values), TableError> {
    let mut clauses = vec![format!("{} = ?", query.partition.0)];
    let mut values = vec![column_value(schema, &query.partition.0, &query.partition.1)?];
    if let Some((name, value)) = &query.sort {
        clauses.push(format!("{name} = ?"));
        values.push(column_value(schema, name, value)?);
    }
    if let Some(filter) = &query.filter {
        clauses.push(filter.expr.clone());
        values.extend(filter.args.iter().map(argument_value));
    }

    let needs_filtering = query.index.is_some() || query.filter.is_some();
    Ok((
        format!(
            "SELECT {DOC_COLUMN} FROM {table} WHERE {}{}",
            clauses.join(" AND "),
            if needs_filtering { " ALLOW FILTERING" } else { "" }
        ),
        values,
    ))
}

/// Statement text and bound values for one write.
fn write_statement(
    table: &str,
    schema: &TableSchema,
    item: &Item,
    condition: Option<&Condition>,
) -> Result<(String, Values), TableError> {
    let values = item_values(schema, item)?;

    let update = |suffix: String, mut extra: Values| -> Result<(String, Values), TableError> {
        let key = schema.key_of(item)?;
        let (where_clause, key_values) = key_clause(schema, &key)?;
        let (assignments, mut bound): (Vec<String>, Values) = values
            .iter()
            .filter(|(name, _)| !is_key(schema, name))
            .map(|(name, value)| (format!("{name} = ?"), value.clone()))
            .unzip();
        bound.extend(key_values);
        bound.append(&mut extra);
        Ok((
            format!(
                "UPDATE {table} SET {} WHERE {where_clause} {suffix}",
                assignments.join(", ")
            ),
            bound,
        ))
    };

    match condition {
        None | Some(Condition::NotExists) => {
            let names: Vec<&str> = values.iter().map(|(name, _)| name.as_str()).collect();
            let placeholders = vec!["?"; names.len()].join(", ");
            let suffix = if condition.is_some() { " IF NOT EXISTS" } else { "" };
            Ok((
                format!(
                    "INSERT INTO {table} ({}) VALUES ({placeholders}){suffix}",
                    names.join(", ")
                ),
                values.into_iter().map(|(_, value)| value).collect(),
            ))
        }
        Some(Condition::Exists) => update("IF EXISTS".to_string(), Vec::new()),
        Some(Condition::AttributeEquals(name, expected)) => {
            let value = column_value(schema, name, expected)?;
            update(format!("IF {name} = ?"), vec![value])
        }
    }
}

#[async_trait]
impl TableService for ScyllaTableService {
    async fn create_table(&self, name: &str, schema: &TableSchema) -> Result<(), TableError> {
        let cql = create_table_cql(name, schema)?;
        self.session
            .query_unpaged(cql, ())
            .await
            .map_err(TableError::backend)?;
        // An existing table keeps the schema it was created with.
        self.persist(name, SCHEMA_ENTRY, serde_json::to_string(schema)?, true)
            .await?;
        self.reload(name).await?;
        tracing::info!(table = %name, "Created table");
        Ok(())
    }

    async fn delete_table(&self, name: &str) -> Result<(), TableError> {
        check_identifier(name)?;
        self.session
            .query_unpaged(format!("DROP TABLE IF EXISTS {name}"), ())
            .await
            .map_err(TableError::backend)?;
        self.forget(name, None).await?;
        self.catalog.write().await.remove(name);
        tracing::info!(table = %name, "Dropped table");
        Ok(())
    }

    async fn add_index(&self, table: &str, index: &IndexSpec) -> Result<(), TableError> {
        let entry = self.entry(table).await?;
        check_identifier(&index.name)?;
        attribute(&entry.schema, &index.partition_key.name)?;
        if let Some(sort_key) = &index.sort_key {
            attribute(&entry.schema, &sort_key.name)?;
        }

        // Scylla indexes a single column; the sort key is applied as a filter.
        let cql = format!(
            "CREATE INDEX IF NOT EXISTS {} ON {table} ({})",
            index_name(table, &index.name),
            index.partition_key.name
        );
        self.session
            .query_unpaged(cql, ())
            .await
            .map_err(TableError::backend)?;
        self.persist(table, &index.name, serde_json::to_string(index)?, false)
            .await?;

        if let Some(entry) = self.catalog.write().await.get_mut(table) {
            entry.indexes.insert(index.name.clone(), index.clone());
        }
        Ok(())
    }

    async fn remove_index(&self, table: &str, index: &str) -> Result<(), TableError> {
        check_identifier(index)?;
        self.session
            .query_unpaged(
                format!("DROP INDEX IF EXISTS {}", index_name(table, index)),
                (),
            )
            .await
            .map_err(TableError::backend)?;
        self.forget(table, Some(index)).await?;
        if let Some(entry) = self.catalog.write().await.get_mut(table) {
            entry.indexes.remove(index);
        }
        Ok(())
    }

    async fn get(&self, table: &str, key: &Key, consistent: bool) -> Result<Option<Item>, TableError> {
        let entry = self.entry(table).await?;
        let (where_clause, values) = key_clause(&entry.schema, key)?;

        let mut statement = Statement::new(format!(
            "SELECT {DOC_COLUMN} FROM {table} WHERE {where_clause}"
        ));
        statement.set_consistency(consistency(consistent));

        let result = self
            .session
            .query_unpaged(statement, values)
            .await
            .map_err(TableError::backend)?;
        let rows = result.into_rows_result().map_err(TableError::backend)?;
        match rows.maybe_first_row::<(String,)>().map_err(TableError::backend)? {
            Some((doc,)) => Ok(Some(parse_doc(&doc)?)),
            None => Ok(None),
        }
    }

    async fn scan(
        &self,
        table: &str,
        consistent: bool,
        filter: Option<&Filter>,
    ) -> Result<Vec<Item>, TableError> {
        self.entry(table).await?;
        let (cql, values) = scan_statement(table, filter);

        let mut statement = Statement::new(cql);
        statement.set_consistency(consistency(consistent));
        self.select_docs(statement, values).await
    }

    async fn query(&self, table: &str, query: &Query) -> Result<Vec<Item>, TableError> {
        let mut entry = self.entry(table).await?;
        if let Some(index) = &query.index {
            // Another process may have added the index since it was cached.
            if !entry.indexes.contains_key(index) {
                entry = self.reload(table).await?;
            }
            if !entry.indexes.contains_key(index) {
                return Err(TableError::IndexNotFound(index.clone()));
            }
        }

        let (cql, values) = query_statement(table, &entry.schema, query)?;
        let mut statement = Statement::new(cql);
        statement.set_consistency(Consistency::Quorum);
        self.select_docs(statement, values).await
    }

    async fn put(
        &self,
        table: &str,
        item: Item,
        condition: Option<Condition>,
    ) -> Result<(), TableError> {
        let entry = self.entry(table).await?;
        let (cql, values) = write_statement(table, &entry.schema, &item, condition.as_ref())?;
        let mut statement = Statement::new(cql);
        statement.set_consistency(Consistency::Quorum);

        if condition.is_some() {
            return self.execute_conditional(statement, values).await;
        }
        self.session
            .query_unpaged(statement, values)
            .await
            .map_err(TableError::backend)?;
        Ok(())
    }

    async fn transact_put(&self, table: &str, puts: Vec<ConditionalPut>) -> Result<(), TableError> {
        let entry = self.entry(table).await?;
        let conditional = puts.iter().any(|put| put.condition.is_some());

        let mut batch = Batch::default();
        batch.set_consistency(Consistency::Quorum);
        let mut batch_values: Vec<Values> = Vec::with_capacity(puts.len());
        let mut partition: Option<&Value> = None;

        for put in &puts {
            let key = put
                .item
                .get(&entry.schema.partition_key.name)
                .ok_or_else(|| TableError::InvalidItem("missing partition key".to_string()))?;
            if partition.is_some_and(|p| p != key) {
                return Err(TableError::InvalidItem(
                    "batch spans more than one partition".to_string(),
                ));
            }
            partition = Some(key);

            let (cql, values) =
                write_statement(table, &entry.schema, &put.item, put.condition.as_ref())?;
            batch.append_statement(cql.as_str());
            batch_values.push(values);
        }

        let result = self
            .session
            .batch(&batch, batch_values)
            .await
            .map_err(TableError::backend)?;
        if conditional {
            check_applied(result)?;
        }
        Ok(())
    }

    async fn delete(
        &self,
        table: &str,
        key: &Key,
        condition: Option<Condition>,
    ) -> Result<(), TableError> {
        let entry = self.entry(table).await?;
        let (where_clause, mut values) = key_clause(&entry.schema, key)?;
        let suffix = match &condition {
            None => String::new(),
            Some(Condition::Exists) => " IF EXISTS".to_string(),
            Some(Condition::AttributeEquals(name, expected)) => {
                values.push(column_value(&entry.schema, name, expected)?);
                format!(" IF {name} = ?")
            }
            Some(Condition::NotExists) => {
                return Err(TableError::InvalidItem(
                    "a delete cannot require the item to be absent".to_string(),
                ))
            }
        };

        let mut statement = Statement::new(format!("DELETE FROM {table} WHERE {where_clause}{suffix}"));
        statement.set_consistency(Consistency::Quorum);
        if condition.is_some() {
            return self.execute_conditional(statement, values).await;
        }
        self.session
            .query_unpaged(statement, values)
            .await
            .map_err(TableError::backend)?;
        Ok(())
    }
}
