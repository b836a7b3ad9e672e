use async_trait::async_trait;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use super::{
    values_equal, Condition, ConditionalPut, FilterExpr, IndexSpec, Item, Key, Query, TableError,
    TableSchema, TableService,
};

// ============================================================================
// In-Memory Table Service
// ============================================================================
//
// Holds every table in process. A single RwLock guards all tables, so each
// call (including a whole transact_put batch) is applied atomically with
// respect to every other call.
//
// Items are kept ordered by primary key, which makes scans return items in
// (partition, sort) order.
//
// ============================================================================

#[derive(Default)]
pub struct MemoryTableService {
    tables: RwLock<HashMap<String, MemoryTable>>,
}

struct MemoryTable {
    schema: TableSchema,
    indexes: HashMap<String, IndexSpec>,
    items: BTreeMap<StoredKey, Item>,
}

/// Totally ordered form of a key value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum KeyPart {
    Int(i64),
    Str(String),
    Other(String),
}

impl KeyPart {
    fn from_value(value: &Value) -> Self {
        match value {
            Value::Number(n) => match n.as_i64() {
                Some(i) => KeyPart::Int(i),
                None => KeyPart::Other(n.to_string()),
            },
            Value::String(s) => KeyPart::Str(s.clone()),
            other => KeyPart::Other(other.to_string()),
        }
    }
}

type StoredKey = (KeyPart, Option<KeyPart>);

impl MemoryTableService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of the tables that currently exist.
    pub async fn table_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

impl MemoryTable {
    fn stored_key(&self, key: &Key) -> Result<StoredKey, TableError> {
        if key.partition.0 != self.schema.partition_key.name {
            return Err(TableError::InvalidItem(format!(
                "{} is not the partition key",
                key.partition.0
            )));
        }
        let sort = match (&self.schema.sort_key, &key.sort) {
            (Some(expected), Some((name, value))) if *name == expected.name => {
                Some(KeyPart::from_value(value))
            }
            (None, None) => None,
            _ => {
                return Err(TableError::InvalidItem(
                    "key does not match the table's sort key".to_string(),
                ))
            }
        };
        Ok((KeyPart::from_value(&key.partition.1), sort))
    }

    fn item_key(&self, item: &Item) -> Result<StoredKey, TableError> {
        let key = self.schema.key_of(item)?;
        self.stored_key(&key)
    }

    fn check(&self, key: &StoredKey, condition: Option<&Condition>) -> Result<(), TableError> {
        let current = self.items.get(key);
        let holds = match condition {
            None => true,
            Some(Condition::Exists) => current.is_some(),
            Some(Condition::NotExists) => current.is_none(),
            Some(Condition::AttributeEquals(name, expected)) => current
                .and_then(|item| item.get(name))
                .is_some_and(|value| values_equal(value, expected)),
        };
        if holds {
            Ok(())
        } else {
            Err(TableError::ConditionFailed)
        }
    }
}

fn table<'a>(
    tables: &'a HashMap<String, MemoryTable>,
    name: &str,
) -> Result<&'a MemoryTable, TableError> {
    tables
        .get(name)
        .ok_or_else(|| TableError::TableNotFound(name.to_string()))
}

fn table_mut<'a>(
    tables: &'a mut HashMap<String, MemoryTable>,
    name: &str,
) -> Result<&'a mut MemoryTable, TableError> {
    tables
        .get_mut(name)
        .ok_or_else(|| TableError::TableNotFound(name.to_string()))
}

fn attribute_equals(item: &Item, name: &str, expected: &Value) -> bool {
    item.get(name).is_some_and(|value| values_equal(value, expected))
}

#[async_trait]
impl TableService for MemoryTableService {
    async fn create_table(&self, name: &str, schema: &TableSchema) -> Result<(), TableError> {
        let mut tables = self.tables.write().await;
        if let Some(existing) = tables.get(name) {
            if existing.schema.partition_key != schema.partition_key
                || existing.schema.sort_key != schema.sort_key
            {
                return Err(TableError::InvalidSchema(format!(
                    "table {name} exists with a different key"
                )));
            }
            return Ok(());
        }
        tables.insert(
            name.to_string(),
            MemoryTable {
                schema: schema.clone(),
                indexes: HashMap::new(),
                items: BTreeMap::new(),
            },
        );
        tracing::debug!(table = %name, "Created in-memory table");
        Ok(())
    }

    async fn delete_table(&self, name: &str) -> Result<(), TableError> {
        if self.tables.write().await.remove(name).is_some() {
            tracing::debug!(table = %name, "Deleted in-memory table");
        }
        Ok(())
    }

    async fn add_index(&self, table: &str, index: &IndexSpec) -> Result<(), TableError> {
        let mut tables = self.tables.write().await;
        let table = table_mut(&mut tables, table)?;
        table.indexes.insert(index.name.clone(), index.clone());
        Ok(())
    }

    async fn remove_index(&self, table: &str, index_name: &str) -> Result<(), TableError> {
        let mut tables = self.tables.write().await;
        let table = table_mut(&mut tables, table)?;
        table
            .indexes
            .remove(index_name)
            .map(|_| ())
            .ok_or_else(|| TableError::IndexNotFound(index_name.to_string()))
    }

    async fn get(
        &self,
        table: &str,
        key: &Key,
        _consistent: bool,
    ) -> Result<Option<Item>, TableError> {
        let tables = self.tables.read().await;
        let table = self::table(&tables, table)?;
        let key = table.stored_key(key)?;
        Ok(table.items.get(&key).cloned())
    }

    async fn scan(
        &self,
        table: &str,
        _consistent: bool,
        filter: Option<&super::Filter>,
    ) -> Result<Vec<Item>, TableError> {
        let filter = filter
            .map(|f| FilterExpr::parse(&f.expr, &f.args))
            .transpose()?;
        let tables = self.tables.read().await;
        let table = self::table(&tables, table)?;
        Ok(table
            .items
            .values()
            .filter(|item| filter.as_ref().map_or(true, |f| f.matches(item)))
            .cloned()
            .collect())
    }

    async fn query(&self, table: &str, query: &Query) -> Result<Vec<Item>, TableError> {
        let filter = query
            .filter
            .as_ref()
            .map(|f| FilterExpr::parse(&f.expr, &f.args))
            .transpose()?;
        let tables = self.tables.read().await;
        let table = self::table(&tables, table)?;

        let (partition_key, sort_key) = match &query.index {
            None => (
                table.schema.partition_key.name.clone(),
                table.schema.sort_key.as_ref().map(|k| k.name.clone()),
            ),
            Some(name) => {
                let index = table
                    .indexes
                    .get(name)
                    .ok_or_else(|| TableError::IndexNotFound(name.clone()))?;
                (
                    index.partition_key.name.clone(),
                    index.sort_key.as_ref().map(|k| k.name.clone()),
                )
            }
        };

        if query.partition.0 != partition_key {
            return Err(TableError::InvalidItem(format!(
                "{} is not the partition key of the queried index",
                query.partition.0
            )));
        }
        if let Some((name, _)) = &query.sort {
            if sort_key.as_deref() != Some(name.as_str()) {
                return Err(TableError::InvalidItem(format!(
                    "{name} is not the sort key of the queried index"
                )));
            }
        }

        let mut items: Vec<Item> = table
            .items
            .values()
            .filter(|item| attribute_equals(item, &query.partition.0, &query.partition.1))
            .filter(|item| {
                query
                    .sort
                    .as_ref()
                    .map_or(true, |(name, value)| attribute_equals(item, name, value))
            })
            .filter(|item| filter.as_ref().map_or(true, |f| f.matches(item)))
            .cloned()
            .collect();

        if let Some(sort_key) = sort_key {
            items.sort_by(|a, b| match (a.get(&sort_key), b.get(&sort_key)) {
                (Some(a), Some(b)) => super::compare_values(a, b).unwrap_or(Ordering::Equal),
                _ => Ordering::Equal,
            });
        }
        Ok(items)
    }

    async fn put(
        &self,
        table: &str,
        item: Item,
        condition: Option<Condition>,
    ) -> Result<(), TableError> {
        let mut tables = self.tables.write().await;
        let table = table_mut(&mut tables, table)?;
        let key = table.item_key(&item)?;
        table.check(&key, condition.as_ref())?;
        table.items.insert(key, item);
        Ok(())
    }

    async fn transact_put(
        &self,
        table: &str,
        puts: Vec<ConditionalPut>,
    ) -> Result<(), TableError> {
        let mut tables = self.tables.write().await;
        let table = table_mut(&mut tables, table)?;

        let mut staged: Vec<(StoredKey, Item)> = Vec::with_capacity(puts.len());
        for put in puts {
            let key = table.item_key(&put.item)?;
            if let Some((first, _)) = staged.first() {
                if first.0 != key.0 {
                    return Err(TableError::InvalidItem(
                        "batch spans more than one partition".to_string(),
                    ));
                }
            }
            table.check(&key, put.condition.as_ref())?;
            staged.push((key, put.item));
        }

        for (key, item) in staged {
            table.items.insert(key, item);
        }
        Ok(())
    }

    async fn delete(
        &self,
        table: &str,
        key: &Key,
        condition: Option<Condition>,
    ) -> Result<(), TableError> {
        let mut tables = self.tables.write().await;
        let table = table_mut(&mut tables, table)?;
        let key = table.stored_key(key)?;
        table.check(&key, condition.as_ref())?;
        table.items.remove(&key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{marshal::to_item, AttributeType, Filter, KeyAttribute};
    use serde_json::json;

    fn events_schema() -> TableSchema {
        TableSchema::new(KeyAttribute::new("AggregateID", AttributeType::String))
            .with_sort_key(KeyAttribute::new("Version", AttributeType::Number))
    }

    fn item(value: Value) -> Item {
        to_item(&value).unwrap()
    }

    #[tokio::test]
    async fn test_create_table_is_idempotent() {
        let service = MemoryTableService::new();
        service.create_table("t", &events_schema()).await.unwrap();
        service
            .put("t", item(json!({"AggregateID": "a", "Version": 1})), None)
            .await
            .unwrap();

        service.create_table("t", &events_schema()).await.unwrap();
        assert_eq!(service.scan("t", true, None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_operations_on_deleted_table_fail() {
        let service = MemoryTableService::new();
        service.create_table("t", &events_schema()).await.unwrap();
        service.delete_table("t").await.unwrap();
        service.delete_table("t").await.unwrap();

        let result = service.scan("t", true, None).await;
        assert!(matches!(result, Err(TableError::TableNotFound(_))));
    }

    #[tokio::test]
    async fn test_conditions() {
        let service = MemoryTableService::new();
        service.create_table("t", &events_schema()).await.unwrap();
        let first = item(json!({"AggregateID": "a", "Version": 1, "N": 1}));

        service
            .put("t", first.clone(), Some(Condition::NotExists))
            .await
            .unwrap();
        let again = service.put("t", first, Some(Condition::NotExists)).await;
        assert!(matches!(again, Err(TableError::ConditionFailed)));

        let update = item(json!({"AggregateID": "a", "Version": 1, "N": 2}));
        let stale = service
            .put("t", update.clone(), Some(Condition::AttributeEquals("N".into(), json!(5))))
            .await;
        assert!(matches!(stale, Err(TableError::ConditionFailed)));
        service
            .put("t", update, Some(Condition::AttributeEquals("N".into(), json!(1))))
            .await
            .unwrap();

        let missing = Key::partition("AggregateID", "b").with_sort("Version", 1);
        let result = service.delete("t", &missing, Some(Condition::Exists)).await;
        assert!(matches!(result, Err(TableError::ConditionFailed)));
    }

    #[tokio::test]
    async fn test_transact_put_is_all_or_nothing() {
        let service = MemoryTableService::new();
        service.create_table("t", &events_schema()).await.unwrap();
        service
            .put("t", item(json!({"AggregateID": "a", "Version": 2})), None)
            .await
            .unwrap();

        let puts = vec![
            ConditionalPut::new(
                item(json!({"AggregateID": "a", "Version": 1})),
                Some(Condition::NotExists),
            ),
            ConditionalPut::new(
                item(json!({"AggregateID": "a", "Version": 2})),
                Some(Condition::NotExists),
            ),
        ];
        let result = service.transact_put("t", puts).await;
        assert!(matches!(result, Err(TableError::ConditionFailed)));

        let items = service.scan("t", true, None).await.unwrap();
        assert_eq!(items.len(), 1);
    }

    #[tokio::test]
    async fn test_query_by_index_with_filter() {
        let service = MemoryTableService::new();
        let schema = TableSchema::new(KeyAttribute::new("ID", AttributeType::String));
        service.create_table("t", &schema).await.unwrap();
        service
            .add_index(
                "t",
                &IndexSpec::new("by_group", KeyAttribute::new("Group", AttributeType::Number)),
            )
            .await
            .unwrap();

        for (id, group, value) in [("1", 1, "x"), ("2", 1, "y"), ("3", 2, "x")] {
            service
                .put("t", item(json!({"ID": id, "Group": group, "Value": value})), None)
                .await
                .unwrap();
        }

        let query = Query::on_index("by_group", "Group", 1)
            .with_filter(Filter::new("Value = ?", vec![json!("x")]));
        let items = service.query("t", &query).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].get("ID"), Some(&json!("1")));

        let unknown = service.query("t", &Query::on_index("nope", "Group", 1)).await;
        assert!(matches!(unknown, Err(TableError::IndexNotFound(_))));
    }
}
