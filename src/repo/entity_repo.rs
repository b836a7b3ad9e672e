use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use uuid::Uuid;

use crate::config::RepoConfig;
use crate::context::Context;
use crate::error::{ErrorKind, Result, StoreError};
use crate::namespace::NamespaceRouter;
use crate::table::{
    marshal, AttributeType, Condition, Filter, IndexSpec, Item, Key, KeyAttribute, Query,
    TableError, TableSchema, TableService,
};

/// A record the repository can persist.
pub trait Entity: Serialize + Send + Sync {
    fn entity_id(&self) -> Uuid;
}

/// Turns a stored item into a concrete entity.
pub type EntityFactory<E> = Arc<dyn Fn(Item) -> std::result::Result<E, TableError> + Send + Sync>;

/// Factory decoding items with serde.
pub fn entity_factory<E>() -> EntityFactory<E>
where
    E: DeserializeOwned + 'static,
{
    Arc::new(|item: Item| marshal::from_item::<E>(item))
}

/// Equality lookup on a secondary index partition, optionally narrowed to
/// one sort key value.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexQuery {
    pub index_name: String,
    pub partition_key: (String, Value),
    pub sort_key: Option<(String, Value)>,
}

impl IndexQuery {
    pub fn new(
        index_name: impl Into<String>,
        partition_key: impl Into<String>,
        partition_value: impl Into<Value>,
    ) -> Self {
        Self {
            index_name: index_name.into(),
            partition_key: (partition_key.into(), partition_value.into()),
            sort_key: None,
        }
    }

    pub fn with_sort_key(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.sort_key = Some((name.into(), value.into()));
        self
    }
}

#[async_trait]
pub trait ReadRepo<E>: Send + Sync {
    /// The repository this one reads through, if any.
    fn parent(&self) -> Option<&dyn ReadRepo<E>>;

    async fn find(&self, ctx: &Context, id: Uuid) -> Result<E>;

    async fn find_all(&self, ctx: &Context) -> Result<Vec<E>>;
}

#[async_trait]
pub trait WriteRepo<E>: Send + Sync {
    async fn save(&self, ctx: &Context, entity: &E) -> Result<()>;

    async fn remove(&self, ctx: &Context, id: Uuid) -> Result<()>;
}

// ============================================================================
// Repo
// ============================================================================

/// Entities of one kind. The default namespace lives in `table_name`; any
/// other namespace lives in `table_name_<namespace>`.
pub struct Repo<E> {
    service: Arc<dyn TableService>,
    config: RepoConfig,
    router: NamespaceRouter,
    factory: Option<EntityFactory<E>>,
}

impl<E: Entity + 'static> Repo<E> {
    pub fn new(service: Arc<dyn TableService>, mut config: RepoConfig) -> Self {
        config.provide_defaults();
        Self {
            service,
            router: NamespaceRouter::with_default_table(config.table_name.clone()),
            config,
            factory: None,
        }
    }

    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    pub fn router(&self) -> &NamespaceRouter {
        &self.router
    }

    /// Install the factory used to materialize entities on every read.
    pub fn set_entity_factory(&mut self, factory: EntityFactory<E>) {
        self.factory = Some(factory);
    }

    pub fn clear_entity_factory(&mut self) {
        self.factory = None;
    }

    /// Table layout: the identifier as partition key plus any attributes that
    /// filters or indexes will address.
    pub fn schema(&self, attributes: &[KeyAttribute]) -> TableSchema {
        attributes.iter().cloned().fold(
            TableSchema::new(KeyAttribute::new(&self.config.id_attribute, AttributeType::String)),
            TableSchema::with_attribute,
        )
    }

    pub async fn create_table(&self, ctx: &Context, attributes: &[KeyAttribute]) -> Result<()> {
        let table = self.router.table_name(ctx)?;
        let schema = self.schema(attributes);
        ctx.run(self.service.create_table(&table, &schema))
            .await
            .map_err(|e| StoreError::from_table(ErrorKind::SaveFailed, ctx.namespace(), e))?;
        tracing::info!(table = %table, namespace = %ctx.namespace(), "Entity table ready");
        Ok(())
    }

    pub async fn delete_table(&self, ctx: &Context) -> Result<()> {
        let table = self.router.table_name(ctx)?;
        ctx.run(self.service.delete_table(&table))
            .await
            .map_err(|e| StoreError::from_table(ErrorKind::SaveFailed, ctx.namespace(), e))
    }

    pub async fn add_index(&self, ctx: &Context, index: &IndexSpec) -> Result<()> {
        let table = self.router.table_name(ctx)?;
        ctx.run(self.service.add_index(&table, index))
            .await
            .map_err(|e| StoreError::from_table(ErrorKind::SaveFailed, ctx.namespace(), e))
    }

    pub async fn remove_index(&self, ctx: &Context, index_name: &str) -> Result<()> {
        let table = self.router.table_name(ctx)?;
        ctx.run(self.service.remove_index(&table, index_name))
            .await
            .map_err(|e| StoreError::from_table(ErrorKind::SaveFailed, ctx.namespace(), e))
    }

    /// Scan with an opaque filter expression. `expr` and `args` reach the
    /// table service unmodified.
    pub async fn find_with_filter(&self, ctx: &Context, expr: &str, args: &[Value]) -> Result<Vec<E>> {
        let factory = self.factory(ctx)?;
        let table = self.router.table_name(ctx)?;
        let filter = Filter::new(expr, args.to_vec());
        let items = ctx
            .run(self.service.scan(&table, true, Some(&filter)))
            .await
            .map_err(|e| StoreError::from_table(ErrorKind::QueryFailed, ctx.namespace(), e))?;
        materialize(ctx, factory, items)
    }

    /// Query one partition of a secondary index, then apply the filter.
    pub async fn find_with_filter_using_index(
        &self,
        ctx: &Context,
        index: &IndexQuery,
        expr: &str,
        args: &[Value],
    ) -> Result<Vec<E>> {
        let factory = self.factory(ctx)?;
        let table = self.router.table_name(ctx)?;
        let (name, value) = &index.partition_key;
        let mut query = Query::on_index(&index.index_name, name, value.clone());
        if let Some((name, value)) = &index.sort_key {
            query = query.with_sort(name, value.clone());
        }
        if !expr.is_empty() {
            query = query.with_filter(Filter::new(expr, args.to_vec()));
        }

        let items = ctx
            .run(self.service.query(&table, &query))
            .await
            .map_err(|e| StoreError::from_table(ErrorKind::QueryFailed, ctx.namespace(), e))?;
        tracing::debug!(
            table = %table,
            index = %index.index_name,
            count = items.len(),
            "Queried index"
        );
        materialize(ctx, factory, items)
    }

    fn factory(&self, ctx: &Context) -> Result<&EntityFactory<E>> {
        self.factory
            .as_ref()
            .ok_or_else(|| StoreError::new(ErrorKind::ModelNotConfigured, ctx.namespace()))
    }

    fn key(&self, id: Uuid) -> Key {
        Key::partition(&self.config.id_attribute, id.to_string())
    }
}

fn materialize<E>(ctx: &Context, factory: &EntityFactory<E>, items: Vec<Item>) -> Result<Vec<E>> {
    items
        .into_iter()
        .map(|item| {
            factory(item).map_err(|e| StoreError::new(ErrorKind::QueryFailed, ctx.namespace()).with_source(e))
        })
        .collect()
}

#[async_trait]
impl<E: Entity + 'static> ReadRepo<E> for Repo<E> {
    fn parent(&self) -> Option<&dyn ReadRepo<E>> {
        None
    }

    async fn find(&self, ctx: &Context, id: Uuid) -> Result<E> {
        let factory = self.factory(ctx)?;
        let table = self.router.table_name(ctx)?;
        let item = ctx
            .run(self.service.get(&table, &self.key(id), true))
            .await
            .map_err(|e| StoreError::from_table(ErrorKind::QueryFailed, ctx.namespace(), e))?
            .ok_or_else(|| StoreError::new(ErrorKind::NotFound, ctx.namespace()))?;

        factory(item).map_err(|e| StoreError::new(ErrorKind::QueryFailed, ctx.namespace()).with_source(e))
    }

    async fn find_all(&self, ctx: &Context) -> Result<Vec<E>> {
        let factory = self.factory(ctx)?;
        let table = self.router.table_name(ctx)?;
        let items = ctx
            .run(self.service.scan(&table, true, None))
            .await
            .map_err(|e| StoreError::from_table(ErrorKind::QueryFailed, ctx.namespace(), e))?;
        materialize(ctx, factory, items)
    }
}

#[async_trait]
impl<E: Entity + 'static> WriteRepo<E> for Repo<E> {
    async fn save(&self, ctx: &Context, entity: &E) -> Result<()> {
        let id = entity.entity_id();
        if id.is_nil() {
            return Err(StoreError::new(ErrorKind::MissingId, ctx.namespace()));
        }
        let table = self.router.table_name(ctx)?;

        let mut item = marshal::to_item(entity)
            .map_err(|e| StoreError::new(ErrorKind::SaveFailed, ctx.namespace()).with_source(e))?;
        item.insert(self.config.id_attribute.clone(), Value::String(id.to_string()));

        ctx.run(self.service.put(&table, item, None))
            .await
            .map_err(|e| StoreError::new(ErrorKind::SaveFailed, ctx.namespace()).with_source(e))?;

        tracing::debug!(table = %table, entity_id = %id, "Saved entity");
        Ok(())
    }

    async fn remove(&self, ctx: &Context, id: Uuid) -> Result<()> {
        let table = self.router.table_name(ctx)?;
        let result = ctx
            .run(self.service.delete(&table, &self.key(id), Some(Condition::Exists)))
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(TableError::ConditionFailed) => Err(StoreError::new(ErrorKind::NotFound, ctx.namespace())
                .with_source(TableError::ConditionFailed)),
            Err(e) => Err(StoreError::new(ErrorKind::SaveFailed, ctx.namespace()).with_source(e)),
        }
    }
}
