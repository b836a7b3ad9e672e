use std::sync::Arc;
use uuid::Uuid;

use super::head::{
    Record, StreamHead, AGGREGATE_ID, AGGREGATE_TYPE, CURRENT_VERSION, EVENT_TYPE, VERSION,
};
use crate::config::EventStoreConfig;
use crate::context::Context;
use crate::error::{ErrorKind, Result, StoreError};
use crate::event_sourcing::core::{Aggregate, StoredEvent};
use crate::namespace::NamespaceRouter;
use crate::table::{
    marshal, AttributeType, Condition, ConditionalPut, Item, Key, KeyAttribute, Query,
    TableError, TableSchema, TableService,
};

// ============================================================================
// Event Store - append-only aggregate streams
// ============================================================================
//
// Each namespace has its own table, named <prefix><namespace>. Rows are keyed
// by (AggregateID, Version). Version 0 of every stream is its head, holding
// the version of the last appended event.
//
// Optimistic concurrency: an append writes the new events and moves the head
// in one all-or-nothing conditional batch. The head must still be at the
// caller's original version and every event slot must be empty, so of two
// writers starting from the same version at most one succeeds. Nothing is
// retried here.
//
// ============================================================================

pub struct EventStore {
    service: Arc<dyn TableService>,
    router: NamespaceRouter,
}

impl EventStore {
    pub fn new(service: Arc<dyn TableService>, mut config: EventStoreConfig) -> Self {
        config.provide_defaults();
        Self {
            service,
            router: NamespaceRouter::new(config.table_prefix),
        }
    }

    pub fn router(&self) -> &NamespaceRouter {
        &self.router
    }

    pub(crate) fn service(&self) -> &dyn TableService {
        self.service.as_ref()
    }

    /// Layout shared by every event table.
    pub fn schema() -> TableSchema {
        TableSchema::new(KeyAttribute::new(AGGREGATE_ID, AttributeType::String))
            .with_sort_key(KeyAttribute::new(VERSION, AttributeType::Number))
            .with_attribute(KeyAttribute::new(AGGREGATE_TYPE, AttributeType::String))
            .with_attribute(KeyAttribute::new(EVENT_TYPE, AttributeType::String))
            .with_attribute(KeyAttribute::new(CURRENT_VERSION, AttributeType::Number))
    }

    /// Provision the table of the context's namespace. Idempotent.
    pub async fn create_table(&self, ctx: &Context) -> Result<()> {
        let table = self.router.table_name(ctx)?;
        ctx.run(self.service.create_table(&table, &Self::schema()))
            .await
            .map_err(|e| self.fail(ErrorKind::SaveFailed, ctx, e))?;
        tracing::info!(table = %table, namespace = %ctx.namespace(), "Event table ready");
        Ok(())
    }

    /// Drop the table of the context's namespace. Idempotent.
    pub async fn delete_table(&self, ctx: &Context) -> Result<()> {
        let table = self.router.table_name(ctx)?;
        ctx.run(self.service.delete_table(&table))
            .await
            .map_err(|e| self.fail(ErrorKind::SaveFailed, ctx, e))?;
        tracing::info!(table = %table, namespace = %ctx.namespace(), "Event table deleted");
        Ok(())
    }

    /// Append events to one aggregate's stream.
    ///
    /// `original_version` is the version the caller last saw; the events must
    /// carry versions `original_version + 1, original_version + 2, ...`.
    pub async fn save(&self, ctx: &Context, events: &[StoredEvent], original_version: i64) -> Result<()> {
        let namespace = self.router.namespace_of(ctx);
        let Some(first) = events.first() else {
            return Err(StoreError::new(ErrorKind::NoEventsToAppend, namespace));
        };

        let same_aggregate = events.iter().all(|event| {
            event.aggregate_id == first.aggregate_id && event.aggregate_type == first.aggregate_type
        });
        if first.aggregate_id.is_nil() || !same_aggregate {
            return Err(StoreError::new(ErrorKind::InvalidEvent, namespace));
        }

        let new_version = i64::try_from(events.len())
            .ok()
            .and_then(|count| original_version.checked_add(count))
            .filter(|_| original_version >= 0);
        let contiguous = new_version.is_some_and(|last| {
            events
                .iter()
                .zip(original_version + 1..=last)
                .all(|(event, expected)| event.version == expected)
        });
        let (true, Some(new_version)) = (contiguous, new_version) else {
            tracing::warn!(
                aggregate_id = %first.aggregate_id,
                original_version = original_version,
                "Rejected non-contiguous event versions"
            );
            return Err(StoreError::new(ErrorKind::ConcurrencyConflict, namespace));
        };

        let table = self.router.table_name(ctx)?;

        let mut puts = Vec::with_capacity(events.len() + 1);
        for event in events {
            puts.push(ConditionalPut::new(self.encode(ctx, event)?, Some(Condition::NotExists)));
        }
        let head = StreamHead::new(first.aggregate_id, &first.aggregate_type, new_version);
        puts.push(ConditionalPut::new(
            self.encode(ctx, &head)?,
            Some(StreamHead::expect(original_version)),
        ));

        ctx.run(self.service.transact_put(&table, puts))
            .await
            .map_err(|e| {
                if matches!(e, TableError::ConditionFailed) {
                    tracing::warn!(
                        aggregate_id = %first.aggregate_id,
                        original_version = original_version,
                        "Concurrency conflict on append"
                    );
                }
                self.fail(ErrorKind::SaveFailed, ctx, e)
            })?;

        tracing::info!(
            aggregate_id = %first.aggregate_id,
            aggregate_type = %first.aggregate_type,
            namespace = %namespace,
            new_version = new_version,
            event_count = events.len(),
            "✅ Appended events to event store"
        );
        Ok(())
    }

    /// One aggregate's stream in ascending version order. Unknown aggregates
    /// have an empty stream.
    pub async fn load(&self, ctx: &Context, aggregate_id: Uuid) -> Result<Vec<StoredEvent>> {
        let table = self.router.table_name(ctx)?;
        let query = Query::primary(AGGREGATE_ID, aggregate_id.to_string());
        let items = ctx
            .run(self.service.query(&table, &query))
            .await
            .map_err(|e| self.fail(ErrorKind::QueryFailed, ctx, e))?;

        let mut events = self.events_of(ctx, items)?;
        events.sort_by_key(|event| event.version);

        tracing::debug!("Loaded {} events for aggregate {}", events.len(), aggregate_id);
        Ok(events)
    }

    /// Every event of the namespace, ordered by (aggregate id, version).
    /// A full scan; meant for diagnostics and small rebuilds.
    pub async fn load_all(&self, ctx: &Context) -> Result<Vec<StoredEvent>> {
        let table = self.router.table_name(ctx)?;
        let items = ctx
            .run(self.service.scan(&table, true, None))
            .await
            .map_err(|e| self.fail(ErrorKind::QueryFailed, ctx, e))?;

        let mut events = self.events_of(ctx, items)?;
        events.sort_by(|a, b| (a.aggregate_id, a.version).cmp(&(b.aggregate_id, b.version)));

        tracing::debug!(namespace = %ctx.namespace(), count = events.len(), "Loaded all events");
        Ok(events)
    }

    /// Version of the last event of a stream, 0 for unknown aggregates.
    pub async fn current_version(&self, ctx: &Context, aggregate_id: Uuid) -> Result<i64> {
        Ok(self
            .head(ctx, aggregate_id)
            .await?
            .map_or(0, |head| head.current_version))
    }

    /// Rebuild an aggregate from its stream.
    pub async fn load_aggregate<A: Aggregate>(&self, ctx: &Context, aggregate_id: Uuid) -> Result<A> {
        let events = self.load(ctx, aggregate_id).await?;
        if events.is_empty() {
            return Err(StoreError::new(ErrorKind::NotFound, ctx.namespace()));
        }
        A::load_from_events(aggregate_id, &events)
            .map_err(|e| StoreError::new(ErrorKind::QueryFailed, ctx.namespace()).with_source(e))
    }

    pub(crate) async fn head(&self, ctx: &Context, aggregate_id: Uuid) -> Result<Option<StreamHead>> {
        let table = self.router.table_name(ctx)?;
        let key = Key::partition(AGGREGATE_ID, aggregate_id.to_string())
            .with_sort(VERSION, super::head::HEAD_VERSION);
        let item = ctx
            .run(self.service.get(&table, &key, true))
            .await
            .map_err(|e| self.fail(ErrorKind::QueryFailed, ctx, e))?;

        item.map(marshal::from_item)
            .transpose()
            .map_err(|e| self.fail(ErrorKind::QueryFailed, ctx, e))
    }

    pub(crate) fn events_of(&self, ctx: &Context, items: Vec<Item>) -> Result<Vec<StoredEvent>> {
        let mut events = Vec::with_capacity(items.len());
        for item in items {
            match Record::decode(item).map_err(|e| self.fail(ErrorKind::QueryFailed, ctx, e))? {
                Record::Event(event) => events.push(event),
                Record::Head(_) => {}
            }
        }
        Ok(events)
    }

    pub(crate) fn encode<T: serde::Serialize>(&self, ctx: &Context, value: &T) -> Result<Item> {
        marshal::to_item(value).map_err(|e| self.fail(ErrorKind::SaveFailed, ctx, e))
    }

    pub(crate) fn fail(&self, kind: ErrorKind, ctx: &Context, err: TableError) -> StoreError {
        StoreError::from_table(kind, self.router.namespace_of(ctx), err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::MemoryTableService;
    use chrono::Utc;
    use serde_json::json;

    fn event(id: Uuid, version: i64) -> StoredEvent {
        StoredEvent::for_aggregate(
            "TestEvent",
            json!({"content": format!("event{version}")}),
            Utc::now(),
            "TestAggregate",
            id,
            version,
        )
    }

    async fn store() -> EventStore {
        let store = EventStore::new(Arc::new(MemoryTableService::new()), EventStoreConfig::default());
        store.create_table(&Context::background()).await.unwrap();
        store
    }

    #[tokio::test]
    async fn test_save_empty_batch() {
        let store = store().await;
        let err = store.save(&Context::background(), &[], 0).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoEventsToAppend);
    }

    #[tokio::test]
    async fn test_save_mixed_aggregate_types() {
        let store = store().await;
        let id = Uuid::new_v4();
        let mut second = event(id, 2);
        second.aggregate_type = "Other".to_string();

        let err = store
            .save(&Context::background(), &[event(id, 1), second], 0)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidEvent);
        assert!(store.load(&Context::background(), id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_version_overflow_conflicts() {
        let store = store().await;
        let ctx = Context::background();
        let id = Uuid::new_v4();

        let err = store.save(&ctx, &[event(id, 1)], i64::MAX).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConcurrencyConflict);

        let err = store
            .save(&ctx, &[event(id, i64::MAX), event(id, i64::MIN)], i64::MAX - 1)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConcurrencyConflict);
        assert!(store.load(&ctx, id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_head_tracks_current_version() {
        let store = store().await;
        let ctx = Context::background();
        let id = Uuid::new_v4();

        assert_eq!(store.current_version(&ctx, id).await.unwrap(), 0);
        store.save(&ctx, &[event(id, 1), event(id, 2)], 0).await.unwrap();
        assert_eq!(store.current_version(&ctx, id).await.unwrap(), 2);
        store.save(&ctx, &[event(id, 3)], 2).await.unwrap();
        assert_eq!(store.current_version(&ctx, id).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_stale_original_version_conflicts() {
        let store = store().await;
        let ctx = Context::background();
        let id = Uuid::new_v4();
        store.save(&ctx, &[event(id, 1), event(id, 2)], 0).await.unwrap();

        // Behind the stream
        let err = store.save(&ctx, &[event(id, 2)], 1).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConcurrencyConflict);

        // Ahead of the stream, would leave a gap
        let err = store.save(&ctx, &[event(id, 5)], 4).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConcurrencyConflict);

        assert_eq!(store.load(&ctx, id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_heads_are_not_returned_as_events() {
        let store = store().await;
        let ctx = Context::background();
        let id = Uuid::new_v4();
        store.save(&ctx, &[event(id, 1)], 0).await.unwrap();

        let all = store.load_all(&ctx).await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(all.iter().all(|event| event.version >= 1));
    }

    #[tokio::test]
    async fn test_operations_fail_after_delete_table() {
        let store = store().await;
        let ctx = Context::background();
        store.delete_table(&ctx).await.unwrap();
        store.delete_table(&ctx).await.unwrap();

        let err = store.load_all(&ctx).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::QueryFailed);
        let err = store.save(&ctx, &[event(Uuid::new_v4(), 1)], 0).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SaveFailed);
    }
}
