use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use tablestore::table::{
    Condition, ConditionalPut, Filter, IndexSpec, Item, Key, Query, TableError, TableSchema,
    TableService,
};
use tablestore::{
    Aggregate, Context, ErrorKind, EventStore, EventStoreConfig, Maintainer, MemoryTableService,
    StoredEvent,
};

const EVENT_TYPE: &str = "TestEvent";
const AGGREGATE_TYPE: &str = "TestAggregate";

fn event(id: Uuid, version: i64, content: &str) -> StoredEvent {
    let timestamp = Utc.with_ymd_and_hms(2009, 11, 10, 23, 0, 0).unwrap();
    StoredEvent::for_aggregate(
        EVENT_TYPE,
        json!({ "Content": content }),
        timestamp,
        AGGREGATE_TYPE,
        id,
        version,
    )
}

async fn setup() -> (Arc<EventStore>, Context, Context) {
    let service = Arc::new(MemoryTableService::new());
    let store = Arc::new(EventStore::new(service, EventStoreConfig::default()));

    let default_ctx = Context::background();
    let ns_ctx = Context::background().with_namespace("ns");
    store.create_table(&default_ctx).await.unwrap();
    store.create_table(&ns_ctx).await.unwrap();
    (store, default_ctx, ns_ctx)
}

/// Behaviour every namespace must show on its own.
async fn acceptance(store: &EventStore, ctx: &Context) {
    // Nothing to append
    let err = store.save(ctx, &[], 0).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NoEventsToAppend);

    // First event of a new stream
    let id = Uuid::new_v4();
    let event1 = event(id, 1, "event1");
    store.save(ctx, &[event1.clone()], 0).await.unwrap();
    assert_eq!(store.load(ctx, id).await.unwrap(), vec![event1.clone()]);

    // Several events at once, continuing the stream
    let event2 = event(id, 2, "event2");
    let event3 = event(id, 3, "event3");
    store
        .save(ctx, &[event2.clone(), event3.clone()], 1)
        .await
        .unwrap();

    // Re-using a taken version
    let err = store.save(ctx, &[event(id, 2, "again")], 1).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConcurrencyConflict);

    // A second aggregate
    let other = Uuid::new_v4();
    let other1 = event(other, 1, "other1");
    store.save(ctx, &[other1.clone()], 0).await.unwrap();

    assert_eq!(
        store.load(ctx, id).await.unwrap(),
        vec![event1, event2, event3]
    );
    assert_eq!(store.load(ctx, other).await.unwrap(), vec![other1]);
    assert_eq!(store.current_version(ctx, id).await.unwrap(), 3);

    // Unknown aggregate
    assert!(store.load(ctx, Uuid::new_v4()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_event_store_default_namespace() {
    let (store, ctx, _) = setup().await;
    acceptance(&store, &ctx).await;
}

#[tokio::test]
async fn test_event_store_other_namespace() {
    let (store, _, ns) = setup().await;
    acceptance(&store, &ns).await;
}

#[tokio::test]
async fn test_namespaces_are_isolated() {
    let (store, ctx, ns) = setup().await;
    let id = Uuid::new_v4();
    store.save(&ns, &[event(id, 1, "event1")], 0).await.unwrap();

    assert!(store.load(&ctx, id).await.unwrap().is_empty());
    assert!(store.load_all(&ctx).await.unwrap().is_empty());
    assert_eq!(store.load_all(&ns).await.unwrap().len(), 1);

    // The same aggregate can start over in another namespace
    store.save(&ctx, &[event(id, 1, "event1")], 0).await.unwrap();

    // Dropping one namespace leaves the other alone
    store.delete_table(&ns).await.unwrap();
    assert_eq!(store.load_all(&ctx).await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_invalid_namespace() {
    let (store, _, _) = setup().await;
    let ctx = Context::background().with_namespace("bad-name");
    let err = store.create_table(&ctx).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidNamespace);
}

#[tokio::test]
async fn test_load_all() {
    let (store, ctx, _) = setup().await;
    let id = Uuid::parse_str("c1138e5f-f6fb-4dd0-8e79-255c6c8d3756").unwrap();
    let expected = vec![event(id, 1, "event1"), event(id, 2, "event2")];

    store.save(&ctx, &expected, 0).await.unwrap();

    let events = store.load_all(&ctx).await.unwrap();
    assert_eq!(events.len(), 2);
    for (i, event) in events.iter().enumerate() {
        assert_eq!(event, &expected[i]);
        assert_eq!(event.version, i as i64 + 1);
    }
}

#[tokio::test]
async fn test_save_invalid_aggregate_id() {
    let (store, ctx, _) = setup().await;
    let id = Uuid::parse_str("c1138e5f-f6fb-4dd0-8e79-255c6c8d3756").unwrap();
    let events = vec![event(id, 1, "event1"), event(Uuid::nil(), 1, "event1")];

    let err = store.save(&ctx, &events, 0).await.unwrap_err();
    assert_eq!(err.to_string(), "invalid event (default)");
    assert!(store.load_all(&ctx).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_save_non_contiguous_versions() {
    let (store, ctx, _) = setup().await;
    let id = Uuid::new_v4();

    let err = store
        .save(&ctx, &[event(id, 1, "event1"), event(id, 3, "event3")], 0)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ConcurrencyConflict);
    assert!(store.load_all(&ctx).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_concurrent_saves_one_wins() {
    let (store, ctx, _) = setup().await;
    let id = Uuid::new_v4();
    store.save(&ctx, &[event(id, 1, "event1")], 0).await.unwrap();

    let mut handles = Vec::new();
    for writer in 0..8 {
        let store = store.clone();
        let ctx = ctx.clone();
        handles.push(tokio::spawn(async move {
            store
                .save(&ctx, &[event(id, 2, &format!("writer{writer}"))], 1)
                .await
        }));
    }

    let mut wins = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(()) => wins += 1,
            Err(err) => assert_eq!(err.kind(), ErrorKind::ConcurrencyConflict),
        }
    }

    assert_eq!(wins, 1);
    assert_eq!(store.load(&ctx, id).await.unwrap().len(), 2);
    assert_eq!(store.current_version(&ctx, id).await.unwrap(), 2);
}

// ============================================================================
// Aggregate rebuild
// ============================================================================

#[derive(Debug, thiserror::Error)]
#[error("unexpected event {0}")]
struct UnexpectedEvent(String);

#[derive(Debug, Default, Serialize, Deserialize)]
struct Counter {
    id: Uuid,
    version: i64,
    contents: Vec<String>,
}

impl Aggregate for Counter {
    type Error = UnexpectedEvent;

    fn aggregate_type() -> &'static str {
        AGGREGATE_TYPE
    }

    fn new(id: Uuid) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    fn apply_event(&mut self, event: &StoredEvent) -> Result<(), Self::Error> {
        if event.event_type != EVENT_TYPE {
            return Err(UnexpectedEvent(event.event_type.clone()));
        }
        let content = event.data["Content"].as_str().unwrap_or_default();
        self.contents.push(content.to_string());
        self.version = event.version;
        Ok(())
    }

    fn aggregate_id(&self) -> Uuid {
        self.id
    }

    fn version(&self) -> i64 {
        self.version
    }
}

#[tokio::test]
async fn test_load_aggregate() {
    let (store, ctx, _) = setup().await;
    let id = Uuid::new_v4();

    let err = store.load_aggregate::<Counter>(&ctx, id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    store
        .save(&ctx, &[event(id, 1, "a"), event(id, 2, "b")], 0)
        .await
        .unwrap();

    let counter: Counter = store.load_aggregate(&ctx, id).await.unwrap();
    assert_eq!(counter.aggregate_id(), id);
    assert_eq!(counter.version(), 2);
    assert_eq!(counter.contents, vec!["a", "b"]);
}

// ============================================================================
// Maintainer
// ============================================================================

#[tokio::test]
async fn test_maintainer() {
    let (store, ctx, _) = setup().await;
    let maintainer = Maintainer::new(store.clone());

    let id = Uuid::new_v4();
    store
        .save(&ctx, &[event(id, 1, "event1"), event(id, 2, "event2")], 0)
        .await
        .unwrap();

    // Heads written by save are already exact
    let before = store.load_all(&ctx).await.unwrap();
    let first = maintainer.maintain(&ctx).await.unwrap();
    let second = maintainer.maintain(&ctx).await.unwrap();
    assert_eq!(first.streams_checked, 1);
    assert_eq!(first.heads_repaired, 0);
    assert_eq!(first, second);
    assert_eq!(store.load_all(&ctx).await.unwrap(), before);

    // Replace an existing event
    let replacement = event(id, 2, "updated");
    maintainer.replace(&ctx, &replacement).await.unwrap();
    let events = store.load(&ctx, id).await.unwrap();
    assert_eq!(events[1], replacement);

    // Replacing a missing event
    let err = maintainer
        .replace(&ctx, &event(id, 3, "missing"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(store.load(&ctx, id).await.unwrap().len(), 2);

    // Rename
    let renamed = maintainer
        .rename_event(&ctx, EVENT_TYPE, "RenamedEvent")
        .await
        .unwrap();
    assert_eq!(renamed, 2);
    let events = store.load(&ctx, id).await.unwrap();
    assert!(events.iter().all(|event| event.event_type == "RenamedEvent"));

    // Nothing left under the old name
    let renamed = maintainer
        .rename_event(&ctx, EVENT_TYPE, "RenamedEvent")
        .await
        .unwrap();
    assert_eq!(renamed, 0);

    // Appends still work after maintenance
    store.save(&ctx, &[event(id, 3, "event3")], 2).await.unwrap();
}

// ============================================================================
// Deadlines
// ============================================================================

/// Memory backend whose writes take `delay` before they start.
struct SlowWrites {
    inner: MemoryTableService,
    delay: Duration,
}

#[async_trait]
impl TableService for SlowWrites {
    async fn create_table(&self, name: &str, schema: &TableSchema) -> Result<(), TableError> {
        self.inner.create_table(name, schema).await
    }

    async fn delete_table(&self, name: &str) -> Result<(), TableError> {
        self.inner.delete_table(name).await
    }

    async fn add_index(&self, table: &str, index: &IndexSpec) -> Result<(), TableError> {
        self.inner.add_index(table, index).await
    }

    async fn remove_index(&self, table: &str, index_name: &str) -> Result<(), TableError> {
        self.inner.remove_index(table, index_name).await
    }

    async fn get(&self, table: &str, key: &Key, consistent: bool) -> Result<Option<Item>, TableError> {
        self.inner.get(table, key, consistent).await
    }

    async fn scan(
        &self,
        table: &str,
        consistent: bool,
        filter: Option<&Filter>,
    ) -> Result<Vec<Item>, TableError> {
        self.inner.scan(table, consistent, filter).await
    }

    async fn query(&self, table: &str, query: &Query) -> Result<Vec<Item>, TableError> {
        self.inner.query(table, query).await
    }

    async fn put(&self, table: &str, item: Item, condition: Option<Condition>) -> Result<(), TableError> {
        tokio::time::sleep(self.delay).await;
        self.inner.put(table, item, condition).await
    }

    async fn transact_put(&self, table: &str, puts: Vec<ConditionalPut>) -> Result<(), TableError> {
        tokio::time::sleep(self.delay).await;
        self.inner.transact_put(table, puts).await
    }

    async fn delete(&self, table: &str, key: &Key, condition: Option<Condition>) -> Result<(), TableError> {
        self.inner.delete(table, key, condition).await
    }
}

#[tokio::test]
async fn test_save_past_deadline_leaves_no_trace() {
    let service = Arc::new(SlowWrites {
        inner: MemoryTableService::new(),
        delay: Duration::from_millis(200),
    });
    let store = EventStore::new(service, EventStoreConfig::default());
    let ctx = Context::background();
    store.create_table(&ctx).await.unwrap();

    let id = Uuid::new_v4();
    let hurried = ctx.clone().with_timeout(Duration::from_millis(20));
    let err = store
        .save(&hurried, &[event(id, 1, "event1"), event(id, 2, "event2")], 0)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::SaveFailed);
    assert_eq!(err.to_string(), "could not save: deadline exceeded (default)");

    assert!(store.load_all(&ctx).await.unwrap().is_empty());
    assert_eq!(store.current_version(&ctx, id).await.unwrap(), 0);

    // The stream is still writable from its original version
    store.save(&ctx, &[event(id, 1, "event1")], 0).await.unwrap();
    assert_eq!(store.current_version(&ctx, id).await.unwrap(), 1);
}
