use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use serde_json::Value;
use tokio::sync::watch;
use uuid::Uuid;

use super::event_store::EventStore;
use super::head::{Record, StreamHead, EVENT_TYPE};
use crate::context::Context;
use crate::error::{ErrorKind, Result, StoreError};
use crate::event_sourcing::core::StoredEvent;
use crate::table::{Condition, Filter, TableError};

// ============================================================================
// Maintainer - stream head reconciliation and event rewrites
// ============================================================================
//
// Appends keep heads exact, so a pass normally finds nothing to do. Heads go
// missing or fall behind only when events were written around the store
// (bulk imports, manual fixes). Every repair is a conditional write, so a
// pass racing live appends never moves a head backwards.
//
// ============================================================================

/// Outcome of one maintenance pass over a namespace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub streams_checked: usize,
    pub heads_repaired: usize,
}

#[derive(Default)]
struct StreamState {
    aggregate_type: String,
    last_version: i64,
    head: Option<i64>,
}

pub struct Maintainer {
    store: Arc<EventStore>,
}

impl Maintainer {
    pub fn new(store: Arc<EventStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &EventStore {
        &self.store
    }

    /// Bring every stream head of the context's namespace up to the highest
    /// stored version. Running it again changes nothing.
    pub async fn maintain(&self, ctx: &Context) -> Result<MaintenanceReport> {
        let table = self.store.router().table_name(ctx)?;
        let items = ctx
            .run(self.store.service().scan(&table, true, None))
            .await
            .map_err(|e| self.store.fail(ErrorKind::QueryFailed, ctx, e))?;

        let mut streams: BTreeMap<Uuid, StreamState> = BTreeMap::new();
        for item in items {
            let record = Record::decode(item)
                .map_err(|e| self.store.fail(ErrorKind::QueryFailed, ctx, e))?;
            match record {
                Record::Head(head) => {
                    streams.entry(head.aggregate_id).or_default().head = Some(head.current_version);
                }
                Record::Event(event) => {
                    let state = streams.entry(event.aggregate_id).or_default();
                    if event.version > state.last_version {
                        state.last_version = event.version;
                        state.aggregate_type = event.aggregate_type;
                    }
                }
            }
        }

        let mut report = MaintenanceReport {
            streams_checked: streams.len(),
            heads_repaired: 0,
        };

        for (aggregate_id, state) in streams {
            let seen = state.head.unwrap_or(0);
            if state.last_version <= seen {
                continue;
            }

            let head = StreamHead::new(aggregate_id, &state.aggregate_type, state.last_version);
            let item = self.store.encode(ctx, &head)?;
            match ctx
                .run(self.store.service().put(&table, item, Some(StreamHead::expect(seen))))
                .await
            {
                Ok(()) => {
                    report.heads_repaired += 1;
                    tracing::info!(
                        aggregate_id = %aggregate_id,
                        from_version = seen,
                        to_version = state.last_version,
                        "🔧 Repaired stream head"
                    );
                }
                // Moved by a concurrent append since the scan
                Err(TableError::ConditionFailed) => {
                    tracing::debug!(aggregate_id = %aggregate_id, "Stream head moved during maintenance");
                }
                Err(e) => return Err(self.store.fail(ErrorKind::SaveFailed, ctx, e)),
            }
        }

        tracing::debug!(
            namespace = %ctx.namespace(),
            streams_checked = report.streams_checked,
            heads_repaired = report.heads_repaired,
            "Maintenance pass finished"
        );
        Ok(report)
    }

    /// Run `maintain` every `interval` until `shutdown` flips to true or its
    /// sender is dropped. Failed passes are logged and retried next tick.
    pub async fn run_periodic(&self, ctx: &Context, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        tracing::info!(namespace = %ctx.namespace(), ?interval, "Maintainer started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.maintain(ctx).await {
                        tracing::error!(error = %e, "Maintenance pass failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!(namespace = %ctx.namespace(), "Maintainer stopped");
    }

    /// Overwrite a stored event in place. The event must already exist at
    /// its (aggregate id, version).
    pub async fn replace(&self, ctx: &Context, event: &StoredEvent) -> Result<()> {
        let namespace = self.store.router().namespace_of(ctx);
        if event.aggregate_id.is_nil() || event.version < 1 {
            return Err(StoreError::new(ErrorKind::InvalidEvent, namespace));
        }

        let table = self.store.router().table_name(ctx)?;
        let item = self.store.encode(ctx, event)?;
        match ctx
            .run(self.store.service().put(&table, item, Some(Condition::Exists)))
            .await
        {
            Ok(()) => {}
            Err(TableError::ConditionFailed) => {
                return Err(StoreError::new(ErrorKind::NotFound, namespace));
            }
            Err(e) => return Err(self.store.fail(ErrorKind::SaveFailed, ctx, e)),
        }

        tracing::info!(
            aggregate_id = %event.aggregate_id,
            version = event.version,
            "Replaced event"
        );
        Ok(())
    }

    /// Change the type of every event named `from` to `to`. Returns the
    /// number of events rewritten.
    pub async fn rename_event(&self, ctx: &Context, from: &str, to: &str) -> Result<usize> {
        let table = self.store.router().table_name(ctx)?;
        let filter = Filter::new(format!("{EVENT_TYPE} = ?"), vec![Value::from(from)]);
        let items = ctx
            .run(self.store.service().scan(&table, true, Some(&filter)))
            .await
            .map_err(|e| self.store.fail(ErrorKind::QueryFailed, ctx, e))?;

        let mut renamed = 0;
        for mut event in self.store.events_of(ctx, items)? {
            event.event_type = to.to_string();
            let item = self.store.encode(ctx, &event)?;
            let unchanged = Condition::AttributeEquals(EVENT_TYPE.to_string(), Value::from(from));
            match ctx.run(self.store.service().put(&table, item, Some(unchanged))).await {
                Ok(()) => renamed += 1,
                Err(TableError::ConditionFailed) => {}
                Err(e) => return Err(self.store.fail(ErrorKind::SaveFailed, ctx, e)),
            }
        }

        tracing::info!(
            namespace = %ctx.namespace(),
            from = from,
            to = to,
            renamed = renamed,
            "Renamed events"
        );
        Ok(renamed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EventStoreConfig;
    use crate::table::{marshal, MemoryTableService, TableService};
    use chrono::Utc;
    use serde_json::json;

    fn event(id: Uuid, version: i64) -> StoredEvent {
        StoredEvent::for_aggregate("TestEvent", json!({"n": version}), Utc::now(), "TestAggregate", id, version)
    }

    async fn setup() -> (Arc<MemoryTableService>, Maintainer) {
        let service = Arc::new(MemoryTableService::new());
        let store = EventStore::new(service.clone(), EventStoreConfig::default());
        store.create_table(&Context::background()).await.unwrap();
        (service, Maintainer::new(Arc::new(store)))
    }

    #[tokio::test]
    async fn test_maintain_repairs_missing_head() {
        let (service, maintainer) = setup().await;
        let ctx = Context::background();
        let id = Uuid::new_v4();

        // Events imported without going through save
        for version in 1..=3 {
            let item = marshal::to_item(&event(id, version)).unwrap();
            service.put("events_default", item, None).await.unwrap();
        }
        assert_eq!(maintainer.store().current_version(&ctx, id).await.unwrap(), 0);

        let report = maintainer.maintain(&ctx).await.unwrap();
        assert_eq!(report, MaintenanceReport { streams_checked: 1, heads_repaired: 1 });
        assert_eq!(maintainer.store().current_version(&ctx, id).await.unwrap(), 3);

        // Appends continue from the repaired head
        maintainer.store().save(&ctx, &[event(id, 4)], 3).await.unwrap();

        let report = maintainer.maintain(&ctx).await.unwrap();
        assert_eq!(report.heads_repaired, 0);
    }

    #[tokio::test]
    async fn test_replace_requires_existing_event() {
        let (_, maintainer) = setup().await;
        let ctx = Context::background();
        let id = Uuid::new_v4();

        let err = maintainer.replace(&ctx, &event(id, 1)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = maintainer.replace(&ctx, &event(id, 0)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidEvent);
    }

    #[tokio::test]
    async fn test_run_periodic_stops_on_shutdown() {
        let (_, maintainer) = setup().await;
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            maintainer
                .run_periodic(&Context::background(), Duration::from_millis(10), rx)
                .await;
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
