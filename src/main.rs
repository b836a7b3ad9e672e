use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

use tablestore::table::{AttributeType, KeyAttribute, TableService};
use tablestore::utils::{retry_on_transient, RetryConfig};
use tablestore::{
    entity_factory, Context, Entity, EventStore, Maintainer, ReadRepo, Repo, ScyllaTableService,
    Settings, StoredEvent, WriteRepo,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Customer {
    #[serde(rename = "ID")]
    id: Uuid,
    name: String,
    tier: String,
}

impl Entity for Customer {
    fn entity_id(&self) -> Uuid {
        self.id
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Default to INFO, override with RUST_LOG (e.g. RUST_LOG=debug)
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tablestore=debug")),
        )
        .init();

    tracing::info!("🚀 Starting tablestore demo");

    // === 1. Connect to ScyllaDB ===
    let settings = Settings::from_env()?;
    tracing::info!(nodes = ?settings.scylla.nodes, keyspace = %settings.scylla.keyspace, "Connecting to ScyllaDB...");
    let service: Arc<dyn TableService> = Arc::new(ScyllaTableService::connect(&settings.scylla).await?);

    // === 2. Entity repository ===
    let mut customers: Repo<Customer> = Repo::new(service.clone(), settings.repo.clone());
    customers.set_entity_factory(entity_factory());

    let ctx = Context::background().with_timeout(Duration::from_secs(30));
    customers
        .create_table(&ctx, &[KeyAttribute::new("Tier", AttributeType::String)])
        .await?;

    let customer = Customer {
        id: Uuid::new_v4(),
        name: "Ada".to_string(),
        tier: "gold".to_string(),
    };
    customers.save(&ctx, &customer).await?;
    let found = customers.find(&ctx, customer.id).await?;
    tracing::info!(customer_id = %found.id, name = %found.name, "✅ Customer stored and read back");

    let gold = customers.find_with_filter(&ctx, "Tier = ?", &[json!("gold")]).await?;
    tracing::info!(count = gold.len(), "Gold customers");

    // === 3. Event store in two namespaces ===
    let store = Arc::new(EventStore::new(service.clone(), settings.event_store.clone()));
    let tenant = ctx.clone().with_namespace("tenant_a");
    for namespace_ctx in [&ctx, &tenant] {
        store.create_table(namespace_ctx).await?;
    }

    let account_id = Uuid::new_v4();
    let opened = StoredEvent::for_aggregate(
        "AccountOpened",
        json!({"owner": customer.id}),
        chrono::Utc::now(),
        "Account",
        account_id,
        1,
    );
    store.save(&tenant, &[opened], 0).await?;

    // Append with the version read just before writing; a lost race reloads and retries
    retry_on_transient(&RetryConfig::default(), |_attempt| {
        let store = store.clone();
        let tenant = tenant.clone();
        async move {
            let version = store.current_version(&tenant, account_id).await?;
            let deposited = StoredEvent::for_aggregate(
                "Deposited",
                json!({"amount": 100}),
                chrono::Utc::now(),
                "Account",
                account_id,
                version + 1,
            );
            store.save(&tenant, &[deposited], version).await
        }
    })
    .await?;

    let events = store.load(&tenant, account_id).await?;
    tracing::info!(aggregate_id = %account_id, events = events.len(), "📖 Loaded account stream");
    let default_events = store.load_all(&ctx).await?;
    tracing::info!(count = default_events.len(), "Default namespace is untouched");

    // === 4. Maintenance ===
    let maintainer = Maintainer::new(store.clone());
    let report = maintainer.maintain(&tenant).await?;
    tracing::info!(
        streams_checked = report.streams_checked,
        heads_repaired = report.heads_repaired,
        "🔧 Maintenance pass done"
    );

    customers.remove(&ctx, customer.id).await?;
    tracing::info!("🎉 Demo complete!");

    Ok(())
}
