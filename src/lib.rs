// ============================================================================
// tablestore
// ============================================================================
//
// Storage layer over a table service:
//
// - repo: generic entity repository (find, filter, index queries, save, remove)
// - event_sourcing: namespaced append-only event store with optimistic
//   concurrency, plus a maintainer for stream heads and event rewrites
// - table: the backend abstraction with in-memory and ScyllaDB services
//
// ============================================================================

pub mod config;
pub mod context;
pub mod error;
pub mod event_sourcing;
pub mod namespace;
pub mod repo;
pub mod table;
pub mod utils;

pub use config::{EventStoreConfig, RepoConfig, ScyllaConfig, Settings};
pub use context::{Context, DEFAULT_NAMESPACE};
pub use error::{ErrorKind, Result, StoreError};
pub use event_sourcing::{Aggregate, DomainEvent, EventStore, MaintenanceReport, Maintainer, StoredEvent};
pub use namespace::NamespaceRouter;
pub use repo::{entity_factory, Entity, EntityFactory, IndexQuery, ReadRepo, Repo, WriteRepo};
pub use table::{MemoryTableService, ScyllaTableService, TableService};
