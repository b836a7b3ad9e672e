// ============================================================================
// Entity Repository
// ============================================================================
//
// Generic CRUD and query access to one table of caller-defined entities.
// The repository never knows the entity's shape: reads are materialized by
// an entity factory installed at runtime.
//
// ============================================================================

mod entity_repo;

pub use entity_repo::{entity_factory, Entity, EntityFactory, IndexQuery, ReadRepo, Repo, WriteRepo};
