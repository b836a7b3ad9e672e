// ============================================================================
// Event Sourcing Store - Persistence Layer
// ============================================================================
//
// EventStore appends and loads aggregate streams; the maintainer keeps the
// per-aggregate stream heads consistent and offers event rewrites.
//
// ============================================================================

pub mod event_store;
mod head;
pub mod maintainer;

pub use event_store::EventStore;
pub use maintainer::{MaintenanceReport, Maintainer};
