// ============================================================================
// Event Sourcing
// ============================================================================
//
// Namespaced, append-only event store with optimistic concurrency.
// Works with any aggregate and event type.
//
// ============================================================================

mod core;
mod store;

pub use self::core::*;
pub use self::store::*;
