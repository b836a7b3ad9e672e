// ============================================================================
// Event Sourcing Core - Generic Abstractions
// ============================================================================
//
// Event and aggregate types shared by the store. Nothing here touches the
// table service.
//
// ============================================================================

pub mod aggregate;
pub mod event;

pub use aggregate::Aggregate;
pub use event::{DomainEvent, StoredEvent};
