use uuid::Uuid;

use super::event::StoredEvent;

// ============================================================================
// Aggregate - state rebuilt from its event stream
// ============================================================================
//
// An aggregate is the unit of consistency of the event store. Its state is
// the fold of its stream; `version` is the version of the last applied event
// and is what a caller passes as `original_version` on the next save.
//
// ============================================================================

pub trait Aggregate: Sized + Send + Sync {
    type Error: std::error::Error + Send + Sync + 'static;

    fn aggregate_type() -> &'static str;

    /// Empty aggregate, before any event.
    fn new(id: Uuid) -> Self;

    fn apply_event(&mut self, event: &StoredEvent) -> Result<(), Self::Error>;

    fn aggregate_id(&self) -> Uuid;

    fn version(&self) -> i64;

    /// Rebuild from an ordered stream.
    fn load_from_events(id: Uuid, events: &[StoredEvent]) -> Result<Self, Self::Error> {
        let mut aggregate = Self::new(id);
        for event in events {
            aggregate.apply_event(event)?;
        }
        Ok(aggregate)
    }
}
