use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

// ============================================================================
// Stored Event - one entry of an aggregate stream
// ============================================================================
//
// Events are stored as items keyed by (AggregateID, Version). The payload is
// kept as JSON so the store works for any event type; typed access goes
// through `data_as` or the DomainEvent helpers below.
//
// ============================================================================

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct StoredEvent {
    #[serde(rename = "AggregateID")]
    pub aggregate_id: Uuid,
    pub aggregate_type: String,

    // Position in the stream, starting at 1
    pub version: i64,

    pub event_type: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,

    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl StoredEvent {
    pub fn for_aggregate(
        event_type: impl Into<String>,
        data: Value,
        timestamp: DateTime<Utc>,
        aggregate_type: impl Into<String>,
        aggregate_id: Uuid,
        version: i64,
    ) -> Self {
        Self {
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            version,
            event_type: event_type.into(),
            data,
            timestamp,
            metadata: HashMap::new(),
        }
    }

    /// Wrap a typed domain event, stamped with the current time.
    pub fn from_domain<E: DomainEvent>(
        event: &E,
        aggregate_type: impl Into<String>,
        aggregate_id: Uuid,
        version: i64,
    ) -> serde_json::Result<Self> {
        Ok(Self::for_aggregate(
            E::event_type(),
            serde_json::to_value(event)?,
            Utc::now(),
            aggregate_type,
            aggregate_id,
            version,
        ))
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn data_as<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_value(self.data.clone())
    }
}

// ============================================================================
// Domain Event Trait
// ============================================================================

/// Typed event payload.
pub trait DomainEvent: Serialize + DeserializeOwned + Clone + Send + Sync {
    fn event_type() -> &'static str where Self: Sized;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::marshal;

    #[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
    struct Deposited {
        amount: i64,
    }

    impl DomainEvent for Deposited {
        fn event_type() -> &'static str { "Deposited" }
    }

    #[test]
    fn test_from_domain_event() {
        let id = Uuid::new_v4();
        let event = StoredEvent::from_domain(&Deposited { amount: 5 }, "Account", id, 1).unwrap();

        assert_eq!(event.event_type, "Deposited");
        assert_eq!(event.aggregate_type, "Account");
        assert_eq!(event.aggregate_id, id);
        assert_eq!(event.version, 1);
        assert_eq!(event.data_as::<Deposited>().unwrap(), Deposited { amount: 5 });
    }

    #[test]
    fn test_item_attribute_names() {
        let event = StoredEvent::for_aggregate(
            "Deposited",
            serde_json::json!({"amount": 1}),
            Utc::now(),
            "Account",
            Uuid::new_v4(),
            3,
        )
        .with_metadata("user", "alice");

        let item = marshal::to_item(&event).unwrap();
        for name in ["AggregateID", "AggregateType", "Version", "EventType", "Data", "Timestamp", "Metadata"] {
            assert!(item.contains_key(name), "missing attribute {name}");
        }

        let back: StoredEvent = marshal::from_item(item).unwrap();
        assert_eq!(back, event);
    }
}
