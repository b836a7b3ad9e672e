use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::event_sourcing::core::StoredEvent;
use crate::table::{marshal, Condition, Item, TableError};

pub(crate) const AGGREGATE_ID: &str = "AggregateID";
pub(crate) const VERSION: &str = "Version";
pub(crate) const CURRENT_VERSION: &str = "CurrentVersion";
pub(crate) const EVENT_TYPE: &str = "EventType";
pub(crate) const AGGREGATE_TYPE: &str = "AggregateType";

/// Sort key value reserved for stream heads.
pub(crate) const HEAD_VERSION: i64 = 0;

/// Per-aggregate bookkeeping row holding the version of the last event.
/// Every append is conditioned on it, which is what serializes writers.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct StreamHead {
    #[serde(rename = "AggregateID")]
    pub aggregate_id: Uuid,
    pub version: i64,
    pub aggregate_type: String,
    pub current_version: i64,
    pub updated_at: DateTime<Utc>,
}

impl StreamHead {
    pub fn new(aggregate_id: Uuid, aggregate_type: &str, current_version: i64) -> Self {
        Self {
            aggregate_id,
            version: HEAD_VERSION,
            aggregate_type: aggregate_type.to_string(),
            current_version,
            updated_at: Utc::now(),
        }
    }

    /// Precondition for moving a head that was last seen at `expected`.
    pub fn expect(expected: i64) -> Condition {
        if expected == 0 {
            Condition::NotExists
        } else {
            Condition::AttributeEquals(CURRENT_VERSION.to_string(), Value::from(expected))
        }
    }
}

/// An item of an event table.
pub(crate) enum Record {
    Head(StreamHead),
    Event(StoredEvent),
}

impl Record {
    pub fn decode(item: Item) -> Result<Self, TableError> {
        let is_head = item.get(VERSION).and_then(Value::as_i64) == Some(HEAD_VERSION);
        if is_head {
            Ok(Record::Head(marshal::from_item(item)?))
        } else {
            Ok(Record::Event(marshal::from_item(item)?))
        }
    }
}
