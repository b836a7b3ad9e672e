use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::{Item, TableError};

// ============================================================================
// Item Marshalling
// ============================================================================
//
// Records become items through serde_json. A record must serialize to a JSON
// object; its field names are the item's attribute names.
//
// ============================================================================

pub fn to_item<T: Serialize + ?Sized>(value: &T) -> Result<Item, TableError> {
    match serde_json::to_value(value)? {
        Value::Object(item) => Ok(item),
        other => Err(TableError::InvalidItem(format!(
            "expected an object, got {}",
            type_name(&other)
        ))),
    }
}

pub fn from_item<T: DeserializeOwned>(item: Item) -> Result<T, TableError> {
    Ok(serde_json::from_value(Value::Object(item))?)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
