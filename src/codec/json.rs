//! JSON text encoding of events
//!
//! Each event category has its own wire shape:
//!
//! - data change → `{"data", "data_type", "data_op", "metadata"}`
//! - business → the payload object with `metadata` merged at the top level
//! - undefined → the payload as-is
//!
//! Decoding picks the variant by probing for marker fields, `data_op` first
//! and `metadata` second.

use crate::error::{PublishError, Result};
use crate::types::{DataOperation, Event, Metadata};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Reserved top-level key for envelope metadata
pub const METADATA_KEY: &str = "metadata";

/// Marker field of data change events
pub const DATA_OP_KEY: &str = "data_op";

/// Field probed to recover the id of an undefined event
pub const EID_KEY: &str = "eid";

/// Content type of JSON batches
pub const CONTENT_TYPE: &str = "application/json";

#[derive(Serialize)]
struct DataChangeRef<'a, T> {
    data: &'a T,
    data_type: &'a str,
    data_op: DataOperation,
    metadata: &'a Metadata,
}

#[derive(Deserialize)]
struct DataChangeOwned<T> {
    data: T,
    data_type: String,
    data_op: DataOperation,
    metadata: Metadata,
}

/// Encode one event to its JSON wire value
pub fn encode<T: Serialize>(event: &Event<T>) -> Result<Value> {
    match event {
        Event::DataChange {
            data,
            data_type,
            op,
            metadata,
        } => Ok(serde_json::to_value(DataChangeRef {
            data,
            data_type,
            data_op: *op,
            metadata,
        })?),
        Event::Business { data, metadata } => {
            let mut value = serde_json::to_value(data)?;
            let obj = value.as_object_mut().ok_or_else(|| {
                PublishError::Encoding(
                    "business event payload must serialize to a JSON object".to_string(),
                )
            })?;
            if obj.contains_key(METADATA_KEY) {
                return Err(PublishError::Encoding(format!(
                    "business event payload already has a top-level '{}' field",
                    METADATA_KEY
                )));
            }
            obj.insert(METADATA_KEY.to_string(), serde_json::to_value(metadata)?);
            Ok(value)
        }
        Event::Undefined { data } => Ok(serde_json::to_value(data)?),
    }
}

/// Decode a JSON wire value into an event
pub fn decode<T: DeserializeOwned>(value: Value) -> Result<Event<T>> {
    let has_op = value.get(DATA_OP_KEY).is_some();
    let has_metadata = value.get(METADATA_KEY).is_some();

    if has_op && has_metadata {
        let raw: DataChangeOwned<T> = serde_json::from_value(value)?;
        return Ok(Event::DataChange {
            data: raw.data,
            data_type: raw.data_type,
            op: raw.data_op,
            metadata: raw.metadata,
        });
    }

    if has_metadata {
        let mut value = value;
        // has_metadata implies an object
        let metadata = value
            .as_object_mut()
            .and_then(|obj| obj.remove(METADATA_KEY))
            .ok_or_else(|| PublishError::Encoding("metadata vanished during decode".to_string()))?;
        return Ok(Event::Business {
            data: serde_json::from_value(value)?,
            metadata: serde_json::from_value(metadata)?,
        });
    }

    Ok(Event::Undefined {
        data: serde_json::from_value(value)?,
    })
}

/// Encode a batch into a JSON array body
pub fn encode_batch<'a>(values: impl IntoIterator<Item = &'a Value>) -> Result<Vec<u8>> {
    let items: Vec<&Value> = values.into_iter().collect();
    Ok(serde_json::to_vec(&items)?)
}

/// Recover an event id from an encoded payload
///
/// Looks for a top-level `eid` first, then `metadata.eid`. Returns `None`
/// when neither is present or the value is not a UUID.
pub fn probe_eid(value: &Value) -> Option<Uuid> {
    value
        .get(EID_KEY)
        .or_else(|| value.get(METADATA_KEY).and_then(|m| m.get(EID_KEY)))
        .and_then(Value::as_str)
        .and_then(|s| Uuid::parse_str(s).ok())
}
