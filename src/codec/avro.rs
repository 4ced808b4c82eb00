//! Avro binary encoding of event batches
//!
//! A batch is a single Avro datum of the `PublishingBatch` record: an array
//! of envelopes, each holding a fixed `Metadata` record and the payload bytes
//! encoded with the event type's own schema. Avro arrays and bytes are
//! length-prefixed, so the body needs no extra framing.

use crate::error::{PublishError, Result};
use crate::schema::ResolvedSchema;
use crate::types::Metadata;
use apache_avro::types::Value;
use apache_avro::Schema;
use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use uuid::Uuid;

/// Content type of Avro batches
pub const CONTENT_TYPE: &str = "application/avro-binary";

/// Schema of the batch request body, with envelope and metadata inlined
pub const BATCH_SCHEMA: &str = r#"{
  "type": "record",
  "name": "PublishingBatch",
  "namespace": "a3s.publish",
  "fields": [
    {
      "name": "events",
      "type": {
        "type": "array",
        "items": {
          "type": "record",
          "name": "Envelope",
          "fields": [
            {
              "name": "metadata",
              "type": {
                "type": "record",
                "name": "Metadata",
                "fields": [
                  {"name": "occurred_at", "type": {"type": "long", "logicalType": "timestamp-millis"}},
                  {"name": "eid", "type": "string"},
                  {"name": "flow_id", "type": ["null", "string"], "default": null},
                  {"name": "received_at", "type": ["null", {"type": "long", "logicalType": "timestamp-millis"}], "default": null},
                  {"name": "version", "type": "string"},
                  {"name": "published_by", "type": ["null", "string"], "default": null},
                  {"name": "event_type", "type": "string"},
                  {"name": "partition", "type": ["null", "string"], "default": null},
                  {"name": "parent_eids", "type": ["null", {"type": "array", "items": "string"}], "default": null},
                  {"name": "partition_keys", "type": ["null", {"type": "array", "items": "string"}], "default": null},
                  {"name": "partition_compaction_key", "type": ["null", "string"], "default": null},
                  {"name": "span_ctx", "type": ["null", "string"], "default": null},
                  {"name": "event_owner", "type": ["null", "string"], "default": null}
                ]
              }
            },
            {"name": "payload", "type": "bytes"}
          ]
        }
      }
    }
  ]
}"#;

/// An envelope decoded from a binary batch
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedEnvelope {
    pub metadata: Metadata,
    /// Schema version token from the envelope
    pub version: String,
    /// Payload bytes, still encoded with the event type's schema
    pub payload: Vec<u8>,
}

/// Encoder bound to one resolved payload schema
pub struct AvroEncoder {
    batch_schema: Schema,
    payload_schema: Schema,
    version: String,
}

impl AvroEncoder {
    /// Parse the batch schema and the resolved payload schema
    pub fn new(resolved: &ResolvedSchema) -> Result<Self> {
        Ok(Self {
            batch_schema: batch_schema()?,
            payload_schema: Schema::parse_str(&resolved.schema)?,
            version: resolved.version.clone(),
        })
    }

    /// Schema version token written into envelopes
    pub fn version(&self) -> &str {
        &self.version
    }

    /// Build one envelope record from metadata and payload
    pub fn envelope<T: Serialize>(&self, metadata: &Metadata, data: &T) -> Result<Value> {
        let payload = self.encode_payload(data)?;
        Ok(Value::Record(vec![
            ("metadata".to_string(), self.metadata_record(metadata)?),
            ("payload".to_string(), Value::Bytes(payload)),
        ]))
    }

    /// Serialize a payload with the resolved schema
    pub fn encode_payload<T: Serialize>(&self, data: &T) -> Result<Vec<u8>> {
        let value = apache_avro::to_value(data)?.resolve(&self.payload_schema)?;
        Ok(apache_avro::to_avro_datum(&self.payload_schema, value)?)
    }

    /// Encode envelopes into a batch request body
    pub fn encode_batch<'a>(&self, envelopes: impl IntoIterator<Item = &'a Value>) -> Result<Vec<u8>> {
        let events: Vec<Value> = envelopes.into_iter().cloned().collect();
        let batch = Value::Record(vec![("events".to_string(), Value::Array(events))]);
        Ok(apache_avro::to_avro_datum(&self.batch_schema, batch)?)
    }

    fn metadata_record(&self, metadata: &Metadata) -> Result<Value> {
        let event_type = metadata.event_type.clone().ok_or_else(|| {
            PublishError::Encoding(format!(
                "event {} has no event type name in its metadata",
                metadata.eid
            ))
        })?;

        let span_ctx = metadata
            .span_ctx
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        Ok(Value::Record(vec![
            (
                "occurred_at".to_string(),
                Value::TimestampMillis(metadata.occurred_at.timestamp_millis()),
            ),
            ("eid".to_string(), Value::String(metadata.eid.to_string())),
            ("flow_id".to_string(), optional(metadata.flow_id.clone().map(Value::String))),
            (
                "received_at".to_string(),
                optional(metadata.received_at.map(|t| Value::TimestampMillis(t.timestamp_millis()))),
            ),
            ("version".to_string(), Value::String(self.version.clone())),
            (
                "published_by".to_string(),
                optional(metadata.published_by.clone().map(Value::String)),
            ),
            ("event_type".to_string(), Value::String(event_type)),
            (
                "partition".to_string(),
                optional(metadata.partition.map(|p| Value::String(p.to_string()))),
            ),
            (
                "parent_eids".to_string(),
                optional(metadata.parent_eids.as_ref().map(|ids| {
                    Value::Array(ids.iter().map(|id| Value::String(id.to_string())).collect())
                })),
            ),
            (
                "partition_keys".to_string(),
                optional(metadata.partition_keys.as_ref().map(|keys| {
                    Value::Array(keys.iter().cloned().map(Value::String).collect())
                })),
            ),
            (
                "partition_compaction_key".to_string(),
                optional(metadata.partition_compaction_key.clone().map(Value::String)),
            ),
            ("span_ctx".to_string(), optional(span_ctx.map(Value::String))),
            (
                "event_owner".to_string(),
                optional(metadata.event_owner.clone().map(Value::String)),
            ),
        ]))
    }
}

fn batch_schema() -> Result<Schema> {
    Ok(Schema::parse_str(BATCH_SCHEMA)?)
}

/// `["null", T]` union value
fn optional(value: Option<Value>) -> Value {
    match value {
        Some(v) => Value::Union(1, Box::new(v)),
        None => Value::Union(0, Box::new(Value::Null)),
    }
}

/// Decode a binary batch body back into its envelopes
pub fn decode_batch(body: &[u8]) -> Result<Vec<DecodedEnvelope>> {
    let schema = batch_schema()?;
    let mut reader = body;
    let value = apache_avro::from_avro_datum(&schema, &mut reader, None)?;

    let mut fields = record_fields(value)?;
    let events = match fields.remove("events") {
        Some(Value::Array(items)) => items,
        other => return Err(malformed("events", other)),
    };

    events.into_iter().map(decode_envelope).collect()
}

/// Decode a payload encoded with `schema`
pub fn decode_payload<T: DeserializeOwned>(schema: &ResolvedSchema, bytes: &[u8]) -> Result<T> {
    let schema = Schema::parse_str(&schema.schema)?;
    let mut reader = bytes;
    let value = apache_avro::from_avro_datum(&schema, &mut reader, None)?;
    Ok(apache_avro::from_value(&value)?)
}

fn decode_envelope(value: Value) -> Result<DecodedEnvelope> {
    let mut fields = record_fields(value)?;
    let payload = match fields.remove("payload") {
        Some(Value::Bytes(b)) => b,
        other => return Err(malformed("payload", other)),
    };
    let mut meta = match fields.remove("metadata") {
        Some(v) => record_fields(v)?,
        None => return Err(malformed("metadata", None)),
    };

    let version = required_string(&mut meta, "version")?;
    let eid = required_string(&mut meta, "eid")?;
    let eid = Uuid::parse_str(&eid)
        .map_err(|e| PublishError::Encoding(format!("envelope eid '{}': {}", eid, e)))?;

    let span_ctx = match optional_string(&mut meta, "span_ctx")? {
        Some(text) => Some(serde_json::from_str::<HashMap<String, String>>(&text)?),
        None => None,
    };
    let partition = match optional_string(&mut meta, "partition")? {
        Some(p) => Some(p.parse::<u32>().map_err(|e| {
            PublishError::Encoding(format!("envelope partition '{}': {}", p, e))
        })?),
        None => None,
    };
    let parent_eids = match optional_strings(&mut meta, "parent_eids")? {
        Some(ids) => Some(
            ids.iter()
                .map(|id| {
                    Uuid::parse_str(id)
                        .map_err(|e| PublishError::Encoding(format!("parent eid '{}': {}", id, e)))
                })
                .collect::<Result<Vec<_>>>()?,
        ),
        None => None,
    };

    let metadata = Metadata {
        eid,
        occurred_at: required_timestamp(&mut meta, "occurred_at")?,
        event_type: Some(required_string(&mut meta, "event_type")?),
        received_at: optional_timestamp(&mut meta, "received_at")?,
        parent_eids,
        flow_id: optional_string(&mut meta, "flow_id")?,
        partition,
        partition_compaction_key: optional_string(&mut meta, "partition_compaction_key")?,
        span_ctx,
        published_by: optional_string(&mut meta, "published_by")?,
        partition_keys: optional_strings(&mut meta, "partition_keys")?,
        event_owner: optional_string(&mut meta, "event_owner")?,
    };

    Ok(DecodedEnvelope {
        metadata,
        version,
        payload,
    })
}

fn record_fields(value: Value) -> Result<HashMap<String, Value>> {
    match value {
        Value::Record(fields) => Ok(fields.into_iter().collect()),
        other => Err(malformed("record", Some(other))),
    }
}

fn malformed(field: &str, found: Option<Value>) -> PublishError {
    PublishError::Encoding(format!("malformed envelope field '{}': {:?}", field, found))
}

fn unwrap_union(value: Value) -> Value {
    match value {
        Value::Union(_, inner) => *inner,
        other => other,
    }
}

fn take(fields: &mut HashMap<String, Value>, name: &str) -> Option<Value> {
    match fields.remove(name).map(unwrap_union) {
        None | Some(Value::Null) => None,
        Some(v) => Some(v),
    }
}

fn required_string(fields: &mut HashMap<String, Value>, name: &str) -> Result<String> {
    optional_string(fields, name)?.ok_or_else(|| malformed(name, None))
}

fn optional_string(fields: &mut HashMap<String, Value>, name: &str) -> Result<Option<String>> {
    match take(fields, name) {
        None => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        other => Err(malformed(name, other)),
    }
}

fn optional_strings(fields: &mut HashMap<String, Value>, name: &str) -> Result<Option<Vec<String>>> {
    match take(fields, name) {
        None => Ok(None),
        Some(Value::Array(items)) => items
            .into_iter()
            .map(|item| match item {
                Value::String(s) => Ok(s),
                other => Err(malformed(name, Some(other))),
            })
            .collect::<Result<Vec<_>>>()
            .map(Some),
        other => Err(malformed(name, other)),
    }
}

fn required_timestamp(fields: &mut HashMap<String, Value>, name: &str) -> Result<DateTime<Utc>> {
    optional_timestamp(fields, name)?.ok_or_else(|| malformed(name, None))
}

fn optional_timestamp(fields: &mut HashMap<String, Value>, name: &str) -> Result<Option<DateTime<Utc>>> {
    match take(fields, name) {
        None => Ok(None),
        Some(Value::TimestampMillis(ms)) | Some(Value::Long(ms)) => Utc
            .timestamp_millis_opt(ms)
            .single()
            .map(Some)
            .ok_or_else(|| PublishError::Encoding(format!("timestamp out of range: {}", ms))),
        other => Err(malformed(name, other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    const ORDER_SCHEMA: &str = r#"{
        "type": "record",
        "name": "Order",
        "fields": [
            {"name": "order_id", "type": "string"},
            {"name": "amount", "type": "long"},
            {"name": "note", "type": ["null", "string"], "default": null}
        ]
    }"#;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Order {
        order_id: String,
        amount: i64,
        note: Option<String>,
    }

    fn resolved() -> ResolvedSchema {
        ResolvedSchema {
            schema: ORDER_SCHEMA.to_string(),
            version: "1.2.0".to_string(),
        }
    }

    fn order(id: &str) -> Order {
        Order {
            order_id: id.to_string(),
            amount: 1200,
            note: None,
        }
    }

    #[test]
    fn test_batch_schema_parses() {
        assert!(batch_schema().is_ok());
    }

    #[test]
    fn test_minimal_envelope_roundtrip() {
        let encoder = AvroEncoder::new(&resolved()).unwrap();
        let meta = Metadata::new().with_event_type("order.created");

        let envelope = encoder.envelope(&meta, &order("o-1")).unwrap();
        let body = encoder.encode_batch([&envelope]).unwrap();
        let decoded = decode_batch(&body).unwrap();

        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].version, "1.2.0");
        assert_eq!(decoded[0].metadata.eid, meta.eid);
        assert_eq!(decoded[0].metadata.event_type.as_deref(), Some("order.created"));
        assert_eq!(
            decoded[0].metadata.occurred_at.timestamp_millis(),
            meta.occurred_at.timestamp_millis()
        );
        assert!(decoded[0].metadata.flow_id.is_none());
        assert!(decoded[0].metadata.span_ctx.is_none());

        let payload: Order = decode_payload(&resolved(), &decoded[0].payload).unwrap();
        assert_eq!(payload, order("o-1"));
    }

    #[test]
    fn test_optional_fields_written_when_present() {
        let encoder = AvroEncoder::new(&resolved()).unwrap();
        let parent = Uuid::new_v4();
        let mut meta = Metadata::new()
            .with_event_type("order.created")
            .with_flow_id("flow-7")
            .with_parent_eids(vec![parent])
            .with_partition(4)
            .with_span_ctx("ot-tracer-traceid", "abc");
        meta.published_by = Some("checkout".to_string());
        meta.partition_compaction_key = Some("o-1".to_string());
        meta.partition_keys = Some(vec!["o-1".to_string()]);
        meta.event_owner = Some("team-orders".to_string());
        meta.received_at = Some(Utc.timestamp_millis_opt(1_700_000_000_000).unwrap());

        let envelope = encoder.envelope(&meta, &order("o-1")).unwrap();
        let body = encoder.encode_batch([&envelope]).unwrap();
        let decoded = decode_batch(&body).unwrap().remove(0).metadata;

        assert_eq!(decoded.flow_id.as_deref(), Some("flow-7"));
        assert_eq!(decoded.parent_eids, Some(vec![parent]));
        assert_eq!(decoded.partition, Some(4));
        assert_eq!(decoded.span_ctx.unwrap()["ot-tracer-traceid"], "abc");
        assert_eq!(decoded.published_by.as_deref(), Some("checkout"));
        assert_eq!(decoded.partition_compaction_key.as_deref(), Some("o-1"));
        assert_eq!(decoded.partition_keys, Some(vec!["o-1".to_string()]));
        assert_eq!(decoded.event_owner.as_deref(), Some("team-orders"));
        assert_eq!(decoded.received_at, meta.received_at);
    }

    #[test]
    fn test_missing_event_type_is_fatal() {
        let encoder = AvroEncoder::new(&resolved()).unwrap();
        let err = encoder.envelope(&Metadata::new(), &order("o-1")).unwrap_err();
        assert!(err.to_string().contains("no event type"));
    }

    #[test]
    fn test_payload_must_match_schema() {
        let encoder = AvroEncoder::new(&resolved()).unwrap();
        let meta = Metadata::new().with_event_type("order.created");
        let err = encoder
            .envelope(&meta, &serde_json::json!({"unexpected": true}))
            .unwrap_err();
        assert!(matches!(err, PublishError::Encoding(_)));
    }

    #[test]
    fn test_invalid_payload_schema() {
        let bad = ResolvedSchema {
            schema: "{\"type\": \"nope\"}".to_string(),
            version: "1".to_string(),
        };
        assert!(AvroEncoder::new(&bad).is_err());
    }

    #[test]
    fn test_batch_preserves_order() {
        let encoder = AvroEncoder::new(&resolved()).unwrap();
        let envelopes: Vec<Value> = (0..5)
            .map(|i| {
                let meta = Metadata::new().with_event_type("order.created");
                encoder.envelope(&meta, &order(&format!("o-{}", i))).unwrap()
            })
            .collect();

        let body = encoder.encode_batch(&envelopes).unwrap();
        let decoded = decode_batch(&body).unwrap();
        let ids: Vec<String> = decoded
            .iter()
            .map(|e| decode_payload::<Order>(&resolved(), &e.payload).unwrap().order_id)
            .collect();
        assert_eq!(ids, vec!["o-0", "o-1", "o-2", "o-3", "o-4"]);
    }
}
