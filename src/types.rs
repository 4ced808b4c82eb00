//! Core event types for the a3s-publish client
//!
//! Wire types use snake_case JSON field names to match the broker's
//! ingestion contract.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::schema::SchemaHint;

/// Envelope fields attached to an event
///
/// `eid` and `occurred_at` are always present; everything else is optional
/// and omitted from the wire when unset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    /// Unique event identifier
    #[serde(default = "Uuid::new_v4")]
    pub eid: Uuid,

    /// When the event happened at its origin
    #[serde(default = "Utc::now")]
    pub occurred_at: DateTime<Utc>,

    /// Name of the event type this event is published under
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,

    /// When the broker received the event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_at: Option<DateTime<Utc>>,

    /// Lineage: identifiers of the events that caused this one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_eids: Option<Vec<Uuid>>,

    /// Correlation identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flow_id: Option<String>,

    /// Target partition number (rendered as a decimal string on the wire)
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "partition_string"
    )]
    pub partition: Option<u32>,

    /// Key used by log-compacted event types
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_compaction_key: Option<String>,

    /// Opaque trace/span context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_ctx: Option<HashMap<String, String>>,

    /// Identity of the publishing application
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_by: Option<String>,

    /// Values used by the broker to compute the partition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition_keys: Option<Vec<String>>,

    /// Owner of the event, for per-event authorization
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_owner: Option<String>,
}

impl Metadata {
    /// Create metadata with a fresh id and the current time
    pub fn new() -> Self {
        Self {
            eid: Uuid::new_v4(),
            occurred_at: Utc::now(),
            event_type: None,
            received_at: None,
            parent_eids: None,
            flow_id: None,
            partition: None,
            partition_compaction_key: None,
            span_ctx: None,
            published_by: None,
            partition_keys: None,
            event_owner: None,
        }
    }

    /// Set an explicit event id
    pub fn with_eid(mut self, eid: Uuid) -> Self {
        self.eid = eid;
        self
    }

    /// Set the event type name
    pub fn with_event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    /// Set the correlation id
    pub fn with_flow_id(mut self, flow_id: impl Into<String>) -> Self {
        self.flow_id = Some(flow_id.into());
        self
    }

    /// Set the parent event ids
    pub fn with_parent_eids(mut self, parents: Vec<Uuid>) -> Self {
        self.parent_eids = Some(parents);
        self
    }

    /// Set the target partition
    pub fn with_partition(mut self, partition: u32) -> Self {
        self.partition = Some(partition);
        self
    }

    /// Add a span context entry
    pub fn with_span_ctx(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.span_ctx
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }
}

impl Default for Metadata {
    fn default() -> Self {
        Self::new()
    }
}

/// Kind of mutation a data change event describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataOperation {
    #[serde(rename = "C")]
    Create,
    #[serde(rename = "U")]
    Update,
    #[serde(rename = "D")]
    Delete,
    #[serde(rename = "S")]
    Snapshot,
}

impl DataOperation {
    /// Single-letter wire code
    pub fn code(&self) -> &'static str {
        match self {
            Self::Create => "C",
            Self::Update => "U",
            Self::Delete => "D",
            Self::Snapshot => "S",
        }
    }
}

/// An application event in one of the three broker categories
#[derive(Debug, Clone, PartialEq)]
pub enum Event<T> {
    /// Mutation of an external entity
    DataChange {
        data: T,
        data_type: String,
        op: DataOperation,
        metadata: Metadata,
    },
    /// Domain occurrence; metadata is merged into the payload on the wire
    Business { data: T, metadata: Metadata },
    /// Raw payload without a guaranteed envelope
    Undefined { data: T },
}

impl<T> Event<T> {
    /// Create a data change event with fresh metadata
    pub fn data_change(data: T, data_type: impl Into<String>, op: DataOperation) -> Self {
        Self::DataChange {
            data,
            data_type: data_type.into(),
            op,
            metadata: Metadata::new(),
        }
    }

    /// Create a business event with fresh metadata
    pub fn business(data: T) -> Self {
        Self::Business {
            data,
            metadata: Metadata::new(),
        }
    }

    /// Create an undefined event
    pub fn undefined(data: T) -> Self {
        Self::Undefined { data }
    }

    /// Replace the envelope metadata (no-op for undefined events)
    pub fn with_metadata(self, metadata: Metadata) -> Self {
        match self {
            Self::DataChange {
                data,
                data_type,
                op,
                ..
            } => Self::DataChange {
                data,
                data_type,
                op,
                metadata,
            },
            Self::Business { data, .. } => Self::Business { data, metadata },
            undefined @ Self::Undefined { .. } => undefined,
        }
    }

    /// Envelope metadata, if this variant carries one
    pub fn metadata(&self) -> Option<&Metadata> {
        match self {
            Self::DataChange { metadata, .. } | Self::Business { metadata, .. } => Some(metadata),
            Self::Undefined { .. } => None,
        }
    }

    pub(crate) fn metadata_mut(&mut self) -> Option<&mut Metadata> {
        match self {
            Self::DataChange { metadata, .. } | Self::Business { metadata, .. } => Some(metadata),
            Self::Undefined { .. } => None,
        }
    }

    /// The payload
    pub fn data(&self) -> &T {
        match self {
            Self::DataChange { data, .. }
            | Self::Business { data, .. }
            | Self::Undefined { data } => data,
        }
    }
}

/// Broker-side outcome of publishing a single event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishingStatus {
    Submitted,
    Failed,
    Aborted,
}

/// Broker processing step at which an event failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Step {
    None,
    Validating,
    Partitioning,
    Enriching,
    Publishing,
}

/// Broker's verdict on one submitted event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchItemResponse {
    /// Event id, absent when the broker could not parse the event
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eid: Option<Uuid>,

    pub publishing_status: PublishingStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<Step>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl BatchItemResponse {
    /// A successful outcome for `eid`
    pub fn submitted(eid: Uuid) -> Self {
        Self {
            eid: Some(eid),
            publishing_status: PublishingStatus::Submitted,
            step: Some(Step::None),
            detail: None,
        }
    }

    /// A failed outcome for `eid` at `step`
    pub fn failed(eid: Uuid, step: Step, detail: impl Into<String>) -> Self {
        Self {
            eid: Some(eid),
            publishing_status: PublishingStatus::Failed,
            step: Some(step),
            detail: Some(detail.into()),
        }
    }

    /// An aborted outcome for `eid` at `step`
    pub fn aborted(eid: Uuid, step: Step) -> Self {
        Self {
            eid: Some(eid),
            publishing_status: PublishingStatus::Aborted,
            step: Some(step),
            detail: None,
        }
    }
}

/// Wire format for a publish call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PublishFormat {
    /// JSON array of events
    #[default]
    Json,
    /// Avro publishing batch encoded with a schema resolved from the hint
    Avro(SchemaHint),
}

/// Per-call publish options
#[derive(Debug, Clone)]
pub struct PublishOptions {
    /// Fill the event type name into envelopes that lack one
    pub fill_metadata: bool,

    /// Correlation id sent as `X-Flow-Id`; generated when absent
    pub flow_id: Option<String>,

    /// Wire format
    pub format: PublishFormat,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            fill_metadata: true,
            flow_id: None,
            format: PublishFormat::Json,
        }
    }
}

impl PublishOptions {
    /// Options for the Avro binary format
    pub fn avro(hint: SchemaHint) -> Self {
        Self {
            format: PublishFormat::Avro(hint),
            ..Default::default()
        }
    }

    /// Set the correlation id
    pub fn with_flow_id(mut self, flow_id: impl Into<String>) -> Self {
        self.flow_id = Some(flow_id.into());
        self
    }
}

mod partition_string {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<u32>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(p) => serializer.serialize_str(&p.to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u32>, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(u32),
        }

        match Option::<Raw>::deserialize(deserializer)? {
            None => Ok(None),
            Some(Raw::Number(n)) => Ok(Some(n)),
            Some(Raw::Text(s)) => s.parse().map(Some).map_err(de::Error::custom),
        }
    }
}
