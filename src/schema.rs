//! Binary schema resolution
//!
//! Provides a `SchemaResolver` trait for looking up the Avro schema an event
//! type's payload is encoded with. Registry lookup lives outside the publish
//! engine; an in-memory registry is included for tests and embedded use.

use crate::error::{PublishError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;

/// A payload schema matched for an event type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSchema {
    /// Avro schema text (JSON)
    pub schema: String,

    /// Version token written into every envelope
    pub version: String,
}

/// How to pick a schema for an event type
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SchemaHint {
    /// Most recently registered schema
    #[default]
    Latest,
    /// A specific version token
    Version(String),
    /// The registered schema whose text equals this one
    Schema(String),
}

/// Trait for schema lookup collaborators
#[async_trait]
pub trait SchemaResolver: Send + Sync {
    /// Resolve a schema for `event_type`, or `None` if nothing matches
    async fn resolve(&self, event_type: &str, hint: &SchemaHint) -> Result<Option<ResolvedSchema>>;
}

/// In-memory schema registry
///
/// Stores schemas per event type in registration order, protected by
/// `RwLock`. Schemas are lost on process restart.
pub struct MemorySchemaRegistry {
    /// event_type → schemas, oldest first
    schemas: RwLock<HashMap<String, Vec<ResolvedSchema>>>,
}

impl MemorySchemaRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            schemas: RwLock::new(HashMap::new()),
        }
    }

    /// Register a schema version for an event type
    ///
    /// The schema text must parse as Avro. Re-registering an existing
    /// version replaces it.
    pub fn register(
        &self,
        event_type: &str,
        version: impl Into<String>,
        schema: impl Into<String>,
    ) -> Result<()> {
        if event_type.is_empty() {
            return Err(PublishError::Config(
                "Event type cannot be empty".to_string(),
            ));
        }
        let version = version.into();
        if version.is_empty() {
            return Err(PublishError::Config(
                "Schema version cannot be empty".to_string(),
            ));
        }
        let schema = schema.into();
        apache_avro::Schema::parse_str(&schema).map_err(|e| PublishError::SchemaResolution {
            event_type: event_type.to_string(),
            reason: format!("invalid schema for version {}: {}", version, e),
        })?;

        let mut schemas = self.schemas.write().map_err(|e| {
            PublishError::Config(format!("Schema registry lock poisoned: {}", e))
        })?;
        let versions = schemas.entry(event_type.to_string()).or_default();
        versions.retain(|s| s.version != version);
        versions.push(ResolvedSchema { schema, version });
        Ok(())
    }

    /// Get the schema for an event type at a specific version
    pub fn get(&self, event_type: &str, version: &str) -> Result<Option<ResolvedSchema>> {
        let schemas = self.schemas.read().map_err(|e| {
            PublishError::Config(format!("Schema registry lock poisoned: {}", e))
        })?;
        Ok(schemas
            .get(event_type)
            .and_then(|v| v.iter().find(|s| s.version == version))
            .cloned())
    }

    /// Get the most recently registered version for an event type
    pub fn latest_version(&self, event_type: &str) -> Result<Option<String>> {
        let schemas = self.schemas.read().map_err(|e| {
            PublishError::Config(format!("Schema registry lock poisoned: {}", e))
        })?;
        Ok(schemas
            .get(event_type)
            .and_then(|v| v.last())
            .map(|s| s.version.clone()))
    }

    /// List all registered event types
    pub fn list_types(&self) -> Result<Vec<String>> {
        let schemas = self.schemas.read().map_err(|e| {
            PublishError::Config(format!("Schema registry lock poisoned: {}", e))
        })?;
        let mut types: Vec<String> = schemas.keys().cloned().collect();
        types.sort();
        Ok(types)
    }
}

impl Default for MemorySchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SchemaResolver for MemorySchemaRegistry {
    async fn resolve(&self, event_type: &str, hint: &SchemaHint) -> Result<Option<ResolvedSchema>> {
        let schemas = self.schemas.read().map_err(|e| {
            PublishError::Config(format!("Schema registry lock poisoned: {}", e))
        })?;
        let Some(versions) = schemas.get(event_type) else {
            return Ok(None);
        };

        let found = match hint {
            SchemaHint::Latest => versions.last(),
            SchemaHint::Version(v) => versions.iter().find(|s| &s.version == v),
            SchemaHint::Schema(text) => versions.iter().find(|s| same_schema(&s.schema, text)),
        };
        Ok(found.cloned())
    }
}

/// Compare schema texts ignoring formatting
fn same_schema(a: &str, b: &str) -> bool {
    match (
        serde_json::from_str::<serde_json::Value>(a),
        serde_json::from_str::<serde_json::Value>(b),
    ) {
        (Ok(a), Ok(b)) => a == b,
        _ => a.trim() == b.trim(),
    }
}
