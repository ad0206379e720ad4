//! Schema manager client.
//!
//! The schema manager is treated as a single abstract service that may be
//! backed by embedded JSON schemas or an external schema registry; this
//! client assumes the external-HTTP-service shape. `getLatest`/`getByVersion`
//! map onto two endpoints; schemas are
//! cached by `name@version` ("latest" resolves to a version number on the
//! first successful fetch and is cached under that number too), and the
//! cache is invalidated wholesale on `invalidate()`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ingest_core::{CanonicalSchema, FailureKind, FieldDef, FieldType, IngestError};
use serde::Deserialize;
use tokio::sync::RwLock;

/// Wire representation of a schema: fields with types, required flag,
/// nested records, enums, arrays, maps.
#[derive(Debug, Deserialize)]
struct WireSchema {
    version: u64,
    fields: Vec<WireField>,
}

#[derive(Debug, Deserialize)]
struct WireField {
    name: String,
    #[serde(rename = "type")]
    field_type: WireType,
    #[serde(default)]
    required: bool,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum WireType {
    String,
    Int32,
    Int64,
    Double,
    Boolean,
    #[serde(rename = "timestamp_millis")]
    TimestampMillis,
    Enum { symbols: Vec<String> },
    Array { items: Box<WireType> },
    Map { values: Box<WireType> },
    Struct { fields: Vec<WireField> },
}

fn to_field_type(wire: WireType) -> FieldType {
    match wire {
        WireType::String => FieldType::String,
        WireType::Int32 => FieldType::Int32,
        WireType::Int64 => FieldType::Int64,
        WireType::Double => FieldType::Double,
        WireType::Boolean => FieldType::Boolean,
        WireType::TimestampMillis => FieldType::TimestampMillis,
        WireType::Enum { symbols } => FieldType::Enum(symbols),
        WireType::Array { items } => FieldType::Array(Box::new(to_field_type(*items))),
        WireType::Map { values } => {
            FieldType::Map(Box::new(FieldType::String), Box::new(to_field_type(*values)))
        }
        WireType::Struct { fields } => FieldType::Struct(fields.into_iter().map(to_field_def).collect()),
    }
}

fn to_field_def(wire: WireField) -> FieldDef {
    FieldDef { name: wire.name, field_type: to_field_type(wire.field_type), required: wire.required }
}

fn to_canonical(name: &str, wire: WireSchema) -> CanonicalSchema {
    CanonicalSchema {
        name: name.to_string(),
        version: wire.version,
        fields: wire.fields.into_iter().map(to_field_def).collect(),
    }
}

struct CacheEntry {
    schema: CanonicalSchema,
    fetched_at: Instant,
}

/// HTTP-backed schema manager client with a read-through, name+version cache.
pub struct SchemaRegistryClient {
    http: reqwest::Client,
    base_url: String,
    cache_ttl: Duration,
    cache: RwLock<HashMap<String, CacheEntry>>,
}

impl SchemaRegistryClient {
    pub fn new(base_url: String, cache_ttl: Duration) -> Arc<Self> {
        Arc::new(SchemaRegistryClient {
            http: reqwest::Client::new(),
            base_url,
            cache_ttl,
            cache: RwLock::new(HashMap::new()),
        })
    }

    /// Explicit refresh signal ("cache is invalidated on explicit
    /// refresh signal"). Call on SIGHUP or an admin endpoint hit, not on a
    /// timer — TTL expiry is handled transparently by `get_latest`.
    pub async fn invalidate(&self, name: &str) {
        self.cache.write().await.remove(&format!("{name}@latest"));
    }

    pub async fn get_latest(&self, name: &str) -> Result<CanonicalSchema, IngestError> {
        let cache_key = format!("{name}@latest");
        if let Some(hit) = self.cached(&cache_key).await {
            return Ok(hit);
        }
        let url = format!("{}/schemas/{name}/latest", self.base_url);
        self.fetch_and_cache(&url, name, cache_key).await
    }

    pub async fn get_by_version(&self, name: &str, version: u64) -> Result<CanonicalSchema, IngestError> {
        let cache_key = format!("{name}@{version}");
        if let Some(hit) = self.cached(&cache_key).await {
            return Ok(hit);
        }
        let url = format!("{}/schemas/{name}/versions/{version}", self.base_url);
        self.fetch_and_cache(&url, name, cache_key).await
    }

    async fn cached(&self, cache_key: &str) -> Option<CanonicalSchema> {
        let guard = self.cache.read().await;
        let entry = guard.get(cache_key)?;
        if entry.fetched_at.elapsed() <= self.cache_ttl {
            Some(entry.schema.clone())
        } else {
            None
        }
    }

    async fn fetch_and_cache(
        &self,
        url: &str,
        name: &str,
        cache_key: String,
    ) -> Result<CanonicalSchema, IngestError> {
        let response = self.http.get(url).send().await;
        let response = match response {
            Ok(r) if r.status().is_success() => r,
            Ok(r) if r.status() == reqwest::StatusCode::NOT_FOUND => {
                // If we still have a stale cached copy, serving it is better
                // than failing a schema fetch that transiently 404s behind a
                // rolling deploy of the registry; otherwise this is a hard
                // miss for a schema that genuinely doesn't exist.
                if let Some(stale) = self.cache.read().await.get(&cache_key) {
                    return Ok(stale.schema.clone());
                }
                return Err(IngestError::new(
                    FailureKind::Config,
                    format!("schema '{name}' not found in schema manager"),
                ));
            }
            Ok(r) => {
                return Err(IngestError::new(
                    FailureKind::TransientStore,
                    format!("schema manager returned {}", r.status()),
                ))
            }
            Err(e) => {
                if let Some(stale) = self.cache.read().await.get(&cache_key) {
                    return Ok(stale.schema.clone());
                }
                return Err(IngestError::wrap(
                    FailureKind::TransientStore,
                    "schema manager unreachable and schema is not cached",
                    e,
                ));
            }
        };
        let wire: WireSchema = response
            .json()
            .await
            .map_err(|e| IngestError::wrap(FailureKind::Config, "malformed schema document", e))?;
        let schema = to_canonical(name, wire);
        self.cache
            .write()
            .await
            .insert(cache_key, CacheEntry { schema: schema.clone(), fetched_at: Instant::now() });
        Ok(schema)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_schema_decodes_nested_types() {
        let json = r#"{
            "version": 3,
            "fields": [
                {"name": "id", "type": {"kind": "int64"}, "required": true},
                {"name": "tags", "type": {"kind": "array", "items": {"kind": "string"}}},
                {"name": "status", "type": {"kind": "enum", "symbols": ["OPEN", "CLOSED"]}}
            ]
        }"#;
        let wire: WireSchema = serde_json::from_str(json).unwrap();
        let schema = to_canonical("orders", wire);
        assert_eq!(schema.version, 3);
        assert_eq!(schema.fields.len(), 3);
        assert!(matches!(schema.field("tags").unwrap().field_type, FieldType::Array(_)));
    }
}
