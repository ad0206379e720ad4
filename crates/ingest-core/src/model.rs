//! In-flight and at-rest data model.
//!
//! `Record` is produced by the consumer and destroyed on acknowledgement.
//! `ParsedRecord` is the typed, schema-conformant product of the parser.
//! `Batch` groups `ParsedRecord`s by `(topicLogicalName, partitionTuple)`
//! until the accumulator flushes them into a `CommitEntry`.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::NaiveDate;
use datafusion::arrow::datatypes::{DataType, Field, Fields, Schema, SchemaRef, TimeUnit};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// A raw record as handed to the pipeline by the consumer.
#[derive(Debug, Clone)]
pub struct Record {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub raw_payload: Vec<u8>,
    pub arrival_timestamp: chrono::DateTime<chrono::Utc>,
    pub correlation_id: String,
}

impl Record {
    pub fn source_ref(&self) -> SourceRef {
        SourceRef {
            topic: self.topic.clone(),
            partition: self.partition,
            offset: self.offset,
        }
    }
}

/// The format the parser detected for a raw payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DetectedFormat {
    Json,
    Csv,
    Binary,
}

/// `{topic, partition, offset}` — identifies where a parsed record came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

/// A single typed field value, covering every coercion target type the
/// parser can produce from a raw payload field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Null,
    String(String),
    Int32(i32),
    Int64(i64),
    Double(f64),
    Boolean(bool),
    /// Epoch millis, UTC.
    TimestampMillis(i64),
    Enum(String),
    Array(Vec<FieldValue>),
    Map(BTreeMap<String, FieldValue>),
    Struct(BTreeMap<String, FieldValue>),
}

impl FieldValue {
    /// Best-effort conversion to a JSON value, used for DLR envelopes and debugging.
    pub fn to_json(&self) -> JsonValue {
        match self {
            FieldValue::Null => JsonValue::Null,
            FieldValue::String(s) => JsonValue::String(s.clone()),
            FieldValue::Int32(v) => JsonValue::from(*v),
            FieldValue::Int64(v) => JsonValue::from(*v),
            FieldValue::Double(v) => serde_json::Number::from_f64(*v)
                .map(JsonValue::Number)
                .unwrap_or(JsonValue::Null),
            FieldValue::Boolean(v) => JsonValue::Bool(*v),
            FieldValue::TimestampMillis(v) => JsonValue::from(*v),
            FieldValue::Enum(s) => JsonValue::String(s.clone()),
            FieldValue::Array(items) => JsonValue::Array(items.iter().map(Self::to_json).collect()),
            FieldValue::Map(m) | FieldValue::Struct(m) => JsonValue::Object(
                m.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }
}

/// The product of parsing + schema coercion ("ParsedRecord").
#[derive(Debug, Clone)]
pub struct ParsedRecord {
    pub fields: BTreeMap<String, FieldValue>,
    pub detected_format: DetectedFormat,
    pub cob_date: NaiveDate,
    pub business_timestamp: Option<chrono::DateTime<chrono::Utc>>,
    pub enrichment: BTreeMap<String, FieldValue>,
    pub source_ref: SourceRef,
    pub correlation_id: String,
    /// Captured once, at consume time, and never touched again. Enrichment
    /// reads this; it never calls the wall clock itself.
    pub arrival_timestamp: chrono::DateTime<chrono::Utc>,
}

impl ParsedRecord {
    /// Deterministic byte encoding of the business fields only, used to build
    /// the batch fingerprint. Enrichment metadata is deliberately
    /// excluded: `arrivalTimestamp` is wall-clock-derived and differs between
    /// the original attempt and a post-crash replay of the same source
    /// record, so folding it into the fingerprint would make two replays of
    /// the same batch hash differently and defeat the idempotence contract.
    /// Field order is fixed (BTreeMap) so the same logical record always
    /// encodes identically.
    pub fn fingerprint_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        for (k, v) in &self.fields {
            buf.extend_from_slice(k.as_bytes());
            buf.push(0);
            buf.extend_from_slice(v.to_json().to_string().as_bytes());
            buf.push(0);
        }
        buf
    }

    /// Byte encoding including enrichment metadata, used only for in-memory
    /// size estimation (batch byte-budget accounting, row-per-file sizing) —
    /// never for the fingerprint.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut buf = self.fingerprint_bytes();
        for (k, v) in &self.enrichment {
            buf.extend_from_slice(k.as_bytes());
            buf.push(0);
            buf.extend_from_slice(v.to_json().to_string().as_bytes());
            buf.push(0);
        }
        buf
    }
}

/// Ordered tuple of partition-column values shared by every row in a `Batch`.
pub type PartitionTuple = Vec<(String, String)>;

/// An in-memory group of parsed records awaiting flush ("Batch").
#[derive(Debug, Clone)]
pub struct Batch {
    pub topic_logical_name: String,
    pub partition_tuple: PartitionTuple,
    pub rows: Vec<ParsedRecord>,
    pub first_arrival: chrono::DateTime<chrono::Utc>,
    pub last_arrival: chrono::DateTime<chrono::Utc>,
    pub byte_size: usize,
    /// Per source-partition, the first offset observed in this batch.
    pub first_offset_per_partition: BTreeMap<i32, i64>,
    /// Per source-partition, the last offset observed in this batch.
    pub last_offset_per_partition: BTreeMap<i32, i64>,
}

impl Batch {
    pub fn key(&self) -> (String, PartitionTuple) {
        (self.topic_logical_name.clone(), self.partition_tuple.clone())
    }

    /// Content-derived fingerprint: `H(ordered row bytes ∥ partitionTuple ∥ schemaVersion)`.
    /// Identical replays of the same batch produce the same fingerprint.
    pub fn fingerprint(&self, schema_version: u64) -> String {
        let mut hasher = blake3::Hasher::new();
        for row in &self.rows {
            hasher.update(&row.fingerprint_bytes());
            hasher.update(&[0u8]);
        }
        for (k, v) in &self.partition_tuple {
            hasher.update(k.as_bytes());
            hasher.update(v.as_bytes());
        }
        hasher.update(&schema_version.to_le_bytes());
        hasher.finalize().to_hex().to_string()
    }

    pub fn short_fingerprint(&self, schema_version: u64) -> String {
        self.fingerprint(schema_version)[..12].to_string()
    }
}

/// Canonical field type, one variant per coercion target the parser can
/// produce.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldType {
    String,
    Int32,
    Int64,
    Double,
    Boolean,
    TimestampMillis,
    Enum(Vec<String>),
    Array(Box<FieldType>),
    Map(Box<FieldType>, Box<FieldType>),
    Struct(Vec<FieldDef>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
}

/// A canonical, versioned schema as served by the schema manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CanonicalSchema {
    pub name: String,
    pub version: u64,
    pub fields: Vec<FieldDef>,
}

impl CanonicalSchema {
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Arrow schema used for parquet materialization. Every field is nullable
    /// at the Arrow level regardless of `required` — requiredness is a parser-time
    /// validation concern (missing required field => NonRetriable), not a storage
    /// constraint, since schema evolution only ever adds nullable columns.
    pub fn to_arrow(&self) -> SchemaRef {
        let fields: Vec<Field> = self.fields.iter().map(field_def_to_arrow).collect();
        Arc::new(Schema::new(Fields::from(fields)))
    }

    /// Physical on-disk columns the table writer materializes: top-level
    /// scalar types keep their natural Arrow type; `Array`/`Map`/`Struct`
    /// fields are flattened to a JSON-encoded `Utf8` column. Building true
    /// nested Arrow arrays row-by-row is not worth the complexity for a
    /// partition-keyed append-only writer that never reads its own files
    /// back — downstream query engines that need the nested shape can
    /// parse the JSON column. This is separate from `to_arrow()`, which
    /// describes the schema manager's full-fidelity structural type.
    pub fn materialized_columns(&self) -> Vec<(String, DataType)> {
        self.fields
            .iter()
            .map(|f| {
                let ty = match &f.field_type {
                    FieldType::Array(_) | FieldType::Map(_, _) | FieldType::Struct(_) => DataType::Utf8,
                    other => field_type_to_arrow(other),
                };
                (f.name.clone(), ty)
            })
            .collect()
    }

    /// All physical columns the table writer materializes for a row of this
    /// schema: the canonical columns (`materialized_columns()`) followed by
    /// the fixed lineage columns `Enricher::enrich` always attaches
    /// (`enrichment_columns()`). The enrichment columns are never part of the
    /// schema manager's document — they're synthesized by the engine itself —
    /// so they're appended here rather than folded into `fields`.
    pub fn materialized_columns_with_enrichment(&self) -> Vec<(String, DataType)> {
        let mut columns = self.materialized_columns();
        columns.extend(enrichment_columns());
        columns
    }

    /// Widen this schema by union with `other`, adding new nullable fields only.
    /// Returns `None` if `other` requires a type-narrowing or type-changing edit
    /// that isn't a sanctioned widening (schema-change policy).
    pub fn widen(&self, other: &CanonicalSchema, allow_int_float_widen: bool) -> Option<CanonicalSchema> {
        let mut fields = self.fields.clone();
        for incoming in &other.fields {
            match fields.iter_mut().find(|f| f.name == incoming.name) {
                None => fields.push(FieldDef {
                    required: false,
                    ..incoming.clone()
                }),
                Some(existing) => {
                    if existing.field_type == incoming.field_type {
                        continue;
                    }
                    match promote(&existing.field_type, &incoming.field_type, allow_int_float_widen) {
                        Some(promoted) => existing.field_type = promoted,
                        None => return None,
                    }
                }
            }
        }
        Some(CanonicalSchema {
            name: self.name.clone(),
            version: self.version + 1,
            fields,
        })
    }
}

fn promote(existing: &FieldType, incoming: &FieldType, allow_int_float_widen: bool) -> Option<FieldType> {
    use FieldType::*;
    match (existing, incoming) {
        (Int32, Int64) => Some(Int64),
        (Int32, Double) if allow_int_float_widen => Some(Double),
        (Int64, Double) if allow_int_float_widen => Some(Double),
        (a, b) if a == b => Some(a.clone()),
        _ => None,
    }
}

/// Name/type pairs for the lineage metadata `Enricher::enrich` attaches to
/// every `ParsedRecord.enrichment` map: `sourceTopic`, `sourcePartition`,
/// `sourceOffset`, `processingVersion`, `arrivalTimestamp`. Fixed rather than
/// derived from any schema, since these are synthesized by the engine and
/// never served by the schema manager.
pub fn enrichment_columns() -> Vec<(String, DataType)> {
    vec![
        ("sourceTopic".to_string(), DataType::Utf8),
        ("sourcePartition".to_string(), DataType::Int32),
        ("sourceOffset".to_string(), DataType::Int64),
        ("processingVersion".to_string(), DataType::Utf8),
        ("arrivalTimestamp".to_string(), DataType::Timestamp(TimeUnit::Millisecond, None)),
    ]
}

fn field_def_to_arrow(def: &FieldDef) -> Field {
    Field::new(&def.name, field_type_to_arrow(&def.field_type), true)
}

fn field_type_to_arrow(ty: &FieldType) -> DataType {
    match ty {
        FieldType::String | FieldType::Enum(_) => DataType::Utf8,
        FieldType::Int32 => DataType::Int32,
        FieldType::Int64 => DataType::Int64,
        FieldType::Double => DataType::Float64,
        FieldType::Boolean => DataType::Boolean,
        FieldType::TimestampMillis => DataType::Timestamp(TimeUnit::Millisecond, None),
        FieldType::Array(inner) => {
            DataType::List(Arc::new(Field::new("item", field_type_to_arrow(inner), true)))
        }
        FieldType::Map(_, value) => {
            // Modeled as a list of {key, value} structs, the common Arrow map encoding.
            let entry = Field::new(
                "entries",
                DataType::Struct(Fields::from(vec![
                    Field::new("key", DataType::Utf8, false),
                    Field::new("value", field_type_to_arrow(value), true),
                ])),
                false,
            );
            DataType::List(Arc::new(entry))
        }
        FieldType::Struct(children) => {
            let fields: Vec<Field> = children.iter().map(field_def_to_arrow).collect();
            DataType::Struct(Fields::from(fields))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(fields: Vec<FieldDef>) -> CanonicalSchema {
        CanonicalSchema { name: "t".into(), version: 1, fields }
    }

    #[test]
    fn widen_adds_nullable_field() {
        let base = schema(vec![FieldDef { name: "a".into(), field_type: FieldType::Int32, required: true }]);
        let incoming = schema(vec![FieldDef { name: "b".into(), field_type: FieldType::String, required: false }]);
        let widened = base.widen(&incoming, true).unwrap();
        assert_eq!(widened.fields.len(), 2);
        assert!(!widened.field("b").unwrap().required);
    }

    #[test]
    fn widen_rejects_narrowing() {
        let base = schema(vec![FieldDef { name: "a".into(), field_type: FieldType::Int64, required: true }]);
        let incoming = schema(vec![FieldDef { name: "a".into(), field_type: FieldType::Int32, required: true }]);
        assert!(base.widen(&incoming, true).is_none());
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let rec = ParsedRecord {
            fields: BTreeMap::from([("x".to_string(), FieldValue::Int32(1))]),
            detected_format: DetectedFormat::Json,
            cob_date: NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
            business_timestamp: None,
            enrichment: BTreeMap::new(),
            source_ref: SourceRef { topic: "t".into(), partition: 0, offset: 0 },
            correlation_id: "c".into(),
            arrival_timestamp: chrono::Utc::now(),
        };
        let batch = Batch {
            topic_logical_name: "t".into(),
            partition_tuple: vec![("cobDate".into(), "2024-01-15".into())],
            rows: vec![rec.clone(), rec],
            first_arrival: chrono::Utc::now(),
            last_arrival: chrono::Utc::now(),
            byte_size: 10,
            first_offset_per_partition: BTreeMap::new(),
            last_offset_per_partition: BTreeMap::new(),
        };
        assert_eq!(batch.fingerprint(1), batch.fingerprint(1));
    }
}
