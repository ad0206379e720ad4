//! Transactional table writer.
//!
//! Owns the commit log protocol: data files are columnar parquet under
//! `<prefix>/<col=value>/.../part-<uuid>-<fp>.parquet`; commits are an
//! ordered, gapless JSONL sequence at `<prefix>/_commits/<20-digit-version>.json`,
//! one JSON value per line in the order `protocol?`, `metaData?`, `add*`,
//! `remove*`, `commitInfo`. Concurrent writers race on the object store's
//! atomic create-if-absent primitive (`PutMode::Create`); the loser either
//! discovers its own fingerprint already landed (dedup) or rebases and
//! retries at the new head.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use datafusion::arrow::array::{
    ArrayRef, BooleanArray, Float64Array, Int32Array, Int64Array, StringArray,
    TimestampMillisecondArray,
};
use datafusion::arrow::datatypes::{DataType, Schema as ArrowSchema};
use datafusion::arrow::record_batch::RecordBatch;
use parquet::arrow::arrow_writer::ArrowWriter;
use parquet::file::properties::WriterProperties;
use ingest_core::{
    Batch, CanonicalSchema, CommitCache, FailureKind, FieldValue, IngestError, ParsedRecord,
    PartitionTuple, TableOptions,
};
use object_store::path::Path as ObjectPath;
use object_store::{Error as StoreError, ObjectStore, PutMode, PutOptions, PutPayload};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{info, warn};
use uuid::Uuid;

const COMMITS_DIR: &str = "_commits";
const ENGINE_INFO: &str = concat!("streamlake/", env!("CARGO_PKG_VERSION"));
const MAX_CONFLICT_RETRIES: u32 = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolAction {
    pub min_reader_version: u32,
    pub min_writer_version: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetaDataAction {
    pub schema: CanonicalSchema,
    pub partition_columns: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct FileStats {
    pub min: BTreeMap<String, JsonValue>,
    pub max: BTreeMap<String, JsonValue>,
    pub null_count: BTreeMap<String, u64>,
    pub total_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddAction {
    pub path: String,
    pub size: u64,
    pub partition_values: BTreeMap<String, String>,
    pub stats: FileStats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoveAction {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitInfo {
    pub timestamp: DateTime<Utc>,
    pub operation: String,
    pub engine_info: String,
    pub correlation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_fingerprint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
pub enum CommitAction {
    Protocol(ProtocolAction),
    MetaData(MetaDataAction),
    Add(AddAction),
    Remove(RemoveAction),
    CommitInfo(CommitInfo),
}

/// One fully-parsed commit file: its version plus the ordered actions.
#[derive(Debug, Clone)]
pub struct Commit {
    pub version: u64,
    pub actions: Vec<CommitAction>,
}

impl Commit {
    pub fn fingerprint(&self) -> Option<&str> {
        self.actions.iter().find_map(|a| match a {
            CommitAction::CommitInfo(info) => info.batch_fingerprint.as_deref(),
            _ => None,
        })
    }
}

#[derive(Debug, Clone)]
pub struct CommitResult {
    pub version: u64,
    pub files_added: usize,
    pub bytes_added: u64,
    pub rows_added: usize,
}

pub struct TableWriter {
    store: Arc<dyn ObjectStore>,
    commit_cache: Arc<CommitCache>,
}

impl TableWriter {
    pub fn new(store: Arc<dyn ObjectStore>, commit_cache: Arc<CommitCache>) -> Self {
        TableWriter { store, commit_cache }
    }

    fn commit_path(table_root: &str, version: u64) -> ObjectPath {
        ObjectPath::from(format!("{table_root}/{COMMITS_DIR}/{version:020}.json"))
    }

    /// Lists and parses every commit version found under `_commits/`,
    /// ascending.
    pub async fn list_commits(&self, table_root: &str) -> Result<Vec<u64>, IngestError> {
        let prefix = ObjectPath::from(format!("{table_root}/{COMMITS_DIR}/"));
        let mut versions = Vec::new();
        let mut stream = self.store.list(Some(&prefix));
        use futures::StreamExt;
        while let Some(meta) = stream.next().await {
            let meta = meta.map_err(|e| {
                IngestError::wrap(FailureKind::TransientStore, "failed to list commit log", e)
            })?;
            if let Some(name) = meta.location.filename() {
                if let Some(digits) = name.strip_suffix(".json") {
                    if digits.len() == 20 && digits.bytes().all(|b| b.is_ascii_digit()) {
                        if let Ok(v) = digits.parse::<u64>() {
                            versions.push(v);
                        }
                    }
                }
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }

    pub async fn read_commit(&self, table_root: &str, version: u64) -> Result<Commit, IngestError> {
        let path = Self::commit_path(table_root, version);
        let get = self.store.get(&path).await.map_err(|e| {
            IngestError::wrap(FailureKind::TransientStore, format!("failed to read commit {version}"), e)
        })?;
        let bytes = get.bytes().await.map_err(|e| {
            IngestError::wrap(FailureKind::TransientStore, "failed to buffer commit body", e)
        })?;
        let text = std::str::from_utf8(&bytes)
            .map_err(|e| IngestError::wrap(FailureKind::Config, "commit log is not valid UTF-8", e))?;
        let actions = text
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(serde_json::from_str::<CommitAction>)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| IngestError::wrap(FailureKind::Config, "malformed commit log entry", e))?;
        Ok(Commit { version, actions })
    }

    /// Folds `add`/`remove` actions across commits `0..=version` into the
    /// live file set ("Live file set").
    pub async fn live_file_set(
        &self,
        table_root: &str,
        version: u64,
    ) -> Result<BTreeMap<String, AddAction>, IngestError> {
        let mut live = BTreeMap::new();
        for v in 0..=version {
            let commit = self.read_commit(table_root, v).await?;
            for action in commit.actions {
                match action {
                    CommitAction::Add(add) => {
                        live.insert(add.path.clone(), add);
                    }
                    CommitAction::Remove(remove) => {
                        live.remove(&remove.path);
                    }
                    _ => {}
                }
            }
        }
        Ok(live)
    }

    /// Scans commits for the most recently committed schema (the latest
    /// `metaData` action up to `version`).
    pub async fn resolve_schema(
        &self,
        table_root: &str,
        version: u64,
    ) -> Result<Option<MetaDataAction>, IngestError> {
        let mut found = None;
        for v in 0..=version {
            let commit = self.read_commit(table_root, v).await?;
            for action in commit.actions {
                if let CommitAction::MetaData(meta) = action {
                    found = Some(meta);
                }
            }
        }
        Ok(found)
    }

    /// Writes `batch` into the table at `table_root`, creating the table on
    /// first write. Returns `Ok(None)` for an empty batch (no commit, no
    /// files — boundary behaviour) or when the batch's fingerprint
    /// is already present in a prior commit (idempotent replay dedup).
    pub async fn write_batch(
        &self,
        table_root: &str,
        topic_logical_name: &str,
        batch: &Batch,
        incoming_schema: &CanonicalSchema,
        table_options: &TableOptions,
        partition_columns: &[String],
        correlation_id: &str,
    ) -> Result<Option<CommitResult>, IngestError> {
        if batch.rows.is_empty() {
            return Ok(None);
        }

        let fingerprint = batch.fingerprint(incoming_schema.version);
        let short_fp = batch.short_fingerprint(incoming_schema.version);

        if self.commit_cache.contains(topic_logical_name, &fingerprint).await {
            info!(topic = topic_logical_name, fp = %fingerprint, "batch already applied (cache hit); skipping write");
            return Ok(None);
        }

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let versions = self.list_commits(table_root).await?;
            let head = versions.last().copied();

            let (live_schema, schema_action) = match head {
                None => (incoming_schema.clone(), Some(MetaDataAction {
                    schema: incoming_schema.clone(),
                    partition_columns: partition_columns.to_vec(),
                })),
                Some(v) => {
                    let meta = self.resolve_schema(table_root, v).await?.ok_or_else(|| {
                        IngestError::new(FailureKind::Config, "table has commits but no metaData action")
                    })?;
                    if meta.partition_columns != partition_columns {
                        return Err(IngestError::new(
                            FailureKind::Config,
                            "topic's declared partition columns differ from the table's",
                        ));
                    }
                    if meta.schema.fields == incoming_schema.fields {
                        (meta.schema, None)
                    } else if table_options.enable_schema_evolution {
                        match meta.schema.widen(incoming_schema, table_options.allow_int_float_widen) {
                            Some(widened) => (widened.clone(), Some(MetaDataAction {
                                schema: widened,
                                partition_columns: partition_columns.to_vec(),
                            })),
                            None => {
                                return Err(IngestError::new(
                                    FailureKind::Schema,
                                    "incoming batch requires a forbidden schema change (drop/rename/narrow)",
                                ))
                            }
                        }
                    } else {
                        return Err(IngestError::new(
                            FailureKind::Schema,
                            "schema evolution disabled and batch introduces new/changed fields",
                        ));
                    }
                }
            };

            let files = self
                .write_data_files(table_root, batch, &live_schema, table_options, &short_fp)
                .await?;
            let rows_added = batch.rows.len();
            let bytes_added: u64 = files.iter().map(|f| f.size).sum();

            let next_version = head.map(|v| v + 1).unwrap_or(0);
            let mut actions = Vec::new();
            if head.is_none() {
                actions.push(CommitAction::Protocol(ProtocolAction { min_reader_version: 1, min_writer_version: 1 }));
            }
            if let Some(meta) = schema_action {
                actions.push(CommitAction::MetaData(meta));
            }
            for f in &files {
                actions.push(CommitAction::Add(f.clone()));
            }
            actions.push(CommitAction::CommitInfo(CommitInfo {
                timestamp: Utc::now(),
                operation: "WRITE".to_string(),
                engine_info: ENGINE_INFO.to_string(),
                correlation_id: correlation_id.to_string(),
                batch_fingerprint: Some(fingerprint.clone()),
            }));

            match self.try_commit(table_root, next_version, &actions).await {
                Ok(()) => {
                    self.commit_cache.insert(topic_logical_name, fingerprint.clone()).await;
                    info!(
                        topic = topic_logical_name,
                        version = next_version,
                        files = files.len(),
                        rows = rows_added,
                        "committed batch"
                    );
                    return Ok(Some(CommitResult {
                        version: next_version,
                        files_added: files.len(),
                        bytes_added,
                        rows_added,
                    }));
                }
                Err(ConflictOrError::Error(e)) => return Err(e),
                Err(ConflictOrError::Conflict) => {
                    warn!(topic = topic_logical_name, version = next_version, attempt, "commit conflict");
                    let new_versions = self.list_commits(table_root).await?;
                    for v in new_versions.iter().filter(|v| **v >= next_version) {
                        let commit = self.read_commit(table_root, *v).await?;
                        if commit.fingerprint() == Some(fingerprint.as_str()) {
                            self.commit_cache.insert(topic_logical_name, fingerprint.clone()).await;
                            info!(topic = topic_logical_name, version = v, "already-applied by a concurrent writer");
                            return Ok(None);
                        }
                    }
                    if attempt > MAX_CONFLICT_RETRIES {
                        return Err(IngestError::new(
                            FailureKind::CommitConflict,
                            format!("exceeded {MAX_CONFLICT_RETRIES} conflict retries on {table_root}"),
                        ));
                    }
                    let backoff = ingest_core::retry::backoff(50, 2_000, attempt);
                    tokio::time::sleep(backoff).await;
                    // loop: re-read head and rebase
                }
            }
        }
    }

    /// Used by the optimizer, which commits its own `remove`/`add`/`commitInfo`
    /// sequences through the same atomic-create protocol but owns its own
    /// conflict-retry loop (bin-by-bin rather than whole-batch).
    pub(crate) async fn try_commit_for_optimizer(
        &self,
        table_root: &str,
        version: u64,
        actions: &[CommitAction],
    ) -> Result<bool, IngestError> {
        match self.try_commit(table_root, version, actions).await {
            Ok(()) => Ok(true),
            Err(ConflictOrError::Conflict) => Ok(false),
            Err(ConflictOrError::Error(e)) => Err(e),
        }
    }

    async fn try_commit(
        &self,
        table_root: &str,
        version: u64,
        actions: &[CommitAction],
    ) -> Result<(), ConflictOrError> {
        let mut body = String::new();
        for action in actions {
            let line = serde_json::to_string(action).map_err(|e| {
                ConflictOrError::Error(IngestError::wrap(FailureKind::Config, "failed to encode commit action", e))
            })?;
            body.push_str(&line);
            body.push('\n');
        }
        let path = Self::commit_path(table_root, version);
        let result = self
            .store
            .put_opts(
                &path,
                PutPayload::from(body.into_bytes()),
                PutOptions { mode: PutMode::Create, ..Default::default() },
            )
            .await;
        match result {
            Ok(_) => Ok(()),
            Err(StoreError::AlreadyExists { .. }) => Err(ConflictOrError::Conflict),
            Err(e) => Err(ConflictOrError::Error(IngestError::wrap(
                FailureKind::TransientStore,
                "commit write failed",
                e,
            ))),
        }
    }

    /// Writes one or more parquet files for `batch`, splitting by
    /// `targetFileBytes` so a batch whose encoded size exceeds a single file
    /// target still lands in one commit across multiple files. All rows
    /// share one partition tuple (the `Batch` invariant), so every file in
    /// this call lands under the same partition path.
    async fn write_data_files(
        &self,
        table_root: &str,
        batch: &Batch,
        schema: &CanonicalSchema,
        table_options: &TableOptions,
        short_fp: &str,
    ) -> Result<Vec<AddAction>, IngestError> {
        let arrow_schema = Arc::new(ArrowSchema::new(
            schema
                .materialized_columns_with_enrichment()
                .into_iter()
                .map(|(name, ty)| datafusion::arrow::datatypes::Field::new(name, ty, true))
                .collect::<Vec<_>>(),
        ));

        let chunk_rows = estimate_rows_per_file(&batch.rows, table_options.target_file_bytes);
        let mut files = Vec::new();
        for chunk in batch.rows.chunks(chunk_rows.max(1)) {
            let record_batch = rows_to_record_batch(chunk, &arrow_schema)?;
            let stats = column_stats(chunk, schema);
            let mut buf = Vec::new();
            let props = WriterProperties::builder()
                .set_compression(parquet::basic::Compression::SNAPPY)
                .build();
            {
                let mut writer = ArrowWriter::try_new(&mut buf, arrow_schema.clone(), Some(props))
                    .map_err(|e| IngestError::wrap(FailureKind::Config, "failed to create parquet writer", e))?;
                writer
                    .write(&record_batch)
                    .map_err(|e| IngestError::wrap(FailureKind::Config, "failed to write parquet row group", e))?;
                writer
                    .close()
                    .map_err(|e| IngestError::wrap(FailureKind::Config, "failed to close parquet writer", e))?;
            }
            let partition_path = partition_path_segment(&batch.partition_tuple);
            let file_name = format!("part-{}-{}.parquet", Uuid::new_v4(), short_fp);
            let path = ObjectPath::from(format!("{table_root}/{partition_path}/{file_name}"));
            let size = buf.len() as u64;
            self.store
                .put(&path, PutPayload::from(buf))
                .await
                .map_err(|e| IngestError::wrap(FailureKind::TransientStore, "failed to upload data file", e))?;
            files.push(AddAction {
                path: path.to_string(),
                size,
                partition_values: batch.partition_tuple.iter().cloned().collect(),
                stats,
            });
        }
        Ok(files)
    }
}

enum ConflictOrError {
    Conflict,
    Error(IngestError),
}

fn partition_path_segment(tuple: &PartitionTuple) -> String {
    tuple.iter().map(|(k, v)| format!("{k}={v}")).collect::<Vec<_>>().join("/")
}

/// A rough sizing heuristic: since we don't know compressed size up front,
/// split by an average uncompressed-bytes-per-row estimate against
/// `targetFileBytes`, erring toward fewer, larger files (default target is
/// ~128 MiB uncompressed per row group).
fn estimate_rows_per_file(rows: &[ParsedRecord], target_file_bytes: usize) -> usize {
    if rows.is_empty() {
        return 1;
    }
    let sample: usize = rows.iter().take(32).map(|r| r.canonical_bytes().len().max(1)).sum();
    let avg = (sample / rows.len().min(32).max(1)).max(1);
    (target_file_bytes / avg).max(1)
}

/// Builds one Arrow column per field of `arrow_schema`, which covers both
/// the canonical schema columns and the lineage enrichment columns
/// (`materialized_columns_with_enrichment`). Each value is looked up by
/// column name in `r.fields` first, falling back to `r.enrichment` — the
/// canonical columns only ever live in `fields`, the enrichment columns only
/// ever live in `enrichment`, so the fallback resolves every column exactly
/// once with no ambiguity.
fn rows_to_record_batch(rows: &[ParsedRecord], arrow_schema: &Arc<ArrowSchema>) -> Result<RecordBatch, IngestError> {
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(arrow_schema.fields().len());
    for arrow_field in arrow_schema.fields() {
        let name = arrow_field.name();
        let values: Vec<Option<FieldValue>> = rows
            .iter()
            .map(|r| r.fields.get(name).or_else(|| r.enrichment.get(name)).cloned())
            .collect();
        columns.push(build_array(arrow_field.data_type(), &values)?);
    }
    RecordBatch::try_new(arrow_schema.clone(), columns)
        .map_err(|e| IngestError::wrap(FailureKind::Config, "failed to assemble record batch", e))
}

fn build_array(data_type: &DataType, values: &[Option<FieldValue>]) -> Result<ArrayRef, IngestError> {
    let array: ArrayRef = match data_type {
        DataType::Int32 => Arc::new(Int32Array::from(
            values.iter().map(|v| match v {
                Some(FieldValue::Int32(n)) => Some(*n),
                _ => None,
            }).collect::<Vec<_>>(),
        )),
        DataType::Int64 => Arc::new(Int64Array::from(
            values.iter().map(|v| match v {
                Some(FieldValue::Int64(n)) => Some(*n),
                Some(FieldValue::Int32(n)) => Some(*n as i64),
                _ => None,
            }).collect::<Vec<_>>(),
        )),
        DataType::Float64 => Arc::new(Float64Array::from(
            values.iter().map(|v| match v {
                Some(FieldValue::Double(n)) => Some(*n),
                Some(FieldValue::Int32(n)) => Some(*n as f64),
                Some(FieldValue::Int64(n)) => Some(*n as f64),
                _ => None,
            }).collect::<Vec<_>>(),
        )),
        DataType::Boolean => Arc::new(BooleanArray::from(
            values.iter().map(|v| match v {
                Some(FieldValue::Boolean(b)) => Some(*b),
                _ => None,
            }).collect::<Vec<_>>(),
        )),
        DataType::Timestamp(_, _) => Arc::new(TimestampMillisecondArray::from(
            values.iter().map(|v| match v {
                Some(FieldValue::TimestampMillis(ms)) => Some(*ms),
                _ => None,
            }).collect::<Vec<_>>(),
        )),
        // String, Enum (Utf8) and every flattened complex type.
        _ => Arc::new(StringArray::from(
            values
                .iter()
                .map(|v| match v {
                    Some(FieldValue::String(s)) => Some(s.clone()),
                    Some(FieldValue::Enum(s)) => Some(s.clone()),
                    Some(other @ (FieldValue::Array(_) | FieldValue::Map(_) | FieldValue::Struct(_))) => {
                        Some(other.to_json().to_string())
                    }
                    Some(FieldValue::Null) | None => None,
                    Some(other) => Some(other.to_json().to_string()),
                })
                .collect::<Vec<_>>(),
        )),
    };
    Ok(array)
}

/// Per-column min/max/null-count/total-count (step 4 "Per-file
/// statistics"). Computed directly from `FieldValue`s rather than read back
/// from the Arrow arrays — it's the same data, one pass, no double work.
/// Covers the canonical schema columns plus the fixed lineage enrichment
/// columns, the same column set `rows_to_record_batch` materializes.
fn column_stats(rows: &[ParsedRecord], schema: &CanonicalSchema) -> FileStats {
    let mut stats = FileStats { total_count: rows.len() as u64, ..Default::default() };
    let column_names = schema
        .fields
        .iter()
        .map(|f| f.name.clone())
        .chain(ingest_core::enrichment_columns().into_iter().map(|(name, _)| name));
    for name in column_names {
        let mut null_count = 0u64;
        let mut min: Option<JsonValue> = None;
        let mut max: Option<JsonValue> = None;
        for row in rows {
            match row.fields.get(&name).or_else(|| row.enrichment.get(&name)) {
                None | Some(FieldValue::Null) => null_count += 1,
                Some(value) => {
                    let json = value.to_json();
                    if min.as_ref().map(|m| json_lt(&json, m)).unwrap_or(true) {
                        min = Some(json.clone());
                    }
                    if max.as_ref().map(|m| json_lt(m, &json)).unwrap_or(true) {
                        max = Some(json);
                    }
                }
            }
        }
        stats.null_count.insert(name.clone(), null_count);
        if let Some(m) = min {
            stats.min.insert(name.clone(), m);
        }
        if let Some(m) = max {
            stats.max.insert(name, m);
        }
    }
    stats
}

fn json_lt(a: &JsonValue, b: &JsonValue) -> bool {
    match (a, b) {
        (JsonValue::Number(a), JsonValue::Number(b)) => {
            a.as_f64().unwrap_or(f64::NAN) < b.as_f64().unwrap_or(f64::NAN)
        }
        (JsonValue::String(a), JsonValue::String(b)) => a < b,
        (JsonValue::Bool(a), JsonValue::Bool(b)) => !a && *b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_path_is_zero_padded_twenty_digits() {
        let path = TableWriter::commit_path("warehouse/trades", 7);
        assert_eq!(path.to_string(), "warehouse/trades/_commits/00000000000000000007.json");
    }

    #[test]
    fn commit_fingerprint_extracted_from_commit_info() {
        let commit = Commit {
            version: 1,
            actions: vec![CommitAction::CommitInfo(CommitInfo {
                timestamp: Utc::now(),
                operation: "WRITE".into(),
                engine_info: "x".into(),
                correlation_id: "c".into(),
                batch_fingerprint: Some("abc".into()),
            })],
        };
        assert_eq!(commit.fingerprint(), Some("abc"));
    }

    #[test]
    fn json_lt_orders_numbers_and_strings() {
        assert!(json_lt(&JsonValue::from(1), &JsonValue::from(2)));
        assert!(json_lt(&JsonValue::String("a".into()), &JsonValue::String("b".into())));
    }

    fn test_schema() -> CanonicalSchema {
        CanonicalSchema {
            name: "trades".into(),
            version: 1,
            fields: vec![
                ingest_core::FieldDef {
                    name: "cobDate".into(),
                    field_type: ingest_core::FieldType::String,
                    required: true,
                },
                ingest_core::FieldDef {
                    name: "id".into(),
                    field_type: ingest_core::FieldType::Int64,
                    required: true,
                },
            ],
        }
    }

    fn test_batch() -> Batch {
        let row = ParsedRecord {
            fields: BTreeMap::from([
                ("cobDate".to_string(), FieldValue::String("2024-01-15".to_string())),
                ("id".to_string(), FieldValue::Int64(1)),
            ]),
            detected_format: ingest_core::DetectedFormat::Json,
            cob_date: chrono::NaiveDate::from_ymd_opt(2024, 1, 15).unwrap(),
            business_timestamp: None,
            enrichment: BTreeMap::new(),
            source_ref: ingest_core::SourceRef { topic: "trades".into(), partition: 0, offset: 0 },
            correlation_id: "c1".into(),
            arrival_timestamp: Utc::now(),
        };
        Batch {
            topic_logical_name: "trades".into(),
            partition_tuple: vec![("cobDate".into(), "2024-01-15".into())],
            rows: vec![row],
            first_arrival: Utc::now(),
            last_arrival: Utc::now(),
            byte_size: 64,
            first_offset_per_partition: BTreeMap::from([(0, 0)]),
            last_offset_per_partition: BTreeMap::from([(0, 0)]),
        }
    }

    #[tokio::test]
    async fn write_batch_creates_first_commit_and_is_idempotent_on_replay() {
        let store: Arc<dyn ObjectStore> = Arc::new(object_store::memory::InMemory::new());
        let writer = TableWriter::new(store, Arc::new(CommitCache::new()));
        let schema = test_schema();
        let batch = test_batch();
        let options = TableOptions::default();

        let partition_columns = vec!["cobDate".to_string()];
        let first = writer
            .write_batch(
                "warehouse/trades",
                "trades",
                &batch,
                &schema,
                &options,
                &partition_columns,
                "corr-1",
            )
            .await
            .unwrap()
            .expect("non-empty batch commits");
        assert_eq!(first.version, 0);
        assert_eq!(first.rows_added, 1);

        // Replaying the identical batch (same fingerprint) must not add a
        // second commit or duplicate rows.
        let replay = writer
            .write_batch(
                "warehouse/trades",
                "trades",
                &batch,
                &schema,
                &options,
                &partition_columns,
                "corr-2",
            )
            .await
            .unwrap();
        assert!(replay.is_none());
        assert_eq!(writer.list_commits("warehouse/trades").await.unwrap(), vec![0]);
    }
}
