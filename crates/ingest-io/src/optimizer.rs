//! Compaction and vacuum.
//!
//! Both operations read the live file set via [`TableWriter::live_file_set`]
//! and commit through the same append-only commit log the writer uses, so a
//! concurrent writer's commit and an optimizer's `OPTIMIZE`/`VACUUM` commit
//! race under the identical `PutMode::Create` protocol — an optimizer that
//! loses the race simply re-reads and retries its own commit, it never
//! touches the writer's.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ingest_core::{FailureKind, IngestError, TableOptions};
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::arrow_writer::ArrowWriter;
use parquet::file::properties::WriterProperties;
use tracing::{info, warn};

use crate::table_writer::{AddAction, CommitAction, CommitInfo, FileStats, RemoveAction, TableWriter};

const ENGINE_INFO: &str = concat!("streamlake/", env!("CARGO_PKG_VERSION"));
const MAX_COMMIT_RETRIES: u32 = 5;

#[derive(Debug, Default)]
pub struct OptimizeReport {
    pub bins_compacted: usize,
    pub files_removed: usize,
    pub files_added: usize,
}

#[derive(Debug, Default)]
pub struct VacuumReport {
    pub files_deleted: usize,
    pub bytes_deleted: u64,
}

pub struct Optimizer {
    store: Arc<dyn ObjectStore>,
}

impl Optimizer {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Optimizer { store }
    }

    /// Bin-packs files smaller than `minCompactFileBytes` within each
    /// partition into files near `targetFileBytes`. A bin of fewer than two
    /// files is left alone — nothing to compact ("Compaction").
    /// Each bin commits independently: a conflict on one bin doesn't abort
    /// the others.
    pub async fn optimize(
        &self,
        writer: &TableWriter,
        table_root: &str,
        table_options: &TableOptions,
        correlation_id: &str,
    ) -> Result<OptimizeReport, IngestError> {
        let mut report = OptimizeReport::default();
        let versions = writer.list_commits(table_root).await?;
        let Some(head) = versions.last().copied() else {
            return Ok(report);
        };
        let live = writer.live_file_set(table_root, head).await?;

        let mut by_partition: BTreeMap<Vec<(String, String)>, Vec<AddAction>> = BTreeMap::new();
        for add in live.into_values() {
            if add.size < table_options.min_compact_file_bytes as u64 {
                let key: Vec<(String, String)> = add.partition_values.clone().into_iter().collect();
                by_partition.entry(key).or_default().push(add);
            }
        }

        for (_partition, mut small_files) in by_partition {
            if small_files.len() < 2 {
                continue;
            }
            small_files.sort_by(|a, b| a.path.cmp(&b.path));
            let mut bins: Vec<Vec<AddAction>> = Vec::new();
            let mut current: Vec<AddAction> = Vec::new();
            let mut current_bytes = 0u64;
            for file in small_files {
                if current_bytes > 0 && current_bytes + file.size > table_options.target_file_bytes as u64 {
                    bins.push(std::mem::take(&mut current));
                    current_bytes = 0;
                }
                current_bytes += file.size;
                current.push(file);
            }
            if current.len() >= 2 {
                bins.push(current);
            }

            for bin in bins {
                match self.compact_bin(writer, table_root, &bin, correlation_id).await {
                    Ok(Some(())) => {
                        report.bins_compacted += 1;
                        report.files_removed += bin.len();
                        report.files_added += 1;
                    }
                    Ok(None) => {
                        info!(table_root, "compaction bin superseded by a concurrent writer; skipping");
                    }
                    Err(e) => warn!(table_root, error = %e, "failed to compact bin"),
                }
            }
        }
        Ok(report)
    }

    /// Reads every file in `bin` as Arrow record batches, concatenates them
    /// into one parquet file under the same partition path, then commits a
    /// `remove` for each input plus one `add` for the merged file.
    async fn compact_bin(
        &self,
        writer: &TableWriter,
        table_root: &str,
        bin: &[AddAction],
        correlation_id: &str,
    ) -> Result<Option<()>, IngestError> {
        let mut all_batches = Vec::new();
        let mut arrow_schema = None;
        let mut merged_stats = FileStats::default();
        for file in bin {
            let bytes = self
                .store
                .get(&ObjectPath::from(file.path.as_str()))
                .await
                .map_err(|e| IngestError::wrap(FailureKind::TransientStore, "failed to read compaction input", e))?
                .bytes()
                .await
                .map_err(|e| IngestError::wrap(FailureKind::TransientStore, "failed to buffer compaction input", e))?;
            let reader = ParquetRecordBatchReaderBuilder::try_new(bytes)
                .map_err(|e| IngestError::wrap(FailureKind::Config, "failed to open compaction input", e))?
                .build()
                .map_err(|e| IngestError::wrap(FailureKind::Config, "failed to read compaction input", e))?;
            for batch in reader {
                let batch = batch
                    .map_err(|e| IngestError::wrap(FailureKind::Config, "failed to decode compaction row group", e))?;
                arrow_schema.get_or_insert_with(|| batch.schema());
                all_batches.push(batch);
            }
            merge_file_stats(&mut merged_stats, &file.stats);
        }
        let anchor = bin.iter().max_by_key(|f| f.size).expect("bin has at least two files");
        let Some(arrow_schema) = arrow_schema else {
            // every input was empty; nothing to merge, drop them outright.
            let removes: Vec<RemoveAction> = bin.iter().map(|f| RemoveAction { path: f.path.clone() }).collect();
            return self
                .commit_compaction(writer, table_root, removes, None, correlation_id)
                .await;
        };

        let mut buf = Vec::new();
        {
            let props = WriterProperties::builder()
                .set_compression(parquet::basic::Compression::SNAPPY)
                .build();
            let mut out = ArrowWriter::try_new(&mut buf, arrow_schema, Some(props))
                .map_err(|e| IngestError::wrap(FailureKind::Config, "failed to open compaction output", e))?;
            for batch in &all_batches {
                out.write(batch)
                    .map_err(|e| IngestError::wrap(FailureKind::Config, "failed to write compacted row group", e))?;
            }
            out.close()
                .map_err(|e| IngestError::wrap(FailureKind::Config, "failed to close compaction output", e))?;
        }
        let size = buf.len() as u64;
        let merged_path = ObjectPath::from(format!(
            "{}-compacted-{}.parquet",
            anchor.path.trim_end_matches(".parquet"),
            uuid::Uuid::new_v4()
        ));
        self.store
            .put(&merged_path, buf.into())
            .await
            .map_err(|e| IngestError::wrap(FailureKind::TransientStore, "failed to upload compacted file", e))?;

        let add = AddAction {
            path: merged_path.to_string(),
            size,
            partition_values: anchor.partition_values.clone(),
            stats: merged_stats,
        };
        let removes: Vec<RemoveAction> = bin.iter().map(|f| RemoveAction { path: f.path.clone() }).collect();
        self.commit_compaction(writer, table_root, removes, Some(add), correlation_id).await
    }

    async fn commit_compaction(
        &self,
        writer: &TableWriter,
        table_root: &str,
        removes: Vec<RemoveAction>,
        add: Option<AddAction>,
        correlation_id: &str,
    ) -> Result<Option<()>, IngestError> {

        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let versions = writer.list_commits(table_root).await?;
            let head = versions.last().copied().unwrap_or(0);
            let next = head + 1;
            let mut actions: Vec<CommitAction> = removes.iter().cloned().map(CommitAction::Remove).collect();
            if let Some(add) = &add {
                actions.push(CommitAction::Add(add.clone()));
            }
            actions.push(CommitAction::CommitInfo(CommitInfo {
                timestamp: Utc::now(),
                operation: "OPTIMIZE".to_string(),
                engine_info: ENGINE_INFO.to_string(),
                correlation_id: correlation_id.to_string(),
                batch_fingerprint: None,
            }));
            match writer.try_commit_for_optimizer(table_root, next, &actions).await {
                Ok(true) => return Ok(Some(())),
                Ok(false) => {
                    if attempt > MAX_COMMIT_RETRIES {
                        return Ok(None);
                    }
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Deletes every file not in the live set and not added within
    /// `retentionWindow` ("Vacuum"). Refuses outright if the
    /// configured retention is shorter than the reader's max lookback —
    /// running it would risk deleting a file an in-flight read still needs.
    pub async fn vacuum(
        &self,
        writer: &TableWriter,
        table_root: &str,
        table_options: &TableOptions,
        reader_max_lookback_hours: u64,
    ) -> Result<VacuumReport, IngestError> {
        if table_options.vacuum_retention_hours < reader_max_lookback_hours {
            return Err(IngestError::new(
                FailureKind::Config,
                format!(
                    "vacuum retention ({}) is shorter than reader max lookback ({}); refusing to run",
                    table_options.vacuum_retention_hours, reader_max_lookback_hours
                ),
            ));
        }

        let versions = writer.list_commits(table_root).await?;
        let Some(head) = versions.last().copied() else {
            return Ok(VacuumReport::default());
        };
        let live = writer.live_file_set(table_root, head).await?;
        let retention = chrono::Duration::hours(table_options.vacuum_retention_hours as i64);
        let cutoff = Utc::now() - retention;

        let mut report = VacuumReport::default();
        let data_prefix = ObjectPath::from(format!("{table_root}/"));
        let commits_prefix = ObjectPath::from(format!("{table_root}/_commits/"));
        use futures::StreamExt;
        let mut stream = self.store.list(Some(&data_prefix));
        while let Some(meta) = stream.next().await {
            let meta = meta.map_err(|e| {
                IngestError::wrap(FailureKind::TransientStore, "failed to list table files during vacuum", e)
            })?;
            if meta.location.as_ref().starts_with(commits_prefix.as_ref()) {
                continue;
            }
            if live.contains_key(meta.location.as_ref()) {
                continue;
            }
            if last_modified_after(meta.last_modified, cutoff) {
                continue;
            }
            self.store.delete(&meta.location).await.map_err(|e| {
                IngestError::wrap(FailureKind::TransientStore, "failed to delete orphaned file", e)
            })?;
            report.files_deleted += 1;
            report.bytes_deleted += meta.size as u64;
        }
        Ok(report)
    }
}

fn last_modified_after(last_modified: DateTime<Utc>, cutoff: DateTime<Utc>) -> bool {
    last_modified > cutoff
}

/// Folds one input file's per-column stats into the running merge. Min/max
/// comparisons are string/number-shaped JSON, same ordering `column_stats`
/// in the table writer uses.
fn merge_file_stats(into: &mut FileStats, other: &FileStats) {
    into.total_count += other.total_count;
    for (col, count) in &other.null_count {
        *into.null_count.entry(col.clone()).or_insert(0) += count;
    }
    for (col, value) in &other.min {
        let slot = into.min.entry(col.clone()).or_insert_with(|| value.clone());
        if json_value_lt(value, slot) {
            *slot = value.clone();
        }
    }
    for (col, value) in &other.max {
        let slot = into.max.entry(col.clone()).or_insert_with(|| value.clone());
        if json_value_lt(slot, value) {
            *slot = value.clone();
        }
    }
}

fn json_value_lt(a: &serde_json::Value, b: &serde_json::Value) -> bool {
    use serde_json::Value;
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a.as_f64().unwrap_or(f64::NAN) < b.as_f64().unwrap_or(f64::NAN),
        (Value::String(a), Value::String(b)) => a < b,
        (Value::Bool(a), Value::Bool(b)) => !a && *b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingest_core::CommitCache;
    use std::sync::Arc as StdArc;

    #[tokio::test]
    async fn vacuum_refuses_when_retention_shorter_than_lookback() {
        let store: Arc<dyn ObjectStore> = Arc::new(object_store::memory::InMemory::new());
        let writer = TableWriter::new(store.clone(), StdArc::new(CommitCache::new()));
        let optimizer = Optimizer::new(store);
        let options = TableOptions { vacuum_retention_hours: 24, ..Default::default() };

        let err = optimizer
            .vacuum(&writer, "warehouse/trades", &options, 48)
            .await
            .expect_err("retention shorter than reader lookback must refuse to run");
        assert_eq!(err.kind(), FailureKind::Config);
    }

    #[test]
    fn last_modified_after_respects_cutoff() {
        let now = Utc::now();
        assert!(last_modified_after(now, now - chrono::Duration::hours(1)));
        assert!(!last_modified_after(now - chrono::Duration::hours(2), now - chrono::Duration::hours(1)));
    }
}
