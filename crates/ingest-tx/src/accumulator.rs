//! Batch accumulator & flush scheduler.
//!
//! Owns the `BatchTable`: an in-memory map from `(topicLogicalName,
//! partitionTuple)` to the open `Batch` for that key. A single-threaded
//! scheduler per topic (the caller drives one `Accumulator` per topic, never
//! shared across topics) decides when a key's batch is ready to flush.
//!
//! This module never talks to the object store or the broker. It is pure
//! bookkeeping: `push` appends a row and may return a `Batch` that must be
//! flushed immediately; `poll_due` is called periodically by the owning
//! scheduler task to catch age-triggered and memory-triggered flushes that
//! no `push` would otherwise surface.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use ingest_core::{Batch, ParsedRecord, PartitionTuple};

/// Why a batch was selected for flush, reported so the caller can log /
/// tag metrics distinctly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    RowCount,
    Age,
    MemoryBudget,
    Revocation,
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct AccumulatorConfig {
    pub batch_max_rows: usize,
    pub batch_max_bytes: usize,
    pub flush_interval: chrono::Duration,
    /// Declared partition columns in table order, set once at table
    /// creation. The first entry is conventionally the COB field but need
    /// not be named `cobDate`.
    pub partition_columns: Vec<String>,
    /// Name of the field the parser extracted `cobDate` from
    /// (`destination.cobField`, default `"cobDate"`).
    pub cob_field: String,
}

struct OpenBatch {
    batch: Batch,
}

/// Per-topic accumulator. The engine constructs one per configured topic and
/// never shares it across tokio tasks — the table of open batches is owned
/// by a single scheduler per topic.
pub struct BatchAccumulator {
    topic_logical_name: String,
    config: AccumulatorConfig,
    open: BTreeMap<PartitionTuple, OpenBatch>,
}

impl BatchAccumulator {
    pub fn new(topic_logical_name: String, config: AccumulatorConfig) -> Self {
        BatchAccumulator { topic_logical_name, config, open: BTreeMap::new() }
    }

    /// Total bytes currently held across every open key in this topic's
    /// accumulator. Feeds into the engine's global memory budget accounting.
    pub fn byte_size(&self) -> usize {
        self.open.values().map(|b| b.batch.byte_size).sum()
    }

    pub fn open_key_count(&self) -> usize {
        self.open.len()
    }

    /// Earliest `firstArrival` across every open key, fed to the process-wide
    /// `GlobalMemoryTracker` so it can pick which topic sheds first when the
    /// total crosses `globalMemoryBudget`.
    pub fn oldest_arrival(&self) -> Option<DateTime<Utc>> {
        self.open.values().map(|b| b.batch.first_arrival).min()
    }

    /// Flushes and removes the single oldest-by-`firstArrival` open batch, if
    /// any. Used only under the global memory budget's "oldest-first" shed
    /// policy — ordinary flushes go through `push`/`due_by_age`/`drain_all`.
    pub fn pop_oldest(&mut self) -> Option<Batch> {
        let key = self.open.iter().min_by_key(|(_, b)| b.batch.first_arrival).map(|(k, _)| k.clone())?;
        self.open.remove(&key).map(|b| b.batch)
    }

    /// Approximate in-memory byte size of one parsed row, used for both the
    /// row-count/byte-size flush trigger and global memory accounting.
    fn row_size(row: &ParsedRecord) -> usize {
        row.canonical_bytes().len()
    }

    /// Append a parsed row to the batch for its partition tuple, creating a
    /// new batch if none is open. Returns `Some(trigger)` if the row count or
    /// byte-size threshold was crossed and the caller must flush this key
    /// immediately, in which case the full batch is also returned.
    pub fn push(&mut self, row: ParsedRecord) -> Option<(Batch, FlushTrigger)> {
        let partition_tuple = partition_tuple_of(&row, &self.config.partition_columns, &self.config.cob_field);
        let size = Self::row_size(&row);
        let now = row_arrival(&row);

        let entry = self.open.entry(partition_tuple.clone()).or_insert_with(|| OpenBatch {
            batch: Batch {
                topic_logical_name: self.topic_logical_name.clone(),
                partition_tuple: partition_tuple.clone(),
                rows: Vec::new(),
                first_arrival: now,
                last_arrival: now,
                byte_size: 0,
                first_offset_per_partition: BTreeMap::new(),
                last_offset_per_partition: BTreeMap::new(),
            },
        });

        let batch = &mut entry.batch;
        batch
            .first_offset_per_partition
            .entry(row.source_ref.partition)
            .or_insert(row.source_ref.offset);
        batch.last_offset_per_partition.insert(row.source_ref.partition, row.source_ref.offset);
        batch.last_arrival = now;
        batch.byte_size += size;
        batch.rows.push(row);

        let over_rows = batch.rows.len() >= self.config.batch_max_rows;
        let over_bytes = batch.byte_size >= self.config.batch_max_bytes;

        if over_rows || over_bytes {
            let OpenBatch { batch } = self.open.remove(&partition_tuple).expect("just inserted");
            let trigger = if over_rows { FlushTrigger::RowCount } else { FlushTrigger::MemoryBudget };
            return Some((batch, trigger));
        }
        None
    }

    /// Batches whose age exceeds `flushInterval`, removed from the open set.
    /// Called on a periodic tick by the owning scheduler task.
    pub fn due_by_age(&mut self, now: DateTime<Utc>) -> Vec<Batch> {
        let due_keys: Vec<PartitionTuple> = self
            .open
            .iter()
            .filter(|(_, b)| now - b.batch.first_arrival >= self.config.flush_interval)
            .map(|(k, _)| k.clone())
            .collect();
        due_keys
            .into_iter()
            .filter_map(|k| self.open.remove(&k).map(|b| b.batch))
            .collect()
    }

    /// Flush every open batch whose partition tuple's cobDate column equals
    /// one of the revoked partitions' keys is out of scope here — revocation
    /// is keyed by source Kafka partition, not by table partition column, so
    /// the caller (consumer) flushes *all* open batches on revocation of any
    /// partition it owns, since a single source partition's records can be
    /// spread across many table partition tuples.
    pub fn drain_all(&mut self) -> Vec<Batch> {
        std::mem::take(&mut self.open).into_values().map(|b| b.batch).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }

    /// Lowest first-offset still held open for `partition`, across every
    /// open partition-tuple key. `None` means no open batch holds any
    /// records from this source partition — an offset commit for it only
    /// needs to wait on batches that have already been handed to the writer,
    /// not on anything still accumulating — the offset for a buffered record
    /// must never advance past it before it's durable.
    pub fn min_open_offset(&self, partition: i32) -> Option<i64> {
        self.open
            .values()
            .filter_map(|b| b.batch.first_offset_per_partition.get(&partition).copied())
            .min()
    }
}

fn row_arrival(row: &ParsedRecord) -> DateTime<Utc> {
    match row.enrichment.get("arrivalTimestamp") {
        Some(ingest_core::FieldValue::TimestampMillis(ms)) => {
            DateTime::from_timestamp_millis(*ms).unwrap_or_else(Utc::now)
        }
        _ => Utc::now(),
    }
}

/// Derives the `PartitionTuple` a `ParsedRecord` belongs to, in declared
/// partition-column order. `cobDate` (or whatever the topic's COB field is
/// named) is always available via `ParsedRecord::cob_date` even when it
/// isn't duplicated into `fields`; every other declared column is read out
/// of `fields` (a missing non-COB partition column renders as an empty
/// string, which the writer's partition-path builder treats as `__HIVE_DEFAULT_PARTITION__`-style bucket).
fn partition_tuple_of(row: &ParsedRecord, partition_columns: &[String], cob_field: &str) -> PartitionTuple {
    partition_columns
        .iter()
        .map(|col| {
            let value = if col == cob_field {
                row.cob_date.to_string()
            } else {
                row.fields
                    .get(col)
                    .map(|v| v.to_json())
                    .map(|j| match j {
                        serde_json::Value::String(s) => s,
                        other => other.to_string(),
                    })
                    .unwrap_or_default()
            };
            (col.clone(), value)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingest_core::{DetectedFormat, SourceRef};
    use std::collections::BTreeMap as Map;

    fn row(offset: i64, cob: &str) -> ParsedRecord {
        ParsedRecord {
            fields: Map::new(),
            detected_format: DetectedFormat::Json,
            cob_date: chrono::NaiveDate::parse_from_str(cob, "%Y-%m-%d").unwrap(),
            business_timestamp: None,
            enrichment: Map::new(),
            source_ref: SourceRef { topic: "t".into(), partition: 0, offset },
            correlation_id: "c".into(),
            arrival_timestamp: Utc::now(),
        }
    }

    fn config() -> AccumulatorConfig {
        AccumulatorConfig {
            batch_max_rows: 2,
            batch_max_bytes: 1_000_000,
            flush_interval: chrono::Duration::seconds(60),
            partition_columns: vec!["cobDate".to_string()],
            cob_field: "cobDate".to_string(),
        }
    }

    #[test]
    fn flushes_on_row_count() {
        let mut acc = BatchAccumulator::new("t".into(), config());
        assert!(acc.push(row(0, "2024-01-15")).is_none());
        let (batch, trigger) = acc.push(row(1, "2024-01-15")).unwrap();
        assert_eq!(trigger, FlushTrigger::RowCount);
        assert_eq!(batch.rows.len(), 2);
        assert!(acc.is_empty());
    }

    #[test]
    fn separate_partition_tuples_never_merge() {
        let mut acc = BatchAccumulator::new("t".into(), config());
        acc.push(row(0, "2024-01-15"));
        acc.push(row(1, "2024-01-16"));
        assert_eq!(acc.open_key_count(), 2);
    }

    #[test]
    fn successor_batch_starts_fresh_after_flush() {
        let mut acc = BatchAccumulator::new("t".into(), config());
        acc.push(row(0, "2024-01-15"));
        let (_, _) = acc.push(row(1, "2024-01-15")).unwrap();
        acc.push(row(2, "2024-01-15"));
        assert_eq!(acc.open_key_count(), 1);
    }

    #[test]
    fn drain_all_empties_the_table() {
        let mut acc = BatchAccumulator::new("t".into(), config());
        acc.push(row(0, "2024-01-15"));
        let drained = acc.drain_all();
        assert_eq!(drained.len(), 1);
        assert!(acc.is_empty());
    }
}
