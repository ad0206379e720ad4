//! Per-topic pipeline driver.
//!
//! One `TopicPipeline` owns exactly one `TopicConsumer` and one
//! `BatchAccumulator`, driven from a single tokio task — the "single
//! scheduler per topic" discipline `ingest_tx::BatchAccumulator` documents.
//! Nothing here is shared across topics; everything shared (the table
//! writer, the schema manager client, the dead-letter router, the health
//! registry) is handed in as an `Arc`. The circuit breaker is the one
//! exception that is per-topic by construction: each `TopicPipeline` gets
//! its own `CircuitStatus` built in `main`, matching `CircuitState:
//! map from topicLogicalName → state machine`.
//!
//! Flow per iteration: drain any batch that couldn't be written last time
//! (the breaker was open, or the store was still failing), report this
//! topic's accumulator size to the shared `GlobalMemoryTracker` and shed its
//! oldest batch if the process-wide total is over budget and this topic owns
//! the oldest one, then service whichever of {shutdown, rebalance, age tick,
//! new records} is ready first. A batch is only handed to the table writer
//! once; if the write fails for a retriable reason it is held in `pending`
//! and retried on the next loop turn rather than re-accumulated, so a slow
//! store never duplicates rows.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use ingest_core::{
    Batch, BrokerConfig, CanonicalSchema, CircuitStatus, FailureKind, GlobalConfig, GlobalMemoryTracker, TopicSpec,
};
use ingest_io::health::record;
use ingest_io::{DeadLetterRouter, HealthRegistry, RebalanceEvent, SchemaRegistryClient, TableWriter, TopicHealth};
use ingest_tx::{AccumulatorConfig, BatchAccumulator, Enricher, FlushTrigger};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// A flushed batch still waiting on a durable commit, plus the bookkeeping
/// needed to bound how many times it gets retried before the whole batch is
/// promoted to NonRetriable and dead-lettered row by row once its retry
/// budget is exhausted.
struct PendingBatch {
    batch: Batch,
    attempts: u32,
    next_attempt_at: DateTime<Utc>,
}

pub struct TopicPipeline {
    logical_name: String,
    spec: TopicSpec,
    broker: BrokerConfig,
    global: GlobalConfig,
    table_writer: Arc<TableWriter>,
    schema_registry: Arc<SchemaRegistryClient>,
    dlr: Arc<DeadLetterRouter>,
    circuit: Arc<CircuitStatus>,
    health: Arc<HealthRegistry>,
    memory: Arc<GlobalMemoryTracker>,
    shutdown: CancellationToken,
}

impl TopicPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        logical_name: String,
        spec: TopicSpec,
        broker: BrokerConfig,
        global: GlobalConfig,
        table_writer: Arc<TableWriter>,
        schema_registry: Arc<SchemaRegistryClient>,
        dlr: Arc<DeadLetterRouter>,
        circuit: Arc<CircuitStatus>,
        health: Arc<HealthRegistry>,
        memory: Arc<GlobalMemoryTracker>,
        shutdown: CancellationToken,
    ) -> Self {
        TopicPipeline {
            logical_name,
            spec,
            broker,
            global,
            table_writer,
            schema_registry,
            dlr,
            circuit,
            health,
            memory,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        if let Err(e) = self.run_inner().await {
            error!(topic = %self.logical_name, error = %e, "pipeline exited");
            self.health.set(&self.logical_name, TopicHealth::Stopped).await;
            record::pipeline_stopped(&self.logical_name, true);
        }
    }

    async fn run_inner(&mut self) -> anyhow::Result<()> {
        let (consumer, mut rebalance_rx) = ingest_io::TopicConsumer::subscribe(&self.broker, &self.spec.source_topic)?;
        let schema = self.fetch_schema_with_retry().await?;
        let enricher = Enricher::new(std::collections::BTreeMap::new(), self.global.processing_version.clone());
        let mut accumulator = BatchAccumulator::new(
            self.logical_name.clone(),
            AccumulatorConfig {
                batch_max_rows: self.spec.processing.batch_max_rows,
                batch_max_bytes: self.spec.processing.batch_max_bytes,
                flush_interval: chrono::Duration::milliseconds(self.spec.processing.flush_interval_ms as i64),
                partition_columns: self.spec.destination.partition_columns.clone(),
                cob_field: self.spec.destination.cob_field.clone(),
            },
        );

        let dlr_topic = self.spec.dlr_topic_name();
        let mut pending: VecDeque<PendingBatch> = VecDeque::new();
        let mut pending_commits: HashMap<i32, i64> = HashMap::new();

        self.health.set(&self.logical_name, TopicHealth::Ready).await;

        let tick_ms = self.spec.processing.flush_interval_ms.clamp(250, 30_000);
        let mut ticker = tokio::time::interval(Duration::from_millis(tick_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            self.drain_pending(&mut pending, &schema, &consumer, &accumulator, &mut pending_commits, &dlr_topic).await;
            self.shed_over_budget(&mut accumulator, &mut pending).await;

            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    info!(topic = %self.logical_name, "shutdown: draining open batches");
                    for batch in accumulator.drain_all() {
                        pending.push_back(PendingBatch { batch, attempts: 0, next_attempt_at: Utc::now() });
                    }
                    self.drain_pending(&mut pending, &schema, &consumer, &accumulator, &mut pending_commits, &dlr_topic).await;
                    return Ok(());
                }

                event = rebalance_rx.recv() => {
                    if matches!(event, Some(RebalanceEvent::Revoked(_)) | Some(RebalanceEvent::Lost(_))) {
                        info!(topic = %self.logical_name, "rebalance: flushing all open batches");
                        for batch in accumulator.drain_all() {
                            pending.push_back(PendingBatch { batch, attempts: 0, next_attempt_at: Utc::now() });
                        }
                    }
                }

                _ = ticker.tick() => {
                    for batch in accumulator.due_by_age(chrono::Utc::now()) {
                        pending.push_back(PendingBatch { batch, attempts: 0, next_attempt_at: Utc::now() });
                    }
                }

                records = consumer.poll_batch(Duration::from_millis(500)) => {
                    for record in records {
                        self.ingest_one(&record, &schema, &enricher, &mut accumulator, &mut pending, &consumer, &dlr_topic).await;
                    }
                }
            }
        }
    }

    /// Publishes this topic's current accumulator usage to the process-wide
    /// `GlobalMemoryTracker` and, while the process total exceeds
    /// `global.memoryBudgetBytes` and this topic holds the globally-oldest
    /// open batch, flushes its oldest batch and re-checks ("total
    /// batched bytes across all keys ≥ globalMemoryBudget → the oldest-first
    /// batches are flushed until under budget").
    async fn shed_over_budget(&self, accumulator: &mut BatchAccumulator, pending: &mut VecDeque<PendingBatch>) {
        loop {
            self.report_memory_usage(accumulator).await;
            if !self.memory.should_shed(&self.logical_name, self.global.memory_budget_bytes).await {
                return;
            }
            let Some(batch) = accumulator.pop_oldest() else { return };
            warn!(
                topic = %self.logical_name,
                rows = batch.rows.len(),
                "global memory budget exceeded; shedding oldest open batch"
            );
            pending.push_back(PendingBatch { batch, attempts: 0, next_attempt_at: Utc::now() });
        }
    }

    /// Converts this topic's oldest open batch's `firstArrival` (a wall-clock
    /// `DateTime<Utc>`) into the monotonic `Instant` the tracker compares
    /// across topics, and publishes both to the `GlobalMemoryTracker`.
    async fn report_memory_usage(&self, accumulator: &BatchAccumulator) {
        let oldest = accumulator.oldest_arrival().map(|dt| {
            let age = (Utc::now() - dt).to_std().unwrap_or(Duration::ZERO);
            std::time::Instant::now() - age
        });
        self.memory.report(&self.logical_name, accumulator.byte_size(), oldest).await;
    }

    async fn ingest_one(
        &self,
        record: &ingest_core::Record,
        schema: &CanonicalSchema,
        enricher: &Enricher,
        accumulator: &mut BatchAccumulator,
        pending: &mut VecDeque<PendingBatch>,
        consumer: &ingest_io::TopicConsumer,
        dlr_topic: &str,
    ) {
        // While the breaker is open, every incoming record goes straight to
        // the DLR without attempting to parse or accumulate it, and the
        // offset still advances.
        if !self.circuit.allow_call().await {
            self.health.set(&self.logical_name, TopicHealth::CircuitOpen).await;
            record::circuit_state(&self.logical_name, "open");
            self.route_to_dlr(record, dlr_topic, FailureKind::CircuitOpen, "circuit open".to_string(), consumer).await;
            return;
        }

        match ingest_tx::parse_record(
            record,
            schema,
            &self.spec.destination.cob_field,
            self.global.cob_lookback_days,
            self.spec.processing.allow_multi_row_csv,
            &self.spec.processing.formats,
        ) {
            Ok(rows) => {
                self.circuit.record_success().await;
                for mut row in rows {
                    enricher.enrich(&mut row);
                    if let Some((batch, trigger)) = accumulator.push(row) {
                        info!(topic = %self.logical_name, rows = batch.rows.len(), ?trigger, "batch ready to flush");
                        pending.push_back(PendingBatch { batch, attempts: 0, next_attempt_at: Utc::now() });
                    }
                }
            }
            Err(e) if e.kind().is_retriable() => {
                warn!(
                    topic = %self.logical_name,
                    partition = record.partition,
                    offset = record.offset,
                    error = %e,
                    "retriable parse failure; leaving offset uncommitted for redelivery"
                );
            }
            Err(e) => {
                if e.kind().trips_circuit() {
                    self.circuit.record_failure().await;
                }
                self.route_to_dlr(record, dlr_topic, e.kind(), e.to_string(), consumer).await;
            }
        }
    }

    async fn route_to_dlr(
        &self,
        record: &ingest_core::Record,
        dlr_topic: &str,
        kind: FailureKind,
        message: String,
        consumer: &ingest_io::TopicConsumer,
    ) {
        match self.dlr.route(record, dlr_topic, kind, message).await {
            Ok(()) => {
                record::dlq_count(&self.logical_name, kind.as_str());
                if let Err(e) = consumer.commit_offset(record.partition, record.offset) {
                    warn!(topic = %self.logical_name, error = %e, "failed to commit offset after dead-lettering");
                }
            }
            Err(e) => {
                warn!(
                    topic = %self.logical_name,
                    error = %e,
                    "dead-letter send failed to confirm; offset not advanced, will redeliver"
                );
            }
        }
    }

    /// Dead-letters every row of a batch whose flush has exhausted its retry
    /// budget, then reports whether every row was durably routed. A row that
    /// fails to dead-letter keeps the whole batch pending — we'd rather retry
    /// the promotion again next turn than silently drop a row.
    async fn dead_letter_batch(&self, batch: &Batch, dlr_topic: &str, kind: FailureKind, message: &str) -> bool {
        let mut all_routed = true;
        for row in &batch.rows {
            let synthetic = ingest_core::Record {
                topic: row.source_ref.topic.clone(),
                partition: row.source_ref.partition,
                offset: row.source_ref.offset,
                key: None,
                raw_payload: serde_json::to_vec(
                    &row.fields.iter().map(|(k, v)| (k.clone(), v.to_json())).collect::<serde_json::Map<_, _>>(),
                )
                .unwrap_or_default(),
                arrival_timestamp: row.arrival_timestamp,
                correlation_id: row.correlation_id.clone(),
            };
            if self.dlr.route(&synthetic, dlr_topic, kind, message.to_string()).await.is_ok() {
                record::dlq_count(&self.logical_name, kind.as_str());
            } else {
                all_routed = false;
            }
        }
        all_routed
    }

    /// Attempts every queued batch against the table writer, in order. A
    /// batch that fails for a retriable reason stays at the front of the
    /// queue (so ordering within one source partition is preserved) and the
    /// loop stops there — a later batch committing out of order would let
    /// the consumer race ahead of data that never became durable.
    async fn drain_pending(
        &self,
        pending: &mut VecDeque<PendingBatch>,
        schema: &CanonicalSchema,
        consumer: &ingest_io::TopicConsumer,
        accumulator: &BatchAccumulator,
        pending_commits: &mut HashMap<i32, i64>,
        dlr_topic: &str,
    ) {
        loop {
            let Some(front) = pending.front() else { return };
            let now = Utc::now();
            if now < front.next_attempt_at {
                return;
            }
            if !self.circuit.allow_call().await {
                self.health.set(&self.logical_name, TopicHealth::CircuitOpen).await;
                record::circuit_state(&self.logical_name, "open");
                return;
            }

            let batch = &front.batch;
            let correlation_id = batch.rows.first().map(|r| r.correlation_id.clone()).unwrap_or_default();
            let result = self
                .table_writer
                .write_batch(
                    &self.spec.destination.table_root,
                    &self.logical_name,
                    batch,
                    schema,
                    &self.spec.table,
                    &self.spec.destination.partition_columns,
                    &correlation_id,
                )
                .await;

            match result {
                Ok(write_result) => {
                    self.circuit.record_success().await;
                    self.health.set(&self.logical_name, TopicHealth::Ready).await;
                    if let Some(write_result) = &write_result {
                        record::commit_count(&self.logical_name);
                        record::commit_rows(&self.logical_name, write_result.rows_added as u64);
                    }
                    let flushed = pending.pop_front().expect("front() just matched Some");
                    for (&partition, &offset) in &flushed.batch.last_offset_per_partition {
                        pending_commits
                            .entry(partition)
                            .and_modify(|o| *o = (*o).max(offset))
                            .or_insert(offset);
                    }
                    self.advance_offsets(pending_commits, accumulator, pending, consumer).await;
                }
                Err(e) if e.kind().is_retriable() => {
                    let attempts = front.attempts + 1;
                    warn!(topic = %self.logical_name, attempts, error = %e, "batch flush failed");

                    if !ingest_core::retry::within_budget(attempts, self.spec.processing.max_retries) {
                        // maxAttempts exceeded: a retriable failure that never
                        // clears is promoted to NonRetriable — a
                        // persistently failing store is also a
                        // circuit-triggering condition ("persistent
                        // TRANSIENT_STORE").
                        if e.kind() == FailureKind::TransientStore {
                            self.circuit.record_failure().await;
                        }
                        let front = pending.front().expect("front() just matched Some");
                        let message = format!("{e} (exceeded {} retry attempts)", self.spec.processing.max_retries);
                        if self.dead_letter_batch(&front.batch, dlr_topic, e.kind(), &message).await {
                            let promoted = pending.pop_front().expect("front() just matched Some");
                            for (&partition, &offset) in &promoted.batch.last_offset_per_partition {
                                pending_commits
                                    .entry(partition)
                                    .and_modify(|o| *o = (*o).max(offset))
                                    .or_insert(offset);
                            }
                            self.advance_offsets(pending_commits, accumulator, pending, consumer).await;
                            continue;
                        } else {
                            warn!(topic = %self.logical_name, "dead-letter of exhausted batch did not fully confirm; will retry promotion");
                            return;
                        }
                    }

                    let backoff = ingest_core::retry::backoff(
                        self.spec.processing.base_backoff_ms,
                        self.spec.processing.max_backoff_ms,
                        attempts,
                    );
                    let front = pending.front_mut().expect("front() just matched Some");
                    front.attempts = attempts;
                    front.next_attempt_at = Utc::now() + chrono::Duration::from_std(backoff).unwrap_or(chrono::Duration::seconds(30));
                    return;
                }
                Err(e) => {
                    warn!(topic = %self.logical_name, error = %e, "batch flush failed with a non-retriable error");
                    if e.kind().trips_circuit() {
                        self.circuit.record_failure().await;
                    }
                    // A non-retriable failure here means the batch itself is
                    // unwritable (e.g. a forbidden schema change); there is no
                    // per-row dead-letter target for an already-merged batch,
                    // so the pipeline stops rather than silently drop rows.
                    self.health.set(&self.logical_name, TopicHealth::Stopped).await;
                    record::pipeline_stopped(&self.logical_name, true);
                    return;
                }
            }
        }
    }

    /// Commits the highest offset per partition that no still-open or
    /// still-pending batch could undercut, per `BatchAccumulator::min_open_offset`.
    async fn advance_offsets(
        &self,
        pending_commits: &mut HashMap<i32, i64>,
        accumulator: &BatchAccumulator,
        pending: &VecDeque<PendingBatch>,
        consumer: &ingest_io::TopicConsumer,
    ) {
        let partitions: Vec<i32> = pending_commits.keys().copied().collect();
        for partition in partitions {
            let floor_open = accumulator.min_open_offset(partition);
            let floor_pending = pending
                .iter()
                .filter_map(|b| b.batch.first_offset_per_partition.get(&partition).copied())
                .min();
            let floor = match (floor_open, floor_pending) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (Some(a), None) => Some(a),
                (None, Some(b)) => Some(b),
                (None, None) => None,
            };
            let candidate = pending_commits[&partition];
            let safe = floor.map(|f| candidate < f).unwrap_or(true);
            if safe {
                if let Err(e) = consumer.commit_offset(partition, candidate) {
                    warn!(topic = %self.logical_name, partition, error = %e, "failed to commit offset");
                } else {
                    pending_commits.remove(&partition);
                }
            }
        }
    }

    async fn fetch_schema_with_retry(&self) -> anyhow::Result<CanonicalSchema> {
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let fetched = match self.spec.schema_version {
                Some(version) => self.schema_registry.get_by_version(&self.spec.schema_name, version).await,
                None => self.schema_registry.get_latest(&self.spec.schema_name).await,
            };
            match fetched {
                Ok(schema) => return Ok(schema),
                Err(e) if e.kind().is_retriable() && ingest_core::retry::within_budget(attempt, self.spec.processing.max_retries) => {
                    let backoff = ingest_core::retry::backoff(
                        self.spec.processing.base_backoff_ms,
                        self.spec.processing.max_backoff_ms,
                        attempt,
                    );
                    warn!(topic = %self.logical_name, attempt, error = %e, "schema fetch failed; retrying");
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(anyhow::anyhow!(e)),
            }
        }
    }
}

