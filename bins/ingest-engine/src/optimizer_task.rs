//! Per-table optimizer worker: one per table, at most one compaction in
//! flight per table.
//!
//! Runs entirely off the ingest path: it only ever reads the commit log and
//! writes `OPTIMIZE`/vacuum commits, so a stalled optimizer can never block a
//! `TopicPipeline` from flushing. Each tick does at most one compaction pass
//! and, if enabled, one vacuum pass, then sleeps until the next tick.

use std::sync::Arc;
use std::time::Duration;

use ingest_core::TopicSpec;
use ingest_io::{Optimizer, TableWriter};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub struct OptimizerTask {
    logical_name: String,
    spec: TopicSpec,
    table_writer: Arc<TableWriter>,
    optimizer: Arc<Optimizer>,
    reader_max_lookback_hours: u64,
    shutdown: CancellationToken,
}

impl OptimizerTask {
    pub fn new(
        logical_name: String,
        spec: TopicSpec,
        table_writer: Arc<TableWriter>,
        optimizer: Arc<Optimizer>,
        reader_max_lookback_hours: u64,
        shutdown: CancellationToken,
    ) -> Self {
        OptimizerTask { logical_name, spec, table_writer, optimizer, reader_max_lookback_hours, shutdown }
    }

    pub async fn run(self) {
        if !self.spec.table.enable_optimize {
            return;
        }

        let mut ticker = tokio::time::interval(Duration::from_secs(self.spec.table.optimize_interval_seconds.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return,
                _ = ticker.tick() => self.tick().await,
            }
        }
    }

    async fn tick(&self) {
        let correlation_id = uuid::Uuid::new_v4().to_string();
        match self
            .optimizer
            .optimize(&self.table_writer, &self.spec.destination.table_root, &self.spec.table, &correlation_id)
            .await
        {
            Ok(report) if report.bins_compacted > 0 => {
                info!(
                    topic = %self.logical_name,
                    bins = report.bins_compacted,
                    files_removed = report.files_removed,
                    files_added = report.files_added,
                    "compaction pass completed"
                );
            }
            Ok(_) => {}
            Err(e) => warn!(topic = %self.logical_name, error = %e, "compaction pass failed"),
        }

        if self.spec.table.enable_vacuum {
            match self
                .optimizer
                .vacuum(&self.table_writer, &self.spec.destination.table_root, &self.spec.table, self.reader_max_lookback_hours)
                .await
            {
                Ok(report) if report.files_deleted > 0 => {
                    info!(
                        topic = %self.logical_name,
                        files_deleted = report.files_deleted,
                        bytes_deleted = report.bytes_deleted,
                        "vacuum pass completed"
                    );
                }
                Ok(_) => {}
                Err(e) => warn!(topic = %self.logical_name, error = %e, "vacuum pass failed"),
            }
        }
    }
}
