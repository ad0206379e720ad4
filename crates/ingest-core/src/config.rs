//! Configuration surface ("Configuration").
//!
//! Loaded as YAML, layered with `INGEST__`-prefixed environment overrides by
//! the engine binary (see `ingest-engine`), then validated with `validator`
//! before any topic pipeline is constructed.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::model::DetectedFormat;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BrokerConfig {
    /// Comma-separated `host:port` list, passed through to `bootstrap.servers`.
    #[validate(length(min = 1))]
    pub endpoints: String,
    #[validate(length(min = 1))]
    pub group_id: String,
    #[serde(default = "default_poll_records")]
    pub poll_records: usize,
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u32,
    #[serde(default = "default_max_poll_interval_ms")]
    pub max_poll_interval_ms: u32,
}

fn default_poll_records() -> usize {
    500
}
fn default_session_timeout_ms() -> u32 {
    10_000
}
fn default_max_poll_interval_ms() -> u32 {
    300_000
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct StoreConfig {
    #[validate(length(min = 1))]
    pub endpoint: String,
    #[validate(length(min = 1))]
    pub region: String,
    pub bucket: String,
    #[serde(default)]
    pub path_style: bool,
    pub access_key: String,
    pub secret_key: String,
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: usize,
}

fn default_multipart_threshold() -> usize {
    8 * 1024 * 1024
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SchemaRegistryConfig {
    #[validate(length(min = 1))]
    pub endpoint: String,
    #[serde(default = "default_schema_cache_ttl")]
    pub cache_ttl_seconds: u64,
}

fn default_schema_cache_ttl() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CircuitConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    #[serde(default = "default_open_timeout_seconds")]
    pub open_timeout_seconds: u64,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        CircuitConfig {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            open_timeout_seconds: default_open_timeout_seconds(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_success_threshold() -> u32 {
    3
}
fn default_open_timeout_seconds() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct GlobalConfig {
    #[serde(default = "default_memory_budget_bytes")]
    pub memory_budget_bytes: usize,
    #[serde(default = "default_writer_pool_size")]
    pub writer_pool_size: usize,
    #[serde(default = "default_graceful_stop_seconds")]
    pub graceful_stop_seconds: u64,
    /// Records whose COB date is more than this many days in the past (or
    /// future) are classified `Cob` rather than accepted.
    #[serde(default = "default_cob_lookback_days")]
    pub cob_lookback_days: i64,
    #[serde(default = "default_health_bind_addr")]
    pub health_bind_addr: String,
    /// Opaque version string stamped onto every enriched record's
    /// `processingVersion` field. Bump this when the
    /// enrichment/coercion rules change in a way consumers of the table
    /// should be able to tell apart by row.
    #[serde(default = "default_processing_version")]
    pub processing_version: String,
    /// Longest a reader is allowed to assume data is available relative to
    /// now. Vacuum refuses to run if a table's retention is shorter than
    /// this.
    #[serde(default = "default_reader_max_lookback_hours")]
    pub reader_max_lookback_hours: u64,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        GlobalConfig {
            memory_budget_bytes: default_memory_budget_bytes(),
            writer_pool_size: default_writer_pool_size(),
            graceful_stop_seconds: default_graceful_stop_seconds(),
            cob_lookback_days: default_cob_lookback_days(),
            health_bind_addr: default_health_bind_addr(),
            processing_version: default_processing_version(),
            reader_max_lookback_hours: default_reader_max_lookback_hours(),
        }
    }
}

fn default_memory_budget_bytes() -> usize {
    512 * 1024 * 1024
}
fn default_writer_pool_size() -> usize {
    4
}
fn default_graceful_stop_seconds() -> u64 {
    30
}
fn default_cob_lookback_days() -> i64 {
    7
}
fn default_health_bind_addr() -> String {
    "0.0.0.0:9100".to_string()
}
fn default_processing_version() -> String {
    "1".to_string()
}
fn default_reader_max_lookback_hours() -> u64 {
    24
}

/// Where and how a topic's batches land as table data.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct DestinationSpec {
    /// Object-store key prefix the table lives under, e.g. `warehouse/trades`.
    #[validate(length(min = 1))]
    pub table_root: String,
    #[validate(length(min = 1))]
    pub partition_columns: Vec<String>,
    #[serde(default = "default_cob_field")]
    pub cob_field: String,
}

fn default_cob_field() -> String {
    "cobDate".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct TableOptions {
    #[serde(default)]
    pub enable_optimize: bool,
    #[serde(default = "default_optimize_interval_seconds")]
    pub optimize_interval_seconds: u64,
    #[serde(default = "default_min_compact_bytes")]
    pub min_compact_file_bytes: usize,
    #[serde(default = "default_target_file_bytes")]
    pub target_file_bytes: usize,
    #[serde(default)]
    pub enable_vacuum: bool,
    #[serde(default = "default_vacuum_retention_hours")]
    pub vacuum_retention_hours: u64,
    #[serde(default = "default_schema_evolution")]
    pub enable_schema_evolution: bool,
    #[serde(default)]
    pub allow_int_float_widen: bool,
}

impl Default for TableOptions {
    fn default() -> Self {
        TableOptions {
            enable_optimize: false,
            optimize_interval_seconds: default_optimize_interval_seconds(),
            min_compact_file_bytes: default_min_compact_bytes(),
            target_file_bytes: default_target_file_bytes(),
            enable_vacuum: false,
            vacuum_retention_hours: default_vacuum_retention_hours(),
            enable_schema_evolution: default_schema_evolution(),
            allow_int_float_widen: false,
        }
    }
}

fn default_optimize_interval_seconds() -> u64 {
    600
}
fn default_min_compact_bytes() -> usize {
    16 * 1024 * 1024
}
fn default_target_file_bytes() -> usize {
    256 * 1024 * 1024
}
fn default_vacuum_retention_hours() -> u64 {
    168
}
fn default_schema_evolution() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ProcessingOptions {
    #[serde(default = "default_batch_max_rows")]
    pub batch_max_rows: usize,
    #[serde(default = "default_batch_max_bytes")]
    pub batch_max_bytes: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// CSV payloads containing more than one data row are classified
    /// `Parse` (NonRetriable) unless this is explicitly enabled.
    #[serde(default)]
    pub allow_multi_row_csv: bool,
    /// Formats this topic accepts. A payload detected as any other format is
    /// classified `Parse` (NonRetriable) before coercion is even attempted
    /// (`topics.<logicalName>.formats`). Empty means "accept
    /// whatever the detector recognizes" — the historical, unrestricted
    /// behavior — rather than rejecting everything.
    #[serde(default)]
    pub formats: Vec<DetectedFormat>,
}

impl Default for ProcessingOptions {
    fn default() -> Self {
        ProcessingOptions {
            batch_max_rows: default_batch_max_rows(),
            batch_max_bytes: default_batch_max_bytes(),
            flush_interval_ms: default_flush_interval_ms(),
            max_retries: default_max_retries(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            allow_multi_row_csv: false,
            formats: Vec::new(),
        }
    }
}

fn default_batch_max_rows() -> usize {
    50_000
}
fn default_batch_max_bytes() -> usize {
    64 * 1024 * 1024
}
fn default_flush_interval_ms() -> u64 {
    5_000
}
fn default_max_retries() -> u32 {
    5
}
fn default_base_backoff_ms() -> u64 {
    200
}
fn default_max_backoff_ms() -> u64 {
    30_000
}

/// One entry in the topic registry: everything needed to run the
/// Consumer → Parser → Transform → Accumulator → Writer → Optimizer
/// pipeline for a single source topic ("TopicRegistry").
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct TopicSpec {
    #[validate(length(min = 1))]
    pub source_topic: String,
    #[validate(length(min = 1))]
    pub schema_name: String,
    #[validate]
    pub destination: DestinationSpec,
    #[serde(default)]
    #[validate]
    pub table: TableOptions,
    #[serde(default)]
    #[validate]
    pub processing: ProcessingOptions,
    /// Dead-letter topic name; defaults to `<source_topic>-dlq`.
    #[serde(default)]
    pub dlr_topic: Option<String>,
    /// Pin ingestion to a specific registry schema version instead of
    /// always tracking latest. Absent means "follow latest".
    #[serde(default)]
    pub schema_version: Option<u64>,
}

impl TopicSpec {
    pub fn dlr_topic_name(&self) -> String {
        self.dlr_topic.clone().unwrap_or_else(|| format!("{}-dlq", self.source_topic))
    }
}

/// Root configuration document ("Configuration surface").
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct EngineConfig {
    #[validate]
    pub broker: BrokerConfig,
    #[validate]
    pub store: StoreConfig,
    #[validate]
    pub schema_registry: SchemaRegistryConfig,
    #[serde(default)]
    #[validate]
    pub circuit: CircuitConfig,
    #[serde(default)]
    #[validate]
    pub global: GlobalConfig,
    #[validate(length(min = 1))]
    pub topics: HashMap<String, TopicSpec>,
}

impl EngineConfig {
    /// `validator`'s derive has no blanket `Validate` impl for `HashMap`, so
    /// each topic's nested rules (non-empty source topic, schema name,
    /// destination, …) are checked here rather than via `#[validate]`.
    pub fn validate_topics(&self) -> Result<(), validator::ValidationErrors> {
        for spec in self.topics.values() {
            spec.validate()?;
        }
        Ok(())
    }
}
