//! # ingest-io
//!
//! Everything in the ingest pipeline that talks to the outside world: the
//! Kafka consumer and acknowledgement loop, the schema manager HTTP client,
//! the object-store client, the transactional table writer and its
//! compaction/vacuum optimizer, the dead-letter router, and the health/
//! metrics server.
//!
//! `ingest-core` supplies the shared vocabulary (`Record`, `CanonicalSchema`,
//! `FailureKind`, ...); this crate supplies the I/O that produces and
//! consumes it. Nothing here parses or batches records — that's `ingest-tx`.

pub mod consumer;
pub mod dlr;
pub mod health;
pub mod object_store_client;
pub mod optimizer;
pub mod schema_registry;
pub mod table_writer;

pub use consumer::{RebalanceEvent, SharedConsumer, TopicConsumer};
pub use dlr::{DeadLetterRouter, DlrEnvelope};
pub use health::{HealthRegistry, TopicHealth};
pub use object_store_client::build_object_store;
pub use optimizer::{OptimizeReport, Optimizer, VacuumReport};
pub use schema_registry::SchemaRegistryClient;
pub use table_writer::{CommitResult, TableWriter};
