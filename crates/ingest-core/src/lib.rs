//! # ingest-core
//!
//! Foundational types shared by every other `streamlake` crate: the in-flight
//! data model (`Record`, `ParsedRecord`, `Batch`), the canonical schema
//! representation and widening rules, the configuration surface loaded from
//! YAML + environment, the error/failure-classification taxonomy, and the
//! in-memory topic/commit/circuit registries that the engine keeps alive for
//! the life of the process.
//!
//! Nothing in this crate talks to a broker, an object store, or the network —
//! that's `ingest-io`. Nothing in this crate parses or batches bytes — that's
//! `ingest-tx`. This crate is the vocabulary both of them share.

pub mod config;
pub mod error;
pub mod model;
pub mod registry;
pub mod retry;

pub use config::{
    BrokerConfig, CircuitConfig, DestinationSpec, EngineConfig, GlobalConfig, ProcessingOptions,
    SchemaRegistryConfig, StoreConfig, TableOptions, TopicSpec,
};
pub use error::{FailureKind, IngestError};
pub use model::{
    enrichment_columns, Batch, CanonicalSchema, DetectedFormat, FieldDef, FieldType, FieldValue,
    ParsedRecord, PartitionTuple, Record, SourceRef,
};
pub use registry::{CircuitState, CircuitStatus, CommitCache, GlobalMemoryTracker, TopicRegistry};
