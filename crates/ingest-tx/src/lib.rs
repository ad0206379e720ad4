//! # ingest-tx
//!
//! The CPU-bound middle of the pipeline: multi-format parsing against a
//! canonical schema, pure enrichment, and the batch accumulator / flush
//! scheduler. Nothing here touches the network —
//! a parser takes bytes and a schema and returns a `ParsedRecord` or a
//! classified failure; an accumulator takes `ParsedRecord`s and returns
//! `Batch`es on size, byte, or time triggers.

pub mod accumulator;
pub mod enrich;
pub mod parser;

pub use accumulator::{AccumulatorConfig, BatchAccumulator, FlushTrigger};
pub use enrich::Enricher;
pub use parser::{parse_record, ParseOutcome};
