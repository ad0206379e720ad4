//! Dead-letter router.
//!
//! Produces the structured envelope onto `<sourceTopic>-dlq`
//! using an idempotent `rdkafka::FutureProducer` and waits for the broker's
//! delivery acknowledgement before returning — an undurable DLR send is
//! itself a `RetriableFailure` so callers retry the whole
//! classify-and-route step rather than assuming "sent" means "durable".

use std::time::Duration;

use base64::Engine;
use chrono::Utc;
use ingest_core::{FailureKind, IngestError, Record};
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use serde::Serialize;

const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// The wire envelope written to `<sourceTopic>-dlq` ("DLR envelope").
#[derive(Debug, Serialize)]
pub struct DlrEnvelope {
    pub source_topic: String,
    pub source_partition: i32,
    pub source_offset: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub payload_base64: String,
    pub failure_kind: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    pub correlation_id: String,
    pub timestamp: chrono::DateTime<Utc>,
    pub engine_version: String,
}

pub struct DeadLetterRouter {
    producer: FutureProducer,
}

impl DeadLetterRouter {
    pub fn new(bootstrap_servers: &str) -> anyhow::Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", bootstrap_servers)
            .set("enable.idempotence", "true")
            .set("acks", "all")
            .set("message.timeout.ms", "30000")
            .create()?;
        Ok(DeadLetterRouter { producer })
    }

    /// Durably records `record` as refused with `kind`/`message`. Returns a
    /// `RetriableFailure` if the broker does not confirm delivery — the
    /// caller must not advance the source offset in that case.
    pub async fn route(
        &self,
        record: &Record,
        dlr_topic: &str,
        kind: FailureKind,
        message: String,
    ) -> Result<(), IngestError> {
        let envelope = DlrEnvelope {
            source_topic: record.topic.clone(),
            source_partition: record.partition,
            source_offset: record.offset,
            key: record.key.as_ref().map(|k| String::from_utf8_lossy(k).to_string()),
            payload_base64: base64::engine::general_purpose::STANDARD.encode(&record.raw_payload),
            failure_kind: kind.as_str(),
            message,
            stack_trace: None,
            correlation_id: record.correlation_id.clone(),
            timestamp: Utc::now(),
            engine_version: ENGINE_VERSION.to_string(),
        };
        let payload = serde_json::to_vec(&envelope)
            .map_err(|e| IngestError::wrap(FailureKind::Config, "failed to serialize DLR envelope", e))?;

        let kafka_record: FutureRecord<'_, str, [u8]> = FutureRecord::to(dlr_topic).payload(&payload);
        self.producer
            .send(kafka_record, Duration::from_secs(10))
            .await
            .map_err(|(e, _)| {
                IngestError::wrap(FailureKind::TransientBroker, "dead-letter send did not confirm delivery", e)
            })?;
        Ok(())
    }
}
