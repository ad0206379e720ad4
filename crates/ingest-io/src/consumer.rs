//! Consumer & acknowledgement loop.
//!
//! Wraps an `rdkafka::StreamConsumer` with manual, per-offset commit and a
//! rebalance listener that surfaces assign/revoke/lost events on a channel —
//! the rebalance callback itself is synchronous (rdkafka invokes it from the
//! poll thread), so it bridges into async code with `futures::executor::block_on`
//! the same way `quickwit`'s Kafka source does it.

use std::sync::Arc;
use std::time::Duration;

use futures::executor::block_on;
use ingest_core::{BrokerConfig, Record};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::message::Message as _;
use rdkafka::{ClientContext, Offset, TopicPartitionList};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

/// Partition lifecycle events the pipeline driver reacts to on assignment
/// and revocation.
#[derive(Debug, Clone)]
pub enum RebalanceEvent {
    Assigned(Vec<i32>),
    Revoked(Vec<i32>),
    Lost(Vec<i32>),
}

struct RebalanceListener {
    topic: String,
    events: mpsc::UnboundedSender<RebalanceEvent>,
}

impl ClientContext for RebalanceListener {}

impl ConsumerContext for RebalanceListener {
    fn pre_rebalance(&self, rebalance: &Rebalance) {
        if let Rebalance::Revoke(tpl) = rebalance {
            let partitions = partitions_for_topic(tpl, &self.topic);
            info!(topic = %self.topic, ?partitions, "partitions revoked");
            block_on(async { let _ = self.events.send(RebalanceEvent::Revoked(partitions)); });
        }
    }

    fn post_rebalance(&self, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Assign(tpl) => {
                let partitions = partitions_for_topic(tpl, &self.topic);
                info!(topic = %self.topic, ?partitions, "partitions assigned");
                block_on(async { let _ = self.events.send(RebalanceEvent::Assigned(partitions)); });
            }
            Rebalance::Error(e) => {
                warn!(topic = %self.topic, error = %e, "rebalance error; treating assignment as lost");
                block_on(async { let _ = self.events.send(RebalanceEvent::Lost(vec![])); });
            }
            Rebalance::Revoke(_) => {}
        }
    }
}

fn partitions_for_topic(tpl: &TopicPartitionList, topic: &str) -> Vec<i32> {
    tpl.elements()
        .iter()
        .filter(|e| e.topic() == topic)
        .map(|e| e.partition())
        .collect()
}

/// A single-topic consumer, manually acknowledged per offset.
pub struct TopicConsumer {
    consumer: StreamConsumer<RebalanceListener>,
    source_topic: String,
    poll_records: usize,
}

impl TopicConsumer {
    pub fn subscribe(
        broker: &BrokerConfig,
        source_topic: &str,
    ) -> anyhow::Result<(Self, mpsc::UnboundedReceiver<RebalanceEvent>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let context = RebalanceListener { topic: source_topic.to_string(), events: tx };
        let consumer: StreamConsumer<RebalanceListener> = ClientConfig::new()
            .set("bootstrap.servers", &broker.endpoints)
            .set("group.id", &broker.group_id)
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", broker.session_timeout_ms.to_string())
            .set("max.poll.interval.ms", broker.max_poll_interval_ms.to_string())
            .create_with_context(context)?;
        consumer.subscribe(&[source_topic])?;
        Ok((
            TopicConsumer {
                consumer,
                source_topic: source_topic.to_string(),
                poll_records: broker.poll_records,
            },
            rx,
        ))
    }

    /// One cooperative poll: waits for at least one record (or `timeout`
    /// elapsing) then drains up to `poll_records` more without blocking, so
    /// each poll returns a bounded batch.
    pub async fn poll_batch(&self, timeout: Duration) -> Vec<Record> {
        let mut out = Vec::new();
        match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Ok(Ok(msg)) => out.push(self.to_record(&msg)),
            Ok(Err(e)) => {
                warn!(topic = %self.source_topic, error = %e, "kafka poll error");
                return out;
            }
            Err(_) => return out,
        }
        while out.len() < self.poll_records {
            match tokio::time::timeout(Duration::from_millis(1), self.consumer.recv()).await {
                Ok(Ok(msg)) => out.push(self.to_record(&msg)),
                _ => break,
            }
        }
        out
    }

    fn to_record(&self, msg: &rdkafka::message::BorrowedMessage<'_>) -> Record {
        Record {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key: msg.key().map(|k| k.to_vec()),
            raw_payload: msg.payload().map(|p| p.to_vec()).unwrap_or_default(),
            arrival_timestamp: chrono::Utc::now(),
            correlation_id: Uuid::new_v4().to_string(),
        }
    }

    /// Commits `offset + 1` (the next offset to read) for `partition` —
    /// called only once the record at `offset` is durable in its destination
    /// table or in the DLR.
    pub fn commit_offset(&self, partition: i32, offset: i64) -> anyhow::Result<()> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&self.source_topic, partition, Offset::Offset(offset + 1))?;
        self.consumer.commit(&tpl, rdkafka::consumer::CommitMode::Async)?;
        Ok(())
    }

    pub fn source_topic(&self) -> &str {
        &self.source_topic
    }
}

pub type SharedConsumer = Arc<TopicConsumer>;
