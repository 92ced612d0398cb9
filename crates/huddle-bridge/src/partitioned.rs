//! Partitioned-log bridge over Kafka.
//!
//! One consumer reads a single partition of the topic, starting at the
//! newest offset, and fans records out in-process by their key, which is
//! the room id. Delivery is at-least-once and ordered within the partition
//! only; consumption positions are not committed.

use async_trait::async_trait;
use bytes::Bytes;
use huddle_core::{BridgeError, EventStream, IngressBridge, RoomFanout};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{Offset, TopicPartitionList};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Kafka bridge settings.
#[derive(Debug, Clone)]
pub struct LogBridgeConfig {
    /// Comma-separated bootstrap brokers.
    pub brokers: String,
    /// Topic carrying room events.
    pub topic: String,
    /// Partition to consume and produce to.
    pub partition: i32,
    /// Consumer group id. Offsets are never committed.
    pub group_id: String,
    /// Per-room in-process channel capacity.
    pub fanout_capacity: usize,
    /// Producer delivery timeout.
    pub send_timeout: Duration,
}

impl Default for LogBridgeConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            topic: "huddle-rooms".to_string(),
            partition: 0,
            group_id: "huddle".to_string(),
            fanout_capacity: 1024,
            send_timeout: Duration::from_secs(5),
        }
    }
}

/// Bridge over one partition of a Kafka topic.
pub struct LogBridge {
    producer: FutureProducer,
    fanout: RoomFanout,
    config: LogBridgeConfig,
    consumer_task: JoinHandle<()>,
}

impl LogBridge {
    /// Create the producer and the partition consumer, and start consuming.
    ///
    /// # Errors
    ///
    /// Returns an error if the clients cannot be created or the brokers do
    /// not answer a metadata request.
    pub async fn connect(config: LogBridgeConfig) -> Result<Self, BridgeError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("message.timeout.ms", config.send_timeout.as_millis().to_string())
            .create()
            .map_err(|e| BridgeError::Connect(e.to_string()))?;

        let metadata = producer.clone();
        let topic = config.topic.clone();
        tokio::task::spawn_blocking(move || {
            metadata
                .client()
                .fetch_metadata(Some(&topic), Duration::from_secs(5))
                .map(|_| ())
        })
        .await
        .map_err(|e| BridgeError::Connect(e.to_string()))?
        .map_err(|e| BridgeError::Connect(e.to_string()))?;

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.group_id)
            .set("enable.auto.commit", "false")
            .create()
            .map_err(|e| BridgeError::Connect(e.to_string()))?;

        let mut assignment = TopicPartitionList::new();
        assignment
            .add_partition_offset(&config.topic, config.partition, Offset::End)
            .map_err(|e| BridgeError::Subscribe(e.to_string()))?;
        consumer
            .assign(&assignment)
            .map_err(|e| BridgeError::Subscribe(e.to_string()))?;

        info!(
            brokers = %config.brokers,
            topic = %config.topic,
            partition = config.partition,
            "Consuming partition from newest offset"
        );

        let fanout = RoomFanout::new(config.fanout_capacity);
        let consumer_task = tokio::spawn(consume(consumer, fanout.clone()));

        Ok(Self {
            producer,
            fanout,
            config,
            consumer_task,
        })
    }
}

impl Drop for LogBridge {
    fn drop(&mut self) {
        self.consumer_task.abort();
    }
}

async fn consume(consumer: StreamConsumer, fanout: RoomFanout) {
    loop {
        match consumer.recv().await {
            Ok(record) => match dispatch(&fanout, record.key(), record.payload()) {
                Some(receivers) => trace!(offset = record.offset(), receivers, "Consumed record"),
                None => debug!(offset = record.offset(), "Skipping record without key"),
            },
            Err(e) => {
                warn!(error = %e, "Kafka consume failed");
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
    }
}

/// Hand one record to the subscribers of the room named by its key.
/// Records without a key are skipped and return `None`.
fn dispatch(fanout: &RoomFanout, key: Option<&[u8]>, payload: Option<&[u8]>) -> Option<usize> {
    let room = String::from_utf8_lossy(key?);
    let payload = payload.map(Bytes::copy_from_slice).unwrap_or_default();
    Some(fanout.deliver(&room, payload))
}

#[async_trait]
impl IngressBridge for LogBridge {
    fn name(&self) -> &'static str {
        "kafka"
    }

    /// Local fan-out only; the partition consumer is already running.
    async fn subscribe(&self, room: &str) -> Result<EventStream, BridgeError> {
        Ok(self.fanout.subscribe(room))
    }

    async fn publish(&self, room: &str, payload: Bytes) -> Result<(), BridgeError> {
        let record = FutureRecord::to(&self.config.topic)
            .key(room)
            .payload(payload.as_ref())
            .partition(self.config.partition);

        let (partition, offset) = self
            .producer
            .send(record, self.config.send_timeout)
            .await
            .map_err(|(e, _)| BridgeError::Publish(e.to_string()))?;

        trace!(room = %room, partition, offset, "Appended to log");
        Ok(())
    }
}
