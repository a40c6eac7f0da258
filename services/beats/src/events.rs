//! Event wire format, the Kafka publisher, and the dead-letter sink.
//!
//! Every message on the bus is a `{"type": ..., "payload": ...}` envelope.
//! Outbound publication is best-effort: the coordinator logs a failed publish
//! and moves on. Dead letters get their own topic and carry the full original
//! event so they can be replayed by hand.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::counter;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Event type names shared with the other services on the bus.
pub mod event_types {
    pub const BEAT_CREATED: &str = "beat-created";
    pub const BEAT_UPDATED: &str = "beat-updated";
    pub const BEAT_DELETED: &str = "beat-deleted";
    pub const PLAY_INCREMENTED: &str = "play-incremented";
    pub const DOWNLOAD_INCREMENTED: &str = "download-incremented";
    pub const USER_DELETED: &str = "user-deleted";
}

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("event serialization failed: {0}")]
    Serialization(String),

    #[error("broker send failed: {0}")]
    Broker(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    #[serde(rename = "type")]
    pub event_type: String,
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    pub fn new(event_type: &str, payload: impl Serialize) -> Result<Self, PublishError> {
        Ok(Self {
            event_type: event_type.to_string(),
            payload: serde_json::to_value(payload)
                .map_err(|e| PublishError::Serialization(e.to_string()))?,
        })
    }
}

/// A failed event, preserved verbatim for replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetterRecord {
    pub original_event: serde_json::Value,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

impl DeadLetterRecord {
    pub fn new(original_event: serde_json::Value, error: impl ToString) -> Self {
        Self {
            original_event,
            error: error.to_string(),
            timestamp: Utc::now(),
        }
    }
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// `key` is the partition key, normally the beat id.
    async fn publish(&self, key: &str, envelope: &EventEnvelope) -> Result<(), PublishError>;
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn record(&self, record: DeadLetterRecord) -> Result<(), PublishError>;
}

const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Kafka-backed publisher for the beat-events topic.
pub struct KafkaEventPublisher {
    producer: FutureProducer,
    topic: String,
}

impl KafkaEventPublisher {
    pub fn new(brokers: &str, topic: &str) -> Result<Self, PublishError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .create()
            .map_err(|e| PublishError::Broker(e.to_string()))?;

        info!(brokers = %brokers, topic = %topic, "event publisher created");
        Ok(Self {
            producer,
            topic: topic.to_string(),
        })
    }
}

#[async_trait]
impl EventPublisher for KafkaEventPublisher {
    async fn publish(&self, key: &str, envelope: &EventEnvelope) -> Result<(), PublishError> {
        let json = serde_json::to_string(envelope)
            .map_err(|e| PublishError::Serialization(e.to_string()))?;

        let record = FutureRecord::to(&self.topic).key(key).payload(&json);
        match self.producer.send(record, Timeout::After(SEND_TIMEOUT)).await {
            Ok((partition, offset)) => {
                counter!("beats.events.published").increment(1);
                debug!(
                    event_type = %envelope.event_type,
                    partition,
                    offset,
                    "event published"
                );
                Ok(())
            }
            Err((e, _)) => {
                counter!("beats.events.publish_failed").increment(1);
                Err(PublishError::Broker(e.to_string()))
            }
        }
    }
}

impl Drop for KafkaEventPublisher {
    fn drop(&mut self) {
        // Push out anything still buffered before the process exits.
        if let Err(e) = self.producer.flush(Timeout::After(SEND_TIMEOUT)) {
            warn!(error = %e, "event producer flush on shutdown failed");
        }
    }
}

/// Kafka-backed dead-letter sink.
pub struct KafkaDeadLetterSink {
    producer: FutureProducer,
    topic: String,
}

impl KafkaDeadLetterSink {
    pub fn new(brokers: &str, topic: &str) -> Result<Self, PublishError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .create()
            .map_err(|e| PublishError::Broker(e.to_string()))?;

        info!(brokers = %brokers, topic = %topic, "dead-letter sink created");
        Ok(Self {
            producer,
            topic: topic.to_string(),
        })
    }
}

#[async_trait]
impl DeadLetterSink for KafkaDeadLetterSink {
    async fn record(&self, record: DeadLetterRecord) -> Result<(), PublishError> {
        let json = serde_json::to_string(&record)
            .map_err(|e| PublishError::Serialization(e.to_string()))?;

        let kafka_record = FutureRecord::<(), _>::to(&self.topic).payload(&json);
        self.producer
            .send(kafka_record, Timeout::After(SEND_TIMEOUT))
            .await
            .map_err(|(e, _)| PublishError::Broker(e.to_string()))?;

        counter!("beats.events.dead_lettered").increment(1);
        warn!(error = %record.error, "event routed to dead-letter topic");
        Ok(())
    }
}

impl Drop for KafkaDeadLetterSink {
    fn drop(&mut self) {
        if let Err(e) = self.producer.flush(Timeout::After(SEND_TIMEOUT)) {
            warn!(error = %e, "dead-letter producer flush on shutdown failed");
        }
    }
}
