use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use slotwise_core::collaborators::{DownstreamError, EventSink, RetryQueue};
use slotwise_core::RetryJob;
use slotwise_shared::events::{HoldCreatedEvent, SessionEvent, HOLD_EVENTS_TOPIC, SESSION_EVENTS_TOPIC};
use std::time::Duration;
use tracing::{error, info};

#[derive(Clone)]
pub struct EventProducer {
    producer: FutureProducer,
}

impl EventProducer {
    pub fn new(brokers: &str) -> Result<Self, rdkafka::error::KafkaError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .set("enable.idempotence", "true")
            .create()?;

        Ok(Self { producer })
    }

    pub async fn publish(&self, topic: &str, key: &str, payload: &str) -> Result<(), rdkafka::error::KafkaError> {
        let record = FutureRecord::to(topic)
            .key(key)
            .payload(payload);

        match self.producer.send(record, Timeout::After(Duration::from_secs(0))).await {
            Ok(delivery) => {
                info!("Sent message to {}/{}: partition {} offset {}", topic, key, delivery.partition, delivery.offset);
                Ok(())
            }
            Err((e, _msg)) => {
                error!("Failed to send message to {}: {}", topic, e);
                Err(e)
            }
        }
    }
}

/// Retry jobs as Kafka messages keyed by session id, so that all retries of
/// one session stay ordered on one partition.
pub struct KafkaRetryQueue {
    producer: EventProducer,
    topic: String,
}

impl KafkaRetryQueue {
    pub fn new(producer: EventProducer, topic: impl Into<String>) -> Self {
        Self {
            producer,
            topic: topic.into(),
        }
    }
}

#[async_trait]
impl RetryQueue for KafkaRetryQueue {
    async fn enqueue(&self, job: &RetryJob) -> Result<(), DownstreamError> {
        let payload = serde_json::to_string(job)
            .map_err(|e| DownstreamError::new("retry-queue", e.to_string()))?;
        self.producer
            .publish(&self.topic, &job.session_id.to_string(), &payload)
            .await
            .map_err(|e| DownstreamError::new("retry-queue", e.to_string()))
    }
}

pub struct KafkaEventSink {
    producer: EventProducer,
}

impl KafkaEventSink {
    pub fn new(producer: EventProducer) -> Self {
        Self { producer }
    }
}

#[async_trait]
impl EventSink for KafkaEventSink {
    async fn publish(&self, event: &SessionEvent) -> Result<(), DownstreamError> {
        let payload = serde_json::to_string(event)
            .map_err(|e| DownstreamError::new("event-bus", e.to_string()))?;
        self.producer
            .publish(SESSION_EVENTS_TOPIC, &event.key(), &payload)
            .await
            .map_err(|e| DownstreamError::new("event-bus", e.to_string()))
    }

    async fn publish_hold_created(&self, event: &HoldCreatedEvent) -> Result<(), DownstreamError> {
        let payload = serde_json::to_string(event)
            .map_err(|e| DownstreamError::new("event-bus", e.to_string()))?;
        self.producer
            .publish(HOLD_EVENTS_TOPIC, &event.resource_id, &payload)
            .await
            .map_err(|e| DownstreamError::new("event-bus", e.to_string()))
    }
}
