//! Kafka producer wrapper for route notifications.
//!
//! The ingest digester announces each durably persisted route exactly once;
//! the downstream prediction worker consumes these messages to start its
//! detection pass.

use crate::config::KafkaConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

/// Errors that can occur during message production
#[derive(Error, Debug)]
pub enum ProducerError {
    #[error("Failed to create producer: {0}")]
    CreationError(String),

    #[error("Failed to serialize message: {0}")]
    SerializationError(String),

    #[error("Failed to send message to topic {topic}: {message}")]
    SendError { topic: String, message: String },

    #[error("Producer timeout after {0:?}")]
    Timeout(Duration),
}

/// Result of a successful message delivery
#[derive(Debug, Clone)]
pub struct DeliveryResult {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
}

/// Body of the route-ready notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteReadyMessage {
    pub user_id: String,
    pub route_id: String,
    pub created_at: DateTime<Utc>,
}

impl RouteReadyMessage {
    pub fn new(user_id: impl Into<String>, route_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            route_id: route_id.into(),
            created_at: Utc::now(),
        }
    }
}

/// Message to be sent to Kafka
#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub topic: String,
    /// Optional message key for partitioning
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

impl OutgoingMessage {
    /// Create a new outgoing message with a JSON payload
    pub fn new_json<T: Serialize>(
        topic: impl Into<String>,
        message: &T,
    ) -> Result<Self, ProducerError> {
        let payload = serde_json::to_vec(message)
            .map_err(|e| ProducerError::SerializationError(e.to_string()))?;
        Ok(Self {
            topic: topic.into(),
            key: None,
            payload,
            headers: Vec::new(),
        })
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    pub fn with_message_type(self, msg_type: impl Into<String>) -> Self {
        self.with_header("message-type", msg_type)
    }
}

/// Producer-side seam used by the digester once a route is persisted.
#[async_trait]
pub trait RouteNotifier: Send + Sync {
    async fn notify_route_ready(&self, user_id: &str, route_id: &str) -> Result<(), ProducerError>;
}

/// High-level Kafka producer wrapper
pub struct SurveyProducer {
    producer: FutureProducer,
    config: KafkaConfig,
    default_timeout: Duration,
}

impl SurveyProducer {
    /// Create a new producer with the given configuration
    pub fn new(config: KafkaConfig) -> Result<Self, ProducerError> {
        info!(
            bootstrap_servers = %config.bootstrap_servers,
            topic = %config.topics.route_ready,
            "Creating Kafka producer"
        );

        let producer: FutureProducer = config
            .build_producer_config()
            .create()
            .map_err(|e| ProducerError::CreationError(e.to_string()))?;

        let default_timeout = config.request_timeout();

        Ok(Self {
            producer,
            config,
            default_timeout,
        })
    }

    pub fn config(&self) -> &KafkaConfig {
        &self.config
    }

    /// Send a message and wait for delivery confirmation
    #[instrument(skip(self, message), fields(topic = %message.topic, key = ?message.key))]
    pub async fn send(&self, message: OutgoingMessage) -> Result<DeliveryResult, ProducerError> {
        let topic = message.topic.clone();
        let key = message.key.clone();

        let mut headers = OwnedHeaders::new();
        for (name, value) in &message.headers {
            headers = headers.insert(Header {
                key: name,
                value: Some(value.as_bytes()),
            });
        }

        let mut record = FutureRecord::to(&topic)
            .payload(&message.payload)
            .headers(headers);
        if let Some(ref k) = key {
            record = record.key(k);
        }

        debug!(size_bytes = message.payload.len(), "Sending message");

        let (partition, offset) = self
            .producer
            .send(record, Timeout::After(self.default_timeout))
            .await
            .map_err(|(e, _)| ProducerError::SendError {
                topic: topic.clone(),
                message: e.to_string(),
            })?;

        debug!(partition, offset, "Message delivered");

        Ok(DeliveryResult {
            topic,
            partition,
            offset,
            key,
        })
    }

    /// Flush all pending messages
    pub fn flush(&self, timeout: Duration) -> Result<(), ProducerError> {
        self.producer
            .flush(Timeout::After(timeout))
            .map_err(|_| ProducerError::Timeout(timeout))
    }
}

#[async_trait]
impl RouteNotifier for SurveyProducer {
    async fn notify_route_ready(&self, user_id: &str, route_id: &str) -> Result<(), ProducerError> {
        let body = RouteReadyMessage::new(user_id, route_id);
        let message = route_ready_message(&self.config.topics.route_ready, &body)?;
        let delivery = self.send(message).await?;

        info!(
            user_id = %user_id,
            route_id = %route_id,
            partition = delivery.partition,
            offset = delivery.offset,
            "Route-ready notification enqueued"
        );
        Ok(())
    }
}

impl Drop for SurveyProducer {
    fn drop(&mut self) {
        if let Err(e) = self.flush(Duration::from_secs(5)) {
            warn!("Failed to flush producer on shutdown: {}", e);
        }
    }
}

/// Keyed by route id so redeliveries for one route land on one partition.
fn route_ready_message(
    topic: &str,
    body: &RouteReadyMessage,
) -> Result<OutgoingMessage, ProducerError> {
    Ok(OutgoingMessage::new_json(topic, body)?
        .with_key(&body.route_id)
        .with_message_type("route_ready")
        .with_header("user-id", &body.user_id))
}
