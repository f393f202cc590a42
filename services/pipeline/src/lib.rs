//! Road survey pipeline - Kafka notifications for completed ingestion runs.
//!
//! One message is produced per persisted route, carrying the owning user id
//! and the new route id, for the downstream prediction worker.
//!
//! # Example
//!
//! ```rust,no_run
//! use roadsurvey_pipeline::{KafkaConfig, RouteNotifier, SurveyProducer};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let producer = SurveyProducer::new(KafkaConfig::new("localhost:9092"))?;
//!     producer.notify_route_ready("user-1", "route-1").await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod producer;

pub use config::{
    ConfigError, KafkaConfig, ReliabilityConfig, SaslConfig, SecurityProtocol, TopicConfig,
};
pub use producer::{
    DeliveryResult, OutgoingMessage, ProducerError, RouteNotifier, RouteReadyMessage,
    SurveyProducer,
};
