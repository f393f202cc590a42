//! Configuration management for the survey ingest pipeline.
//!
//! Storage sections reuse the storage crate's types so both services read
//! the same keys; the Kafka section is the pipeline crate's.

use config::{Config, ConfigError, Environment, File};
use roadsurvey_pipeline::KafkaConfig;
use roadsurvey_storage::config::{DynamoConfig, LimitsConfig, S3Config};
use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the ingest pipeline.
#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// DynamoDB tables
    #[serde(default)]
    pub dynamo: DynamoConfig,

    /// Bucket images are uploaded to
    pub s3: S3Config,

    /// Payload limits shared with the query side
    #[serde(default)]
    pub limits: LimitsConfig,

    /// Route-ready notifications
    pub kafka: KafkaConfig,

    /// Road-snap service
    #[serde(default)]
    pub roads: RoadsConfig,

    /// Digest behaviour
    #[serde(default)]
    pub digest: DigestConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Road-snap service configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct RoadsConfig {
    /// Snap-to-roads endpoint
    #[serde(default = "default_roads_endpoint")]
    pub endpoint: String,

    /// API key; required only when snapping is requested
    #[serde(default)]
    pub api_key: Option<String>,

    /// Request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub timeout_secs: u64,
}

/// Digest configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DigestConfig {
    /// Key prefix images are uploaded under; the route id and file name follow
    #[serde(default = "default_image_prefix")]
    pub image_prefix: String,

    /// Snap positions to roads unless the caller says otherwise
    #[serde(default)]
    pub snap_to_roads: bool,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_roads_endpoint() -> String {
    "https://roads.googleapis.com/v1/snapToRoads".to_string()
}
fn default_request_timeout() -> u64 {
    30
}
fn default_image_prefix() -> String {
    "routes".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}

impl Default for RoadsConfig {
    fn default() -> Self {
        Self {
            endpoint: default_roads_endpoint(),
            api_key: None,
            timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for DigestConfig {
    fn default() -> Self {
        Self {
            image_prefix: default_image_prefix(),
            snap_to_roads: false,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl IngestConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Later sources override earlier ones:
    /// 1. `config/ingest`
    /// 2. `/etc/roadsurvey/ingest`
    /// 3. Environment variables (e.g. `INGEST__S3__BUCKET`)
    pub fn load() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name("config/ingest").required(false))
            .add_source(File::with_name("/etc/roadsurvey/ingest").required(false))
            .add_source(
                Environment::with_prefix("INGEST")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Create configuration from environment variables only.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(
                Environment::with_prefix("INGEST")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Validate the configuration. `snap_to_roads` is the effective flag for
    /// this run.
    pub fn validate(&self, snap_to_roads: bool) -> Result<(), ConfigValidationError> {
        if self.s3.bucket.is_empty() {
            return Err(ConfigValidationError::MissingField("s3.bucket".to_string()));
        }

        if self.digest.image_prefix.contains("..") {
            return Err(ConfigValidationError::InvalidValue {
                field: "digest.image_prefix".to_string(),
                message: "Prefix must not contain '..'".to_string(),
            });
        }

        let shared = |e: roadsurvey_storage::config::ConfigValidationError| match e {
            roadsurvey_storage::config::ConfigValidationError::MissingField(field) => {
                ConfigValidationError::MissingField(field)
            }
            roadsurvey_storage::config::ConfigValidationError::InvalidValue { field, message } => {
                ConfigValidationError::InvalidValue { field, message }
            }
        };
        self.s3.validate().map_err(shared)?;
        self.limits.validate().map_err(shared)?;

        if snap_to_roads {
            if !self.roads.endpoint.starts_with("http://")
                && !self.roads.endpoint.starts_with("https://")
            {
                return Err(ConfigValidationError::InvalidValue {
                    field: "roads.endpoint".to_string(),
                    message: "URL must start with http:// or https://".to_string(),
                });
            }
            if self.roads.api_key.as_deref().map_or(true, str::is_empty) {
                return Err(ConfigValidationError::MissingField(
                    "roads.api_key".to_string(),
                ));
            }
        }

        self.kafka
            .validate()
            .map_err(|e| ConfigValidationError::InvalidValue {
                field: "kafka".to_string(),
                message: e.to_string(),
            })
    }
}

impl RoadsConfig {
    /// Get request timeout as Duration.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}
