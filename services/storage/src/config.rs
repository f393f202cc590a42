use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the storage service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// DynamoDB configuration
    pub dynamo: DynamoConfig,
    /// S3 configuration
    pub s3: S3Config,
    /// Response size limits
    #[serde(default)]
    pub limits: LimitsConfig,
    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// DynamoDB tables configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DynamoConfig {
    /// Table holding readings, partitioned by spatial bucket
    #[serde(default = "default_readings_table")]
    pub readings_table: String,
    /// Table holding routes and the organization hierarchy
    #[serde(default = "default_organization_table")]
    pub organization_table: String,
    /// AWS region (SDK default when unset)
    pub region: Option<String>,
    /// Custom endpoint URL (for LocalStack, DynamoDB Local, etc.)
    pub endpoint_url: Option<String>,
    /// Operation timeout in milliseconds
    pub timeout_ms: Option<u64>,
}

/// S3 storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct S3Config {
    /// Bucket images and offloaded payloads are written to
    pub bucket: String,
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for MinIO, LocalStack, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
    /// Presigned URL expiration in seconds
    #[serde(default = "default_presigned_url_expiry_secs")]
    pub presigned_url_expiry_secs: u64,
    /// Multipart upload threshold in bytes (5MB default)
    #[serde(default = "default_multipart_threshold")]
    pub multipart_threshold_bytes: usize,
    /// Part size for multipart uploads in bytes (5MB default)
    #[serde(default = "default_part_size")]
    pub part_size_bytes: usize,
}

/// Bounds on inline query payloads
#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    /// Serialized payloads above this size are written to S3 instead
    #[serde(default = "default_max_inline_payload_bytes")]
    pub max_inline_payload_bytes: usize,
    /// Key prefix for offloaded payloads
    #[serde(default = "default_offload_prefix")]
    pub offload_prefix: String,
}

/// API configuration for the query endpoints
#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    /// API listen address
    #[serde(default = "default_api_host")]
    pub host: String,
    /// API listen port
    #[serde(default = "default_api_port")]
    pub port: u16,
    /// Enable CORS
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
    /// Allowed CORS origins
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

// Default value functions
fn default_service_name() -> String {
    "storage-service".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_readings_table() -> String {
    "roadsurvey-readings".to_string()
}

fn default_organization_table() -> String {
    "roadsurvey-organization".to_string()
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_presigned_url_expiry_secs() -> u64 {
    3600
}

fn default_multipart_threshold() -> usize {
    5 * 1024 * 1024 // 5MB
}

/// Smallest non-final part S3 accepts
pub const MIN_PART_SIZE_BYTES: usize = 5 * 1024 * 1024;

/// Longest presigned URL lifetime S3 accepts (7 days)
pub const MAX_PRESIGNED_URL_EXPIRY_SECS: u64 = 7 * 24 * 60 * 60;

fn default_part_size() -> usize {
    5 * 1024 * 1024 // 5MB
}

fn default_max_inline_payload_bytes() -> usize {
    // serverless function response ceiling is 6MB; leave headroom
    5 * 1024 * 1024
}

fn default_offload_prefix() -> String {
    "query-results".to_string()
}

fn default_true() -> bool {
    true
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .set_default("service.name", "storage-service")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            .add_source(config::File::with_name("config/storage").required(false))
            .add_source(config::File::with_name("/etc/roadsurvey/storage").required(false))
            // STORAGE__S3__BUCKET -> s3.bucket
            .add_source(
                config::Environment::with_prefix("STORAGE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Get presigned URL expiry as Duration
    pub fn presigned_url_expiry(&self) -> Duration {
        self.s3.presigned_url_expiry()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.dynamo.readings_table.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "dynamo.readings_table".to_string(),
            ));
        }
        if self.dynamo.organization_table.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "dynamo.organization_table".to_string(),
            ));
        }

        self.s3.validate()?;
        self.limits.validate()
    }
}

impl S3Config {
    pub fn presigned_url_expiry(&self) -> Duration {
        Duration::from_secs(self.presigned_url_expiry_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.bucket.is_empty() {
            return Err(ConfigValidationError::MissingField("s3.bucket".to_string()));
        }

        if self.multipart_threshold_bytes == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "s3.multipart_threshold_bytes".to_string(),
                message: "Threshold must be greater than 0".to_string(),
            });
        }

        if self.part_size_bytes < MIN_PART_SIZE_BYTES {
            return Err(ConfigValidationError::InvalidValue {
                field: "s3.part_size_bytes".to_string(),
                message: format!("Part size must be at least {MIN_PART_SIZE_BYTES} bytes"),
            });
        }

        if self.presigned_url_expiry_secs == 0
            || self.presigned_url_expiry_secs > MAX_PRESIGNED_URL_EXPIRY_SECS
        {
            return Err(ConfigValidationError::InvalidValue {
                field: "s3.presigned_url_expiry_secs".to_string(),
                message: format!("Expiry must be between 1 and {MAX_PRESIGNED_URL_EXPIRY_SECS}"),
            });
        }

        Ok(())
    }
}

impl LimitsConfig {
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.max_inline_payload_bytes == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "limits.max_inline_payload_bytes".to_string(),
                message: "Inline limit must be greater than 0".to_string(),
            });
        }

        if self.offload_prefix.is_empty() || self.offload_prefix.contains("..") {
            return Err(ConfigValidationError::InvalidValue {
                field: "limits.offload_prefix".to_string(),
                message: "Prefix must be non-empty and must not contain '..'".to_string(),
            });
        }

        Ok(())
    }
}

/// Configuration validation errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for DynamoConfig {
    fn default() -> Self {
        Self {
            readings_table: default_readings_table(),
            organization_table: default_organization_table(),
            region: None,
            endpoint_url: None,
            timeout_ms: None,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_inline_payload_bytes: default_max_inline_payload_bytes(),
            offload_prefix: default_offload_prefix(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: true,
            cors_origins: Vec::new(),
        }
    }
}
