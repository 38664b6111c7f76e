use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the pipeline service
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// AWS client configuration shared by S3, SQS and SNS
    #[serde(default)]
    pub aws: AwsConfig,
    /// Work queue configuration
    pub queue: QueueConfig,
    /// Hot/cold bucket layout
    pub storage: StorageConfig,
    /// Status store database configuration
    pub database: DatabaseConfig,
    /// Completion notifications
    #[serde(default)]
    pub notifier: NotifierConfig,
    /// Retrying writer configuration
    #[serde(default)]
    pub retry: RetryConfig,
    /// Lifecycle mover configuration
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
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
    /// Metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// AWS client configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AwsConfig {
    /// AWS region
    #[serde(default = "default_region")]
    pub region: String,
    /// Custom endpoint URL (for LocalStack, MinIO, etc.)
    pub endpoint_url: Option<String>,
    /// Force path-style S3 access (required for MinIO)
    #[serde(default)]
    pub force_path_style: bool,
}

/// Work queue configuration
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    /// Main queue name (used by `provision`)
    #[serde(default = "default_queue_name")]
    pub queue_name: String,
    /// Dead-letter queue name (used by `provision`)
    #[serde(default = "default_dead_letter_queue_name")]
    pub dead_letter_queue_name: String,
    /// URL of the work queue
    pub queue_url: Option<String>,
    /// URL of the dead-letter queue, for depth observability only
    pub dead_letter_queue_url: Option<String>,
    /// Messages requested per receive (1-10)
    #[serde(default = "default_max_messages")]
    pub max_messages: i32,
    /// Long-poll wait time in seconds (0-20)
    #[serde(default = "default_wait_time_secs")]
    pub wait_time_secs: u64,
    /// Visibility timeout applied on receive
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,
    /// Receives before the queue redrives a message to the dead-letter queue
    #[serde(default = "default_max_delivery_attempts")]
    pub max_delivery_attempts: u32,
    /// Idle backoff after an empty receive, lower bound
    #[serde(default = "default_idle_backoff_min_ms")]
    pub idle_backoff_min_ms: u64,
    /// Idle backoff after repeated empty receives, upper bound
    #[serde(default = "default_idle_backoff_max_ms")]
    pub idle_backoff_max_ms: u64,
}

/// Bucket layout
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Bucket receiving uploads and fresh reports
    pub hot_bucket: String,
    /// Archive bucket for aged partitions
    pub cold_bucket: String,
    /// Prefix under which daily report partitions live
    #[serde(default = "default_report_prefix")]
    pub report_prefix: String,
    /// Prefix for monthly revenue summaries
    #[serde(default = "default_monthly_prefix")]
    pub monthly_prefix: String,
    /// Keys requested per list page
    #[serde(default = "default_list_page_size")]
    pub list_page_size: i32,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Minimum number of connections in the pool
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

/// Notification fan-out configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotifierConfig {
    /// Topic receiving completion/error events
    pub topic_arn: Option<String>,
}

/// Retrying writer configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per write, including the first
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the second attempt
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Cap on the delay between attempts
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

/// Lifecycle mover configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LifecycleConfig {
    /// Partitions older than this many days move to cold storage
    #[serde(default = "default_threshold_days")]
    pub threshold_days: i64,
    /// Interval between sweeps in watch mode
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
    /// Zero-based position of the date segment in `/`-separated keys
    #[serde(default = "default_date_segment")]
    pub date_segment: usize,
}

/// API configuration for the report/status endpoint
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
    /// Widest report range one request may ask for, in days
    #[serde(default = "default_max_range_days")]
    pub max_range_days: i64,
}

// Default value functions
fn default_service_name() -> String {
    "parcel-pipeline".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_queue_name() -> String {
    "file-processing-queue".to_string()
}

fn default_dead_letter_queue_name() -> String {
    "dead-letter-queue".to_string()
}

fn default_max_messages() -> i32 {
    1
}

fn default_wait_time_secs() -> u64 {
    5
}

fn default_visibility_timeout_secs() -> u64 {
    30
}

fn default_max_delivery_attempts() -> u32 {
    3
}

fn default_idle_backoff_min_ms() -> u64 {
    250
}

fn default_idle_backoff_max_ms() -> u64 {
    5_000
}

fn default_report_prefix() -> String {
    "daily_reports".to_string()
}

fn default_monthly_prefix() -> String {
    "monthly_reports".to_string()
}

fn default_list_page_size() -> i32 {
    1000
}

fn default_max_connections() -> u32 {
    10
}

fn default_min_connections() -> u32 {
    1
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_idle_timeout_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    2_000
}

fn default_threshold_days() -> i64 {
    30
}

fn default_sweep_interval_secs() -> u64 {
    3600
}

fn default_date_segment() -> usize {
    1 // daily_reports/{date}/{shard}
}

fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8000
}

fn default_max_range_days() -> i64 {
    366
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .set_default("service.name", "parcel-pipeline")?
            .set_default("service.log_level", "info")?
            .set_default("service.metrics_port", 9090)?
            .add_source(config::File::with_name("config/parcel").required(false))
            .add_source(config::File::with_name("/etc/parcel/parcel").required(false))
            // PARCEL__QUEUE__QUEUE_URL -> queue.queue_url
            .add_source(
                config::Environment::with_prefix("PARCEL")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Lifecycle threshold age
    pub fn lifecycle_threshold(&self) -> chrono::Duration {
        chrono::Duration::days(self.lifecycle.threshold_days)
    }

    /// Interval between sweeps in watch mode
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.lifecycle.sweep_interval_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for AwsConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            endpoint_url: None,
            force_path_style: false,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            queue_name: default_queue_name(),
            dead_letter_queue_name: default_dead_letter_queue_name(),
            queue_url: None,
            dead_letter_queue_url: None,
            max_messages: default_max_messages(),
            wait_time_secs: default_wait_time_secs(),
            visibility_timeout_secs: default_visibility_timeout_secs(),
            max_delivery_attempts: default_max_delivery_attempts(),
            idle_backoff_min_ms: default_idle_backoff_min_ms(),
            idle_backoff_max_ms: default_idle_backoff_max_ms(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            threshold_days: default_threshold_days(),
            sweep_interval_secs: default_sweep_interval_secs(),
            date_segment: default_date_segment(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_api_host(),
            port: default_api_port(),
            cors_enabled: default_true(),
            cors_origins: Vec::new(),
            max_range_days: default_max_range_days(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        assert_eq!(default_max_retries(), 3);
        assert_eq!(default_max_delivery_attempts(), 3);
        assert_eq!(default_threshold_days(), 30);
        assert_eq!(default_report_prefix(), "daily_reports");
    }

    #[test]
    fn test_minimal_document_fills_defaults() {
        let config: Config = config::Config::builder()
            .add_source(config::File::from_str(
                r#"
                [queue]
                queue_url = "http://localhost:4566/000000000000/file-processing-queue"

                [storage]
                hot_bucket = "order-processing-bucket"
                cold_bucket = "order-archive-bucket"

                [database]
                url = "postgres://localhost/parcel"
                "#,
                config::FileFormat::Toml,
            ))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.queue.max_messages, 1);
        assert_eq!(config.queue.wait_time_secs, 5);
        assert_eq!(config.lifecycle_threshold(), chrono::Duration::days(30));
        assert_eq!(config.storage.report_prefix, "daily_reports");
        assert_eq!(config.storage.monthly_prefix, "monthly_reports");
        assert_eq!(config.retry.max_retries, 3);
        assert!(config.notifier.topic_arn.is_none());
        assert_eq!(config.api.port, 8000);
        assert_eq!(config.api.max_range_days, 366);
    }
}
