use config::{Config, ConfigError, Environment};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServiceConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    // Materialize configuration
    /// Materialize host
    #[serde(default = "default_materialize_host")]
    pub materialize_host: String,

    /// Materialize port
    #[serde(default = "default_materialize_port")]
    pub materialize_port: u16,

    /// Materialize database name
    #[serde(default = "default_materialize_database")]
    pub materialize_database: String,

    /// Materialize username
    #[serde(default = "default_materialize_user")]
    pub materialize_user: String,

    /// Materialize password
    #[serde(default = "default_materialize_password")]
    pub materialize_password: String,

    /// Connection pool size for checkpoint reads and writes
    #[serde(default = "default_materialize_pool_size")]
    pub materialize_pool_size: usize,

    // Feed configuration
    /// Relation the change feed subscribes to
    #[serde(default = "default_feed_relation")]
    pub feed_relation: String,

    /// Column carrying the event's unique identifier
    #[serde(default = "default_feed_id_column")]
    pub feed_id_column: String,

    /// Column identifying the notification recipient
    #[serde(default = "default_feed_recipient_column")]
    pub feed_recipient_column: String,

    // Novu configuration
    /// Novu API base URL
    #[serde(default = "default_novu_api_url")]
    pub novu_api_url: String,

    /// Novu API key (required for production)
    #[serde(default = "default_novu_api_key")]
    pub novu_api_key: String,

    /// Per-request timeout for trigger calls in seconds
    #[serde(default = "default_novu_timeout_secs")]
    pub novu_timeout_secs: u64,

    // Consumer configuration
    /// Logical subscription name keying the checkpoint row
    #[serde(default = "default_subscription_name")]
    pub subscription_name: String,

    /// Notification workflow triggered once per change event
    #[serde(default = "default_workflow_id")]
    pub workflow_id: String,

    /// Cooperative wait between polls in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Resume from the stored checkpoint on restart
    #[serde(default = "default_resume_on_restart")]
    pub resume_on_restart: bool,

    /// Minimum retry backoff in milliseconds
    #[serde(default = "default_retry_min_backoff_ms")]
    pub retry_min_backoff_ms: u64,

    /// Maximum retry backoff in milliseconds
    #[serde(default = "default_retry_max_backoff_ms")]
    pub retry_max_backoff_ms: u64,

    /// Maximum retry attempts before the loop fails
    #[serde(default = "default_max_retry_attempts")]
    pub max_retry_attempts: u32,

    // OpenTelemetry configuration
    /// OpenTelemetry OTLP endpoint (gRPC)
    #[serde(default = "default_otel_endpoint")]
    pub otel_endpoint: String,

    /// Enable OpenTelemetry export
    #[serde(default = "default_otel_enabled")]
    pub otel_enabled: bool,

    /// Service name for the OpenTelemetry resource
    #[serde(default = "default_otel_service_name")]
    pub otel_service_name: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

// Materialize defaults
fn default_materialize_host() -> String {
    "localhost".to_string()
}

fn default_materialize_port() -> u16 {
    6875
}

fn default_materialize_database() -> String {
    "materialize".to_string()
}

fn default_materialize_user() -> String {
    "materialize".to_string()
}

fn default_materialize_password() -> String {
    "materialize".to_string()
}

fn default_materialize_pool_size() -> usize {
    2
}

// Feed defaults
fn default_feed_relation() -> String {
    "winning_bids".to_string()
}

fn default_feed_id_column() -> String {
    "id".to_string()
}

fn default_feed_recipient_column() -> String {
    "buyer".to_string()
}

// Novu defaults
fn default_novu_api_url() -> String {
    "https://api.novu.co".to_string()
}

fn default_novu_api_key() -> String {
    String::new()
}

fn default_novu_timeout_secs() -> u64 {
    10
}

// Consumer defaults
fn default_subscription_name() -> String {
    "notify_winners".to_string()
}

fn default_workflow_id() -> String {
    "winning-bid-alert".to_string()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_resume_on_restart() -> bool {
    true
}

fn default_retry_min_backoff_ms() -> u64 {
    1000
}

fn default_retry_max_backoff_ms() -> u64 {
    30_000
}

fn default_max_retry_attempts() -> u32 {
    5
}

// OpenTelemetry defaults
fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_otel_enabled() -> bool {
    false
}

fn default_otel_service_name() -> String {
    "bidwatch-service".to_string()
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(Environment::with_prefix("BIDWATCH"))
            .build()?
            .try_deserialize()
    }
}
