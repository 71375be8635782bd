//! Configuration management for debugtap services
//!
//! Supports loading configuration from:
//! - Environment variables (prefixed with APP__)
//! - Configuration files (config/default, config/{APP_ENV}, config/local)
//! - Default values

use crate::errors::{AppError, Result};
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// Server configuration
    pub server: ServerConfig,

    /// Database configuration
    pub database: DatabaseConfig,

    /// Redis configuration (in-memory cache when no URL is set)
    #[serde(default)]
    pub redis: RedisConfig,

    /// Capture queue configuration (SQS)
    #[serde(default)]
    pub queue: QueueConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Traffic recorder configuration
    #[serde(default)]
    pub debugger: DebuggerConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Shutdown timeout in seconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Primary database URL (for writes)
    pub url: String,

    /// Read replica URL (optional, falls back to primary)
    pub read_url: Option<String>,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Idle timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Create tables on startup
    #[serde(default = "default_true")]
    pub auto_migrate: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RedisConfig {
    /// Redis URL; the session cache stays in process when unset
    pub url: Option<String>,

    /// Key prefix for namespacing
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
    /// SQS capture queue URL; queued captures use an in-process channel when unset
    pub capture_queue_url: Option<String>,

    /// Maximum messages to receive per poll
    #[serde(default = "default_queue_batch_size")]
    pub batch_size: i32,

    /// Long polling timeout in seconds
    #[serde(default = "default_queue_poll_timeout")]
    pub poll_timeout_secs: i32,

    /// Visibility timeout in seconds
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout_secs: i32,

    /// In-process channel capacity
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level (debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_true")]
    pub json_logging: bool,

    /// Metrics port (0 to disable)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Service name for logs
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

/// How captured records reach storage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureDriver {
    /// Persist inside the request task before responding
    #[default]
    #[serde(alias = "sync")]
    Inline,
    /// Hand the capture to a job queue
    Queue,
}

impl CaptureDriver {
    pub fn as_str(&self) -> &'static str {
        match self {
            CaptureDriver::Inline => "inline",
            CaptureDriver::Queue => "queue",
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DebuggerConfig {
    /// Master switch for the capture middleware
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub driver: CaptureDriver,

    #[serde(default)]
    pub session: SessionSettings,

    #[serde(default)]
    pub retention: RetentionSettings,

    #[serde(default)]
    pub body: BodySettings,

    #[serde(default)]
    pub routes: RouteSettings,

    #[serde(default)]
    pub redact: RedactSettings,

    #[serde(default)]
    pub tenancy: TenancySettings,

    #[serde(default)]
    pub worker: WorkerSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SessionSettings {
    #[serde(default = "default_duration_minutes")]
    pub default_duration_minutes: i64,

    #[serde(default = "default_max_duration_minutes")]
    pub max_duration_minutes: i64,

    /// Resolution cache TTL, negative entries included
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetentionSettings {
    /// Records older than this are pruned
    #[serde(default = "default_retention_hours")]
    pub hours: i64,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_minutes: u64,

    /// Inactive sessions are kept this long before being deleted with their records.
    /// Must be larger than the sweep interval.
    #[serde(default = "default_inactive_grace")]
    pub inactive_grace_minutes: i64,

    /// Rows per delete statement
    #[serde(default = "default_prune_batch")]
    pub batch_size: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BodySettings {
    #[serde(default = "default_true")]
    pub store: bool,

    /// Maximum stored bytes per body; unbounded when unset
    #[serde(default)]
    pub max_size: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RouteSettings {
    /// When non-empty, only matching paths are captured
    #[serde(default)]
    pub include: Vec<String>,

    #[serde(default = "default_route_exclude")]
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RedactSettings {
    #[serde(default = "default_redact_headers")]
    pub headers: Vec<String>,

    #[serde(default = "default_redact_fields")]
    pub fields: Vec<String>,

    #[serde(default = "default_replacement")]
    pub replacement: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TenancySettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_tenant_header")]
    pub header: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerSettings {
    /// Attempts per capture job, first try included
    #[serde(default = "default_worker_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_worker_backoff")]
    pub backoff_secs: u64,
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_request_timeout() -> u64 { 30 }
fn default_shutdown_timeout() -> u64 { 30 }
fn default_max_connections() -> u32 { 20 }
fn default_min_connections() -> u32 { 2 }
fn default_connect_timeout() -> u64 { 10 }
fn default_idle_timeout() -> u64 { 300 }
fn default_key_prefix() -> String { "debugtap".to_string() }
fn default_queue_batch_size() -> i32 { 10 }
fn default_queue_poll_timeout() -> i32 { 20 }
fn default_visibility_timeout() -> i32 { 60 }
fn default_channel_capacity() -> usize { 1024 }
fn default_log_level() -> String { "info".to_string() }
fn default_metrics_port() -> u16 { 9090 }
fn default_service_name() -> String { "debugtap".to_string() }
fn default_true() -> bool { true }
fn default_duration_minutes() -> i64 { 30 }
fn default_max_duration_minutes() -> i64 { 120 }
fn default_cache_ttl() -> u64 { 60 }
fn default_retention_hours() -> i64 { 24 }
fn default_sweep_interval() -> u64 { 15 }
fn default_inactive_grace() -> i64 { 60 }
fn default_prune_batch() -> u64 { 500 }
fn default_tenant_header() -> String { "X-Tenant-ID".to_string() }
fn default_replacement() -> String { "[REDACTED]".to_string() }
fn default_worker_attempts() -> u32 { 3 }
fn default_worker_backoff() -> u64 { 5 }

fn default_route_exclude() -> Vec<String> {
    ["health", "ready", "metrics", "debug/*"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_redact_headers() -> Vec<String> {
    ["Authorization", "Cookie", "Set-Cookie", "X-CSRF-TOKEN", "X-XSRF-TOKEN"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_redact_fields() -> Vec<String> {
    [
        "password",
        "password_confirmation",
        "current_password",
        "new_password",
        "secret",
        "token",
        "api_key",
        "api_secret",
        "credit_card",
        "card_number",
        "cvv",
        "ssn",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: None,
            key_prefix: default_key_prefix(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capture_queue_url: None,
            batch_size: default_queue_batch_size(),
            poll_timeout_secs: default_queue_poll_timeout(),
            visibility_timeout_secs: default_visibility_timeout(),
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: true,
            metrics_port: default_metrics_port(),
            service_name: default_service_name(),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            default_duration_minutes: default_duration_minutes(),
            max_duration_minutes: default_max_duration_minutes(),
            cache_ttl_secs: default_cache_ttl(),
        }
    }
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            hours: default_retention_hours(),
            sweep_interval_minutes: default_sweep_interval(),
            inactive_grace_minutes: default_inactive_grace(),
            batch_size: default_prune_batch(),
        }
    }
}

impl Default for BodySettings {
    fn default() -> Self {
        Self {
            store: true,
            max_size: None,
        }
    }
}

impl Default for RouteSettings {
    fn default() -> Self {
        Self {
            include: Vec::new(),
            exclude: default_route_exclude(),
        }
    }
}

impl Default for RedactSettings {
    fn default() -> Self {
        Self {
            headers: default_redact_headers(),
            fields: default_redact_fields(),
            replacement: default_replacement(),
        }
    }
}

impl Default for TenancySettings {
    fn default() -> Self {
        Self {
            enabled: true,
            header: default_tenant_header(),
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_worker_attempts(),
            backoff_secs: default_worker_backoff(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment and files
    pub fn load() -> std::result::Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Start with defaults
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?
            // Load base config file
            .add_source(File::with_name("config/default").required(false))
            // Load environment-specific config
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            // Load local overrides
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables with APP__ prefix
            // e.g., APP__DEBUGGER__ENABLED=true
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("debugger.routes.include")
                    .with_list_parse_key("debugger.routes.exclude")
                    .with_list_parse_key("debugger.redact.headers")
                    .with_list_parse_key("debugger.redact.fields"),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Load from a specific TOML file
    pub fn from_file(path: &str) -> std::result::Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize()
    }

    /// Reject settings the lifecycle and session rules cannot honour
    pub fn validate(&self) -> Result<()> {
        self.debugger.validate()
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }

    /// Get shutdown timeout as Duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.server.shutdown_timeout_secs)
    }

    /// Get the read database URL (falls back to primary)
    pub fn read_database_url(&self) -> &str {
        self.database.read_url.as_deref().unwrap_or(&self.database.url)
    }
}

impl DebuggerConfig {
    pub fn validate(&self) -> Result<()> {
        let invalid = |message: &str| {
            Err(AppError::Configuration {
                message: message.to_string(),
            })
        };

        if self.session.max_duration_minutes < 1 {
            return invalid("debugger.session.max_duration_minutes must be at least 1");
        }
        if self.session.default_duration_minutes < 1 {
            return invalid("debugger.session.default_duration_minutes must be at least 1");
        }
        if self.session.cache_ttl_secs == 0 {
            return invalid("debugger.session.cache_ttl_secs must be positive");
        }
        if self.retention.hours < 1 {
            return invalid("debugger.retention.hours must be at least 1");
        }
        if self.retention.batch_size == 0 {
            return invalid("debugger.retention.batch_size must be positive");
        }
        if self.retention.sweep_interval_minutes == 0 {
            return invalid("debugger.retention.sweep_interval_minutes must be positive");
        }
        if self.retention.inactive_grace_minutes <= self.retention.sweep_interval_minutes as i64 {
            return invalid(
                "debugger.retention.inactive_grace_minutes must exceed sweep_interval_minutes",
            );
        }
        if self.worker.max_attempts == 0 {
            return invalid("debugger.worker.max_attempts must be at least 1");
        }
        Ok(())
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.session.cache_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.retention.sweep_interval_minutes * 60)
    }

    /// Clamp a requested session length to `1..=max`, falling back to the default
    pub fn clamp_duration(&self, minutes: Option<i64>) -> i64 {
        let max = self.session.max_duration_minutes.max(1);
        minutes
            .unwrap_or(self.session.default_duration_minutes)
            .clamp(1, max)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: default_host(),
                port: default_port(),
                request_timeout_secs: default_request_timeout(),
                shutdown_timeout_secs: default_shutdown_timeout(),
            },
            database: DatabaseConfig {
                url: "postgres://localhost/debugtap".to_string(),
                read_url: None,
                max_connections: default_max_connections(),
                min_connections: default_min_connections(),
                connect_timeout_secs: default_connect_timeout(),
                idle_timeout_secs: default_idle_timeout(),
                auto_migrate: true,
            },
            redis: RedisConfig::default(),
            queue: QueueConfig::default(),
            observability: ObservabilityConfig::default(),
            debugger: DebuggerConfig::default(),
        }
    }
}
