use std::collections::HashMap;
use std::env;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server: ServerConfig,
    pub jwt: JwtConfig,
    pub redis: RedisConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub sharding: ShardingConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub tasks: TaskConfig,
    #[serde(default)]
    pub tenants: TenantEndpoints,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub issuer: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
    /// Pub/sub channel carrying business-config invalidation messages.
    #[serde(default = "default_invalidation_channel")]
    pub config_invalidation_channel: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// One DSN per database shard, index = db shard suffix.
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u32,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            urls: Vec::new(),
            pool_size: default_pool_size(),
            connect_timeout_seconds: default_connect_timeout(),
            idle_timeout_seconds: default_idle_timeout(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Postgres,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_backend")]
    pub backend: StorageBackend,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ShardingConfig {
    #[serde(default = "default_db_prefix")]
    pub db_prefix: String,
    #[serde(default = "default_table_prefix")]
    pub table_prefix: String,
    #[serde(default = "default_db_count")]
    pub db_count: u32,
    #[serde(default = "default_table_count")]
    pub table_count: u32,
}

impl Default for ShardingConfig {
    fn default() -> Self {
        Self {
            db_prefix: default_db_prefix(),
            table_prefix: default_table_prefix(),
            db_count: default_db_count(),
            table_count: default_table_count(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Initial scan batch size per shard loop.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_min_batch_size")]
    pub min_batch_size: usize,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_adjust_step")]
    pub adjust_step: usize,
    /// Minimum interval between two batch-size adjustments, milliseconds.
    #[serde(default = "default_adjust_cooldown_ms")]
    pub adjust_cooldown_ms: u64,
    /// Response-time history kept by the ring-buffer adjuster.
    #[serde(default = "default_response_buffer_size")]
    pub response_buffer_size: usize,
    /// Lower bound on one empty scheduler iteration, milliseconds.
    #[serde(default = "default_min_loop_ms")]
    pub min_loop_ms: u64,
    /// Cap on concurrently owned shards in this process. Mutable at runtime;
    /// lowering it never preempts already-owned shards.
    #[serde(default = "default_max_locked_shards")]
    pub max_locked_shards: usize,
    /// Bit-ring window length for the per-shard failure detector.
    #[serde(default = "default_error_window")]
    pub error_window: usize,
    #[serde(default = "default_error_threshold")]
    pub error_threshold: f64,
    #[serde(default = "default_error_consecutive")]
    pub error_consecutive: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            min_batch_size: default_min_batch_size(),
            max_batch_size: default_max_batch_size(),
            adjust_step: default_adjust_step(),
            adjust_cooldown_ms: default_adjust_cooldown_ms(),
            response_buffer_size: default_response_buffer_size(),
            min_loop_ms: default_min_loop_ms(),
            max_locked_shards: default_max_locked_shards(),
            error_window: default_error_window(),
            error_threshold: default_error_threshold(),
            error_consecutive: default_error_consecutive(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaskConfig {
    #[serde(default = "default_tx_check_batch")]
    pub tx_check_batch: usize,
    #[serde(default = "default_callback_batch")]
    pub callback_batch: usize,
    #[serde(default = "default_timeout_batch")]
    pub timeout_batch: usize,
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            tx_check_batch: default_tx_check_batch(),
            callback_batch: default_callback_batch(),
            timeout_batch: default_timeout_batch(),
        }
    }
}

/// Service-name to base-URL mapping used to reach tenant callback and
/// transaction-check services. Stands in for a discovery registry.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TenantEndpoints {
    #[serde(default)]
    pub endpoints: HashMap<String, String>,
}

impl TenantEndpoints {
    pub fn resolve(&self, service_name: &str) -> Option<&str> {
        self.endpoints.get(service_name).map(String::as_str)
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8090
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_invalidation_channel() -> String {
    "notifyd:config:invalidate".to_string()
}

fn default_pool_size() -> u32 {
    10
}

fn default_connect_timeout() -> u32 {
    5
}

fn default_idle_timeout() -> u32 {
    300
}

fn default_storage_backend() -> StorageBackend {
    StorageBackend::Memory
}

fn default_db_prefix() -> String {
    "notification".to_string()
}

fn default_table_prefix() -> String {
    "notifications".to_string()
}

fn default_db_count() -> u32 {
    2
}

fn default_table_count() -> u32 {
    4
}

fn default_batch_size() -> usize {
    32
}

fn default_min_batch_size() -> usize {
    8
}

fn default_max_batch_size() -> usize {
    256
}

fn default_adjust_step() -> usize {
    8
}

fn default_adjust_cooldown_ms() -> u64 {
    10_000
}

fn default_response_buffer_size() -> usize {
    128
}

fn default_min_loop_ms() -> u64 {
    1_000
}

fn default_max_locked_shards() -> usize {
    4
}

fn default_error_window() -> usize {
    128
}

fn default_error_threshold() -> f64 {
    0.5
}

fn default_error_consecutive() -> usize {
    3
}

fn default_tx_check_batch() -> usize {
    10
}

fn default_callback_batch() -> usize {
    10
}

fn default_timeout_batch() -> usize {
    10
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            // Start with default values
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8090)?
            .set_default("redis.url", "redis://localhost:6379")?
            .set_default("jwt.secret", "dev-secret")?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Load from environment variables
            // SERVER_HOST, SERVER_PORT, JWT_SECRET, REDIS_URL, etc.
            .add_source(
                Environment::default()
                    .separator("_")
                    .try_parsing(true)
                    .list_separator(","),
            );

        builder.build()?.try_deserialize()
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
