use config::{Config, ConfigError, Environment};
use serde::{Deserialize, Serialize};

/// Environment-supplied service configuration (prefix `CONVEYOR_`).
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServiceConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    // Broker configuration
    /// NATS server URL
    #[serde(default = "default_nats_url")]
    pub nats_url: String,

    /// JetStream stream holding sale-order events
    #[serde(default = "default_orders_stream")]
    pub orders_stream: String,

    /// Subject prefix; partition N consumes `<prefix>.N`
    #[serde(default = "default_orders_subject_prefix")]
    pub orders_subject_prefix: String,

    /// Durable consumer name prefix, one consumer per partition
    #[serde(default = "default_consumer_prefix")]
    pub consumer_prefix: String,

    /// Number of partitions, each driven by its own coordinator
    #[serde(default = "default_partitions")]
    pub partitions: u32,

    /// Most messages pulled per poll
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Max wait for a poll to fill in seconds
    #[serde(default = "default_poll_wait_secs")]
    pub poll_wait_secs: u64,

    /// Startup timeout for initial connections in seconds
    #[serde(default = "default_startup_timeout_secs")]
    pub startup_timeout_secs: u64,

    // Retry configuration
    /// Transient-failure retries allowed per batch
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,

    /// Backoff base delay in milliseconds
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Backoff multiplier per attempt
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,

    /// Backoff delay cap in milliseconds
    #[serde(default = "default_backoff_cap_ms")]
    pub backoff_cap_ms: u64,

    /// Backoff jitter fraction (0.2 = ±20%)
    #[serde(default = "default_backoff_jitter")]
    pub backoff_jitter: f64,

    // Document store (PostgreSQL) configuration
    #[serde(default = "default_postgres_host")]
    pub postgres_host: String,

    #[serde(default = "default_postgres_port")]
    pub postgres_port: u16,

    #[serde(default = "default_postgres_database")]
    pub postgres_database: String,

    #[serde(default = "default_postgres_username")]
    pub postgres_username: String,

    #[serde(default = "default_postgres_password")]
    pub postgres_password: String,

    #[serde(default = "default_postgres_pool_size")]
    pub postgres_pool_size: usize,

    /// Upsert target table
    #[serde(default = "default_orders_table")]
    pub orders_table: String,

    // Warehouse (ClickHouse) configuration
    #[serde(default = "default_clickhouse_url")]
    pub clickhouse_url: String,

    #[serde(default = "default_clickhouse_database")]
    pub clickhouse_database: String,

    #[serde(default = "default_clickhouse_username")]
    pub clickhouse_username: String,

    #[serde(default = "default_clickhouse_password")]
    pub clickhouse_password: String,

    /// Append-only audit table for processing outcomes
    #[serde(default = "default_outcomes_table")]
    pub outcomes_table: String,

    /// Bounded buffer between coordinators and the warehouse flusher
    #[serde(default = "default_mirror_buffer_capacity")]
    pub mirror_buffer_capacity: usize,

    /// Flush interval for buffered outcomes in milliseconds
    #[serde(default = "default_mirror_flush_interval_ms")]
    pub mirror_flush_interval_ms: u64,

    /// Flush as soon as this many outcomes are buffered
    #[serde(default = "default_mirror_flush_max_batch")]
    pub mirror_flush_max_batch: usize,
}

fn default_log_level() -> String {
    "info".to_string()
}

// Broker defaults
fn default_nats_url() -> String {
    "nats://localhost:4222".to_string()
}

fn default_orders_stream() -> String {
    "SALE_ORDERS".to_string()
}

fn default_orders_subject_prefix() -> String {
    "orders.events".to_string()
}

fn default_consumer_prefix() -> String {
    "conveyor".to_string()
}

fn default_partitions() -> u32 {
    1
}

fn default_batch_size() -> usize {
    64
}

fn default_poll_wait_secs() -> u64 {
    5
}

fn default_startup_timeout_secs() -> u64 {
    30
}

// Retry defaults; tune freely, nothing downstream depends on them
fn default_retry_budget() -> u32 {
    5
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_backoff_factor() -> f64 {
    2.0
}

fn default_backoff_cap_ms() -> u64 {
    60_000
}

fn default_backoff_jitter() -> f64 {
    0.2
}

// PostgreSQL defaults
fn default_postgres_host() -> String {
    "localhost".to_string()
}

fn default_postgres_port() -> u16 {
    5432
}

fn default_postgres_database() -> String {
    "conveyor".to_string()
}

fn default_postgres_username() -> String {
    "conveyor".to_string()
}

fn default_postgres_password() -> String {
    "conveyor".to_string()
}

fn default_postgres_pool_size() -> usize {
    5
}

fn default_orders_table() -> String {
    "sale_orders".to_string()
}

// ClickHouse defaults
fn default_clickhouse_url() -> String {
    "http://localhost:8123".to_string()
}

fn default_clickhouse_database() -> String {
    "conveyor".to_string()
}

fn default_clickhouse_username() -> String {
    "conveyor".to_string()
}

fn default_clickhouse_password() -> String {
    "conveyor".to_string()
}

fn default_outcomes_table() -> String {
    "processing_outcomes".to_string()
}

fn default_mirror_buffer_capacity() -> usize {
    1024
}

fn default_mirror_flush_interval_ms() -> u64 {
    1000
}

fn default_mirror_flush_max_batch() -> usize {
    500
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(Environment::with_prefix("CONVEYOR"))
            .build()?
            .try_deserialize()
    }
}
