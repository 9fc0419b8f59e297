//! Configuration type definitions with auto-tuning based on system resources.

use serde::{Deserialize, Serialize};
use sysinfo::System;
use tracing::info;

/// Default serialized-size ceiling of one batch (1 MB).
pub const DEFAULT_BYTES_LIMIT: usize = 1_000_000;

/// Default hard row ceiling per batch, kept under the target's per-transaction limit.
pub const DEFAULT_MAX_ROWS_PER_BATCH: usize = 20_000;

/// Default number of attempts per batch before it is dropped.
pub const DEFAULT_RETRY_LIMIT: u32 = 5;

/// Default fan-out for expression verification.
pub const DEFAULT_VERIFY_CONCURRENCY: usize = 500;

/// System resource information for auto-tuning.
#[derive(Debug, Clone)]
pub struct SystemResources {
    /// Total RAM in GB.
    pub total_memory_gb: f64,
    /// Number of CPU cores.
    pub cpu_cores: usize,
}

impl SystemResources {
    /// Detect system resources.
    pub fn detect() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();

        let total_memory_gb = sys.total_memory() as f64 / (1024.0 * 1024.0 * 1024.0);
        let cpu_cores = sys.cpus().len().max(1);

        Self {
            total_memory_gb,
            cpu_cores,
        }
    }

    /// Log detected system resources.
    pub fn log(&self) {
        info!(
            "System resources: {:.1} GB RAM, {} CPU cores",
            self.total_memory_gb, self.cpu_cores
        );
    }
}

/// Root configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Target database configuration.
    pub target: TargetConfig,

    /// Batch writer behavior.
    #[serde(default)]
    pub writer: WriterConfig,

    /// Expression verification behavior.
    #[serde(default)]
    pub verify: VerifyConfig,
}

impl Config {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that weren't explicitly set in the config file.
    pub fn with_auto_tuning(mut self) -> Self {
        let resources = SystemResources::detect();
        resources.log();
        self.writer = self.writer.with_auto_tuning(&resources);
        self
    }
}

/// Target database (PostgreSQL) configuration.
#[derive(Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Database host.
    pub host: String,

    /// Database port (default: 5432).
    #[serde(default = "default_pg_port")]
    pub port: u16,

    /// Database name.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// Target schema (default: "public").
    #[serde(default = "default_public_schema")]
    pub schema: String,

    /// Maximum pooled connections. Defaults to the writer's worker count plus one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<usize>,
}

impl std::fmt::Debug for TargetConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("schema", &self.schema)
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

/// Batch writer configuration.
/// Performance fields use Option<T> to distinguish between
/// "not set" (use auto-tuned default) and "explicitly set" (use provided value).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriterConfig {
    /// Serialized-size ceiling that seals a batch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bytes_limit: Option<usize>,

    /// Number of concurrent write workers. Auto-tuned based on CPU cores if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_limit: Option<usize>,

    /// Maximum write attempts per batch before it is dropped.
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,

    /// Delay before the first retry; doubles on each further retry.
    #[serde(default = "default_retry_initial_delay_ms")]
    pub retry_initial_delay_ms: u64,

    /// Upper bound on a single retry delay.
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,

    /// Hard row ceiling per batch.
    #[serde(default = "default_max_rows_per_batch")]
    pub max_rows_per_batch: usize,

    /// Sealed batches that may wait for a worker before producers block.
    /// Auto-tuned to twice the worker count if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_depth: Option<usize>,

    /// Log every batch at info level.
    #[serde(default)]
    pub verbose: bool,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            bytes_limit: None,
            write_limit: None,
            retry_limit: default_retry_limit(),
            retry_initial_delay_ms: default_retry_initial_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            max_rows_per_batch: default_max_rows_per_batch(),
            queue_depth: None,
            verbose: false,
        }
    }
}

impl WriterConfig {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that are None (not explicitly set).
    pub fn with_auto_tuning(mut self, resources: &SystemResources) -> Self {
        let cores = resources.cpu_cores;

        // Writers mostly wait on the network, so allow more than one per core
        if self.write_limit.is_none() {
            self.write_limit = Some((cores * 2).clamp(2, 32));
        }
        let writers = self.get_write_limit();

        if self.queue_depth.is_none() {
            self.queue_depth = Some(writers * 2);
        }

        // Larger batches when there is memory to hold write_limit * queue of them
        if self.bytes_limit.is_none() {
            let limit = if resources.total_memory_gb >= 16.0 {
                4 * DEFAULT_BYTES_LIMIT
            } else {
                DEFAULT_BYTES_LIMIT
            };
            self.bytes_limit = Some(limit);
        }

        info!(
            "Auto-tuned writer: write_limit={}, queue_depth={}, bytes_limit={}, retry_limit={}",
            self.get_write_limit(),
            self.get_queue_depth(),
            self.get_bytes_limit(),
            self.retry_limit,
        );

        self
    }

    pub fn get_bytes_limit(&self) -> usize {
        self.bytes_limit.unwrap_or(DEFAULT_BYTES_LIMIT)
    }

    pub fn get_write_limit(&self) -> usize {
        self.write_limit.unwrap_or(4)
    }

    pub fn get_queue_depth(&self) -> usize {
        self.queue_depth
            .unwrap_or_else(|| self.get_write_limit() * 2)
            .max(1)
    }

    /// Builder-style setters, handy for callers constructing configs in code.
    pub fn bytes_limit(mut self, limit: usize) -> Self {
        self.bytes_limit = Some(limit);
        self
    }

    pub fn write_limit(mut self, workers: usize) -> Self {
        self.write_limit = Some(workers);
        self
    }

    pub fn retry_limit(mut self, attempts: u32) -> Self {
        self.retry_limit = attempts;
        self
    }

    pub fn retry_delays(mut self, initial_ms: u64, max_ms: u64) -> Self {
        self.retry_initial_delay_ms = initial_ms;
        self.retry_max_delay_ms = max_ms;
        self
    }

    pub fn max_rows_per_batch(mut self, rows: usize) -> Self {
        self.max_rows_per_batch = rows;
        self
    }

    pub fn queue_depth(mut self, depth: usize) -> Self {
        self.queue_depth = Some(depth);
        self
    }
}

/// Expression verification configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyConfig {
    /// Maximum concurrent verification queries.
    #[serde(default = "default_verify_concurrency")]
    pub concurrency: usize,

    /// Keep verifying after an expression fails (default: true).
    #[serde(default = "default_true")]
    pub continue_on_error: bool,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            concurrency: default_verify_concurrency(),
            continue_on_error: true,
        }
    }
}

// Default value functions for serde
fn default_pg_port() -> u16 {
    5432
}

fn default_public_schema() -> String {
    "public".to_string()
}

fn default_retry_limit() -> u32 {
    DEFAULT_RETRY_LIMIT
}

fn default_retry_initial_delay_ms() -> u64 {
    100
}

fn default_retry_max_delay_ms() -> u64 {
    10_000
}

fn default_max_rows_per_batch() -> usize {
    DEFAULT_MAX_ROWS_PER_BATCH
}

fn default_verify_concurrency() -> usize {
    DEFAULT_VERIFY_CONCURRENCY
}

fn default_true() -> bool {
    true
}
