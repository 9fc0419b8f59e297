//! # bulk-migrate
//!
//! Concurrent batch-write and bounded fan-out engine for database migrations.
//!
//! Every migration path funnels through two pieces:
//!
//! - **[`BatchWriter`]** turns a stream of logical rows into size- and
//!   count-bounded batches and writes them through a fixed pool of workers,
//!   retrying transient failures and accounting for every dropped row
//! - **[`run_parallel_tasks`]** applies an async worker to many independent
//!   items with bounded parallelism, collecting per-item results in input order
//!
//! Around them sit a PostgreSQL target ([`PgMutationWriter`]), a CSV row
//! producer ([`source::load_csv`]) and an expression verifier
//! ([`verify::verify_expressions`]) built on the task runner.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use bulk_migrate::{BatchWriter, Config, PgMutationWriter, SqlValue};
//!
//! #[tokio::main]
//! async fn main() -> bulk_migrate::Result<()> {
//!     let config = Config::load("config.yaml")?.with_auto_tuning();
//!     let workers = config.writer.get_write_limit();
//!     let target = PgMutationWriter::connect(&config.target, config.target.pool_size(workers)).await?;
//!
//!     let mut writer = BatchWriter::new(config.writer.clone(), Arc::new(target))?;
//!     writer.add_row("users", vec!["id".into()], vec![SqlValue::I64(1)]).await?;
//!     let stats = writer.drain().await?;
//!     println!("Committed {} rows", stats.committed);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod source;
pub mod target;
pub mod task;
pub mod verify;
pub mod writer;

// Re-exports for convenient access
pub use config::{Config, TargetConfig, VerifyConfig, WriterConfig};
pub use crate::core::{Batch, BatchStatus, Mutation, SqlNullType, SqlValue};
pub use error::{MigrateError, Result, WriteError};
pub use target::{MutationWriter, PgMutationWriter};
pub use task::{run_parallel_tasks, SharedGuard, TaskResult, TaskRunOutcome};
pub use writer::{BatchWriter, RowSink, RowStats};
