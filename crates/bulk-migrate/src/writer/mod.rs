//! Batch writer: turns a stream of rows into bounded write batches.
//!
//! Producers call [`BatchWriter::add_row`] once per logical row. Rows are
//! accumulated into batches bounded by a byte limit and a row ceiling; each
//! sealed batch is handed to a fixed pool of write workers that transmit it
//! through the injected [`MutationWriter`] while the producer keeps going.
//!
//! Transient write failures are retried with exponential backoff. A batch
//! that still fails (or fails permanently) is dropped and its rows are
//! recorded per table in [`RowStats`]; the pipeline keeps running.
//!
//! ```rust,no_run
//! # use std::sync::Arc;
//! # use bulk_migrate::{BatchWriter, SqlValue, WriterConfig, MutationWriter};
//! # async fn example(target: Arc<dyn MutationWriter>) -> bulk_migrate::Result<()> {
//! let mut writer = BatchWriter::new(WriterConfig::default(), target)?;
//! writer
//!     .add_row("users", vec!["id".into()], vec![SqlValue::I64(1)])
//!     .await?;
//! let stats = writer.drain().await?;
//! assert!(stats.is_balanced());
//! # Ok(())
//! # }
//! ```

mod accumulator;
mod pool;
mod retry;
mod stats;

pub use accumulator::Accumulator;
pub use retry::{write_with_retry, RetryPolicy, WriteOutcome};
pub use stats::RowStats;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::WriterConfig;
use crate::core::{Mutation, SqlValue};
use crate::error::{MigrateError, Result};
use crate::target::MutationWriter;

use pool::{WorkerSettings, WritePool};
use stats::SharedStats;

/// Capability handed to row producers: emit rows, flush at checkpoints.
#[async_trait]
pub trait RowSink: Send {
    /// Accept one logical row.
    async fn emit(&mut self, table: &str, columns: &[String], values: Vec<SqlValue>)
        -> Result<()>;

    /// Push any buffered rows towards the target.
    async fn flush(&mut self) -> Result<()>;
}

/// Facade over the accumulator and the write worker pool.
///
/// One writer serves exactly one write session: accept rows, [`drain`](Self::drain)
/// once, then read the returned statistics.
pub struct BatchWriter {
    accumulator: Accumulator,
    pool: Option<WritePool>,
    stats: SharedStats,
    target_name: String,
}

impl BatchWriter {
    /// Create a writer and start its workers. Must be called inside a tokio runtime.
    pub fn new(config: WriterConfig, writer: Arc<dyn MutationWriter>) -> Result<Self> {
        config.validate()?;

        let workers = config.get_write_limit();
        let queue_depth = config.get_queue_depth();
        let stats: SharedStats = Arc::new(Mutex::new(RowStats::default()));
        let settings = WorkerSettings {
            policy: RetryPolicy::from_config(&config),
            verbose: config.verbose,
        };
        let target_name = writer.name().to_string();

        info!(
            "Starting batch writer for {} (workers: {}, bytes_limit: {}, max_rows: {}, retry_limit: {})",
            target_name,
            workers,
            config.get_bytes_limit(),
            config.max_rows_per_batch,
            config.retry_limit
        );

        let pool = WritePool::spawn(writer, workers, queue_depth, settings, stats.clone());

        Ok(Self {
            accumulator: Accumulator::new(config.get_bytes_limit(), config.max_rows_per_batch),
            pool: Some(pool),
            stats,
            target_name,
        })
    }

    /// Add one row. May wait while the worker queue is full.
    pub async fn add_row(
        &mut self,
        table: impl Into<String>,
        columns: Vec<String>,
        values: Vec<SqlValue>,
    ) -> Result<()> {
        let mutation = Mutation::new(table, columns, values)?;
        self.add_mutation(mutation).await
    }

    /// Add an already-built mutation.
    pub async fn add_mutation(&mut self, mutation: Mutation) -> Result<()> {
        let pool = self.pool.as_ref().ok_or(MigrateError::WriterDrained)?;
        for batch in self.accumulator.push(mutation) {
            pool.submit(batch).await?;
        }
        Ok(())
    }

    /// Seal and submit the open batch, even if it is under the limits.
    pub async fn flush(&mut self) -> Result<()> {
        let pool = self.pool.as_ref().ok_or(MigrateError::WriterDrained)?;
        if let Some(batch) = self.accumulator.flush() {
            debug!(
                "Flushing partial batch {} ({} rows)",
                batch.id(),
                batch.row_count()
            );
            pool.submit(batch).await?;
        }
        Ok(())
    }

    /// Flush, wait for every submitted batch to commit or drop, and return the
    /// final statistics. The writer rejects all further rows afterwards.
    ///
    /// The session ends even when teardown fails: a dead worker is reported
    /// as [`MigrateError::WorkerPanicked`] ahead of any error submitting the
    /// final batch.
    pub async fn drain(&mut self) -> Result<RowStats> {
        let pool = self.pool.take().ok_or(MigrateError::WriterDrained)?;

        let submitted = match self.accumulator.flush() {
            Some(batch) => pool.submit(batch).await,
            None => Ok(()),
        };
        pool.shutdown().await?;
        submitted?;

        let stats = self.stats.lock().await.clone();
        if stats.total_dropped() > 0 {
            for line in stats.drop_summary() {
                warn!("{}", line);
            }
        }
        info!(
            "Batch writer for {} drained: {} accepted, {} committed, {} dropped ({} batches committed, {} dropped)",
            self.target_name,
            stats.accepted,
            stats.committed,
            stats.total_dropped(),
            stats.batches_committed,
            stats.batches_dropped
        );
        Ok(stats)
    }

    /// Whether [`drain`](Self::drain) has already run.
    pub fn is_drained(&self) -> bool {
        self.pool.is_none()
    }
}

#[async_trait]
impl RowSink for BatchWriter {
    async fn emit(
        &mut self,
        table: &str,
        columns: &[String],
        values: Vec<SqlValue>,
    ) -> Result<()> {
        self.add_row(table, columns.to_vec(), values).await
    }

    async fn flush(&mut self) -> Result<()> {
        BatchWriter::flush(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Batch;
    use crate::error::WriteError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingWriter {
        batches: AtomicUsize,
        rows: AtomicUsize,
    }

    #[async_trait]
    impl MutationWriter for CountingWriter {
        async fn write(&self, batch: &Batch) -> std::result::Result<(), WriteError> {
            self.batches.fetch_add(1, Ordering::SeqCst);
            self.rows.fetch_add(batch.row_count(), Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &str {
            "counting"
        }
    }

    fn config() -> WriterConfig {
        WriterConfig::default()
            .bytes_limit(1_000)
            .write_limit(2)
            .retry_delays(0, 0)
    }

    #[tokio::test]
    async fn test_flush_submits_partial_batch() {
        let target = Arc::new(CountingWriter::default());
        let mut writer = BatchWriter::new(config(), target.clone()).unwrap();

        writer
            .add_row("t", vec!["id".into()], vec![SqlValue::I64(1)])
            .await
            .unwrap();
        writer.flush().await.unwrap();
        // Flushing again with nothing open submits nothing
        writer.flush().await.unwrap();

        let stats = writer.drain().await.unwrap();
        assert_eq!(stats.accepted, 1);
        assert_eq!(target.batches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_drained_writer_rejects_rows() {
        let target = Arc::new(CountingWriter::default());
        let mut writer = BatchWriter::new(config(), target).unwrap();
        writer.drain().await.unwrap();

        assert!(writer.is_drained());
        let err = writer
            .add_row("t", vec!["id".into()], vec![SqlValue::I64(1)])
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::WriterDrained));
        assert!(matches!(
            writer.drain().await.unwrap_err(),
            MigrateError::WriterDrained
        ));
    }

    #[tokio::test]
    async fn test_row_shape_error_has_no_side_effect() {
        let target = Arc::new(CountingWriter::default());
        let mut writer = BatchWriter::new(config(), target.clone()).unwrap();

        let err = writer
            .add_row("t", vec!["id".into(), "name".into()], vec![SqlValue::I64(1)])
            .await
            .unwrap_err();
        assert!(matches!(err, MigrateError::RowShape { .. }));

        let stats = writer.drain().await.unwrap();
        assert_eq!(stats.accepted, 0);
        assert_eq!(target.rows.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_row_sink_emit() {
        let target = Arc::new(CountingWriter::default());
        let mut writer = BatchWriter::new(config(), target.clone()).unwrap();
        let columns = vec!["id".to_string()];

        {
            let sink: &mut dyn RowSink = &mut writer;
            for id in 0..10 {
                sink.emit("t", &columns, vec![SqlValue::I64(id)]).await.unwrap();
            }
            sink.flush().await.unwrap();
        }

        let stats = writer.drain().await.unwrap();
        assert_eq!(stats.committed, 10);
        assert_eq!(target.rows.load(Ordering::SeqCst), 10);
    }

    struct PanickingWriter;

    #[async_trait]
    impl MutationWriter for PanickingWriter {
        async fn write(&self, _batch: &Batch) -> std::result::Result<(), WriteError> {
            panic!("target driver crashed");
        }

        fn name(&self) -> &str {
            "panicking"
        }
    }

    #[tokio::test]
    async fn test_drain_ends_session_when_workers_died() {
        let config = config().write_limit(1).max_rows_per_batch(1);
        let mut writer = BatchWriter::new(config, Arc::new(PanickingWriter)).unwrap();

        for id in 0..5 {
            // Submitting may already fail once the only worker is gone
            let _ = writer
                .add_row("t", vec!["id".into()], vec![SqlValue::I64(id)])
                .await;
        }

        match writer.drain().await {
            Err(MigrateError::WorkerPanicked { worker_id, .. }) => assert_eq!(worker_id, 0),
            other => panic!("expected WorkerPanicked, got {:?}", other),
        }
        assert!(writer.is_drained());
        assert!(matches!(
            writer.drain().await.unwrap_err(),
            MigrateError::WriterDrained
        ));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let target = Arc::new(CountingWriter::default());
        let config = WriterConfig::default().retry_limit(0);
        // Validation fails before any worker is spawned, so no runtime is needed
        assert!(matches!(
            BatchWriter::new(config, target),
            Err(MigrateError::Config(_))
        ));
    }
}
