//! Fixed-size pool of write workers draining sealed batches.

use std::sync::Arc;
use std::time::Instant;

use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::core::{Batch, BatchStatus};
use crate::error::{MigrateError, Result};
use crate::target::MutationWriter;

use super::retry::{write_with_retry, RetryPolicy};
use super::stats::SharedStats;

/// Per-worker settings copied into each task.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WorkerSettings {
    pub policy: RetryPolicy,
    pub verbose: bool,
}

/// Workers consume sealed batches from a bounded channel, so `submit`
/// blocks once `queue_depth` batches are waiting.
pub(crate) struct WritePool {
    write_tx: async_channel::Sender<Batch>,
    handles: Vec<JoinHandle<()>>,
    stats: SharedStats,
}

impl WritePool {
    /// Spawn `workers` tasks on the current tokio runtime.
    pub fn spawn(
        writer: Arc<dyn MutationWriter>,
        workers: usize,
        queue_depth: usize,
        settings: WorkerSettings,
        stats: SharedStats,
    ) -> Self {
        let (write_tx, write_rx) = async_channel::bounded::<Batch>(queue_depth.max(1));
        let mut handles = Vec::with_capacity(workers);

        for worker_id in 0..workers.max(1) {
            let write_rx = write_rx.clone();
            let writer = writer.clone();
            let stats = stats.clone();

            let handle = tokio::spawn(async move {
                run_worker(worker_id, writer, write_rx, settings, stats).await;
            });
            handles.push(handle);
        }

        // Drop our copy of write_rx so the channel closes when all workers are gone
        drop(write_rx);

        Self {
            write_tx,
            handles,
            stats,
        }
    }

    /// Hand a sealed batch to the workers, waiting for queue space.
    pub async fn submit(&self, mut batch: Batch) -> Result<()> {
        let rows = batch.row_count();
        batch.mark(BatchStatus::Submitted);

        if self.write_tx.send(batch).await.is_err() {
            // Every worker has exited, which only happens after panics
            return Err(MigrateError::pool(
                "all write workers have stopped",
                "submitting sealed batch",
            ));
        }

        self.stats.lock().await.record_accepted(rows);
        Ok(())
    }

    /// Close the queue and wait for every worker to finish its remaining batches.
    pub async fn shutdown(self) -> Result<()> {
        self.write_tx.close();

        let mut first_failure = None;
        for (worker_id, handle) in self.handles.into_iter().enumerate() {
            if let Err(e) = handle.await {
                error!("Write worker {} did not shut down cleanly: {}", worker_id, e);
                if first_failure.is_none() {
                    first_failure = Some(MigrateError::WorkerPanicked {
                        worker_id,
                        message: e.to_string(),
                    });
                }
            }
        }

        match first_failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

async fn run_worker(
    worker_id: usize,
    writer: Arc<dyn MutationWriter>,
    write_rx: async_channel::Receiver<Batch>,
    settings: WorkerSettings,
    stats: SharedStats,
) {
    let mut local_rows = 0usize;

    while let Ok(mut batch) = write_rx.recv().await {
        let write_start = Instant::now();
        let rows = batch.row_count();

        let outcome = write_with_retry(writer.as_ref(), &batch, &settings.policy).await;

        match outcome.result {
            Ok(()) => {
                batch.mark(BatchStatus::Committed);
                stats.lock().await.record_committed(rows);
                local_rows += rows;

                if settings.verbose {
                    info!(
                        "Writer {}: batch {} {} ({} rows, {} bytes, {} attempt(s), {:?})",
                        worker_id,
                        batch.id(),
                        batch.status(),
                        rows,
                        batch.size_bytes(),
                        outcome.attempts,
                        write_start.elapsed()
                    );
                } else {
                    debug!(
                        "Writer {}: committed batch {} with {} rows (local total: {})",
                        worker_id,
                        batch.id(),
                        rows,
                        local_rows
                    );
                }
            }
            Err(e) => {
                batch.mark(BatchStatus::Dropped);
                let message = e.to_string();
                warn!(
                    "Writer {}: batch {} {} after {} attempt(s) via {}, {} rows lost: {}",
                    worker_id,
                    batch.id(),
                    batch.status(),
                    outcome.attempts,
                    writer.name(),
                    rows,
                    message
                );
                stats
                    .lock()
                    .await
                    .record_dropped(batch.rows_by_table(), &message);
            }
        }
    }

    debug!(
        "Writer {}: queue closed, exiting after {} committed rows",
        worker_id, local_rows
    );
}
