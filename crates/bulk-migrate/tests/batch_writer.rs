//! End-to-end tests for the batch writer against in-memory targets.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use bulk_migrate::{
    Batch, BatchWriter, MigrateError, MutationWriter, SqlValue, WriteError, WriterConfig,
};

/// "t" + "id" + "payload" + 8 bytes of I64 + 182 bytes of text = 200 bytes.
fn row_200(id: i64) -> (Vec<String>, Vec<SqlValue>) {
    (
        vec!["id".to_string(), "payload".to_string()],
        vec![SqlValue::I64(id), SqlValue::Text("p".repeat(182))],
    )
}

fn first_id(batch: &Batch) -> i64 {
    match batch.mutations()[0].values()[0] {
        SqlValue::I64(id) => id,
        _ => -1,
    }
}

fn fast_config() -> WriterConfig {
    WriterConfig::default()
        .bytes_limit(1_000_000)
        .write_limit(4)
        .retry_delays(0, 0)
}

/// Records committed rows and fails batches according to a rule.
struct ScriptedTarget {
    attempts_by_batch: Mutex<Vec<(i64, usize)>>,
    committed_ids: Mutex<BTreeSet<i64>>,
    rule: Box<dyn Fn(&Batch, usize) -> Result<(), WriteError> + Send + Sync>,
}

impl ScriptedTarget {
    fn new(rule: impl Fn(&Batch, usize) -> Result<(), WriteError> + Send + Sync + 'static) -> Self {
        Self {
            attempts_by_batch: Mutex::new(Vec::new()),
            committed_ids: Mutex::new(BTreeSet::new()),
            rule: Box::new(rule),
        }
    }

    fn always_ok() -> Self {
        Self::new(|_, _| Ok(()))
    }

    fn attempts_for(&self, first: i64) -> usize {
        self.attempts_by_batch
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| *id == first)
            .count()
    }

    fn batch_count(&self) -> usize {
        let attempts = self.attempts_by_batch.lock().unwrap();
        attempts.iter().map(|(id, _)| *id).collect::<BTreeSet<_>>().len()
    }
}

#[async_trait]
impl MutationWriter for ScriptedTarget {
    async fn write(&self, batch: &Batch) -> Result<(), WriteError> {
        let first = first_id(batch);
        let attempt = {
            let mut attempts = self.attempts_by_batch.lock().unwrap();
            attempts.push((first, batch.row_count()));
            attempts.iter().filter(|(id, _)| *id == first).count()
        };

        (self.rule)(batch, attempt)?;

        let mut committed = self.committed_ids.lock().unwrap();
        for m in batch.mutations() {
            if let SqlValue::I64(id) = m.values()[0] {
                committed.insert(id);
            }
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ten_thousand_rows_make_two_full_batches() {
    let target = Arc::new(ScriptedTarget::always_ok());
    let mut writer = BatchWriter::new(fast_config(), target.clone()).unwrap();

    for id in 0..10_000 {
        let (columns, values) = row_200(id);
        writer.add_row("t", columns, values).await.unwrap();
    }
    let stats = writer.drain().await.unwrap();

    assert_eq!(target.batch_count(), 2);
    let sizes: Vec<usize> = target
        .attempts_by_batch
        .lock()
        .unwrap()
        .iter()
        .map(|(_, rows)| *rows)
        .collect();
    assert_eq!(sizes, vec![5_000, 5_000]);

    assert_eq!(stats.accepted, 10_000);
    assert_eq!(stats.committed, 10_000);
    assert_eq!(stats.total_dropped(), 0);
    assert_eq!(stats.batches_committed, 2);
    assert!(stats.is_balanced());
    assert_eq!(target.committed_ids.lock().unwrap().len(), 10_000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_failing_batch_is_dropped_after_retry_limit() {
    // Second batch starts at id 5000 and never succeeds
    let target = Arc::new(ScriptedTarget::new(|batch, _attempt| {
        if first_id(batch) == 5_000 {
            Err(WriteError::transient("connection reset"))
        } else {
            Ok(())
        }
    }));
    let config = fast_config().retry_limit(3);
    let mut writer = BatchWriter::new(config, target.clone()).unwrap();

    for id in 0..10_000 {
        let (columns, values) = row_200(id);
        writer.add_row("t", columns, values).await.unwrap();
    }
    let stats = writer.drain().await.unwrap();

    assert_eq!(target.attempts_for(5_000), 3);
    assert_eq!(target.attempts_for(0), 1);
    assert_eq!(stats.committed, 5_000);
    assert_eq!(stats.dropped_rows_by_table().get("t"), Some(&5_000));
    assert_eq!(stats.batches_dropped, 1);
    assert!(stats.is_balanced());
    assert!(stats.last_errors["t"].contains("connection reset"));

    // Only the first batch's rows made it
    let committed = target.committed_ids.lock().unwrap();
    assert_eq!(committed.len(), 5_000);
    assert_eq!(committed.iter().next_back(), Some(&4_999));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_transient_failure_recovers_within_limit() {
    let target = Arc::new(ScriptedTarget::new(|_, attempt| {
        if attempt < 3 {
            Err(WriteError::transient("deadlock detected (40P01)"))
        } else {
            Ok(())
        }
    }));
    let config = fast_config().bytes_limit(1_000).retry_limit(5);
    let mut writer = BatchWriter::new(config, target.clone()).unwrap();

    for id in 0..20 {
        let (columns, values) = row_200(id);
        writer.add_row("t", columns, values).await.unwrap();
    }
    let stats = writer.drain().await.unwrap();

    // 5 rows of 200 bytes fill each 1000-byte batch
    assert_eq!(stats.batches_committed, 4);
    assert_eq!(stats.committed, 20);
    assert_eq!(stats.total_dropped(), 0);
    for first in [0, 5, 10, 15] {
        assert_eq!(target.attempts_for(first), 3);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_permanent_failure_is_not_retried() {
    let target = Arc::new(ScriptedTarget::new(|batch, _| {
        if first_id(batch) == 0 {
            Err(WriteError::permanent("null value in column \"id\" (23502)"))
        } else {
            Ok(())
        }
    }));
    let config = fast_config().bytes_limit(1_000).retry_limit(5);
    let mut writer = BatchWriter::new(config, target.clone()).unwrap();

    for id in 0..10 {
        let (columns, values) = row_200(id);
        writer.add_row("t", columns, values).await.unwrap();
    }
    let stats = writer.drain().await.unwrap();

    assert_eq!(target.attempts_for(0), 1);
    assert_eq!(stats.committed, 5);
    assert_eq!(stats.total_dropped(), 5);
    assert!(stats.is_balanced());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_drops_are_attributed_per_table() {
    let target = Arc::new(ScriptedTarget::new(|batch, _| {
        if batch.mutations().iter().any(|m| m.table() == "orders") {
            Err(WriteError::permanent("foreign key violation"))
        } else {
            Ok(())
        }
    }));
    let config = fast_config().bytes_limit(10_000).max_rows_per_batch(4);
    let mut writer = BatchWriter::new(config, target).unwrap();

    // Batches of four: [u0 u1 o2 o3] [u4 u5 u6 u7]
    for id in 0..8 {
        let table = if id == 2 || id == 3 { "orders" } else { "users" };
        writer
            .add_row(table, vec!["id".into()], vec![SqlValue::I64(id)])
            .await
            .unwrap();
    }
    let stats = writer.drain().await.unwrap();

    assert_eq!(stats.committed, 4);
    assert_eq!(stats.dropped_rows_by_table().get("users"), Some(&2));
    assert_eq!(stats.dropped_rows_by_table().get("orders"), Some(&2));
    assert!(stats.is_balanced());
    assert_eq!(stats.drop_summary().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_oversized_row_is_written_alone() {
    let target = Arc::new(ScriptedTarget::always_ok());
    let config = fast_config().bytes_limit(500);
    let mut writer = BatchWriter::new(config, target.clone()).unwrap();

    writer
        .add_row("t", vec!["id".into()], vec![SqlValue::I64(0)])
        .await
        .unwrap();
    writer
        .add_row(
            "t",
            vec!["id".into(), "blob".into()],
            vec![SqlValue::I64(1), SqlValue::Bytes(vec![0u8; 4_096])],
        )
        .await
        .unwrap();
    let stats = writer.drain().await.unwrap();

    assert_eq!(stats.batches_committed, 2);
    assert_eq!(stats.committed, 2);
    assert_eq!(target.attempts_for(1), 1);
}

/// Tracks how many writes run at once.
struct SlowTarget {
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

#[async_trait]
impl MutationWriter for SlowTarget {
    async fn write(&self, _batch: &Batch) -> Result<(), WriteError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &str {
        "slow"
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_write_limit_bounds_concurrency() {
    let target = Arc::new(SlowTarget {
        in_flight: AtomicUsize::new(0),
        max_in_flight: AtomicUsize::new(0),
    });
    let config = fast_config().bytes_limit(10_000).max_rows_per_batch(1).write_limit(3);
    let mut writer = BatchWriter::new(config, target.clone()).unwrap();

    for id in 0..30 {
        writer
            .add_row("t", vec!["id".into()], vec![SqlValue::I64(id)])
            .await
            .unwrap();
    }
    let stats = writer.drain().await.unwrap();

    assert_eq!(stats.batches_committed, 30);
    let max = target.max_in_flight.load(Ordering::SeqCst);
    assert!((1..=3).contains(&max), "max in flight was {}", max);
}

/// Holds every write until the gate is opened.
struct GatedTarget {
    gate: Semaphore,
    started: AtomicUsize,
}

#[async_trait]
impl MutationWriter for GatedTarget {
    async fn write(&self, _batch: &Batch) -> Result<(), WriteError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        let _permit = self.gate.acquire().await.unwrap();
        Ok(())
    }

    fn name(&self) -> &str {
        "gated"
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_add_row_waits_when_queue_is_full() {
    let target = Arc::new(GatedTarget {
        gate: Semaphore::new(0),
        started: AtomicUsize::new(0),
    });
    let config = fast_config()
        .write_limit(1)
        .queue_depth(1)
        .max_rows_per_batch(1);
    let mut writer = BatchWriter::new(config, target.clone()).unwrap();

    // The second row seals a batch for the stuck worker, the third fills the queue
    for id in 0..3 {
        writer
            .add_row("t", vec!["id".into()], vec![SqlValue::I64(id)])
            .await
            .unwrap();
    }

    {
        let blocked = writer.add_row("t", vec!["id".into()], vec![SqlValue::I64(3)]);
        tokio::pin!(blocked);

        let waited = tokio::time::timeout(Duration::from_millis(200), &mut blocked).await;
        assert!(waited.is_err(), "add_row returned while the queue was full");
        assert_eq!(target.started.load(Ordering::SeqCst), 1);

        target.gate.add_permits(1_000);
        tokio::time::timeout(Duration::from_secs(5), &mut blocked)
            .await
            .expect("add_row stayed blocked after the gate opened")
            .unwrap();
    }

    let stats = writer.drain().await.unwrap();
    assert_eq!(stats.committed, 4);
    assert_eq!(stats.batches_committed, 4);
    assert!(stats.is_balanced());
}

struct PanickingTarget;

#[async_trait]
impl MutationWriter for PanickingTarget {
    async fn write(&self, _batch: &Batch) -> Result<(), WriteError> {
        panic!("driver bug");
    }

    fn name(&self) -> &str {
        "panicking"
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_worker_panic_surfaces_on_drain() {
    let config = fast_config().write_limit(2);
    let mut writer = BatchWriter::new(config, Arc::new(PanickingTarget)).unwrap();

    writer
        .add_row("t", vec!["id".into()], vec![SqlValue::I64(1)])
        .await
        .unwrap();
    let err = writer.drain().await.unwrap_err();

    assert!(matches!(err, MigrateError::WorkerPanicked { .. }));
    assert!(writer.is_drained());
}

#[tokio::test]
async fn test_drain_with_no_rows() {
    let target = Arc::new(ScriptedTarget::always_ok());
    let mut writer = BatchWriter::new(fast_config(), target.clone()).unwrap();
    let stats = writer.drain().await.unwrap();

    assert_eq!(stats.accepted, 0);
    assert!(stats.is_balanced());
    assert_eq!(target.batch_count(), 0);
}
