//! Bounded fan-out over a list of independent work items.
//!
//! [`run_parallel_tasks`] applies an async worker to every item with at most
//! `concurrency` invocations in flight and returns the results in input order.
//! A panic inside one invocation is captured as that item's error instead of
//! tearing down the pool.
//!
//! With `continue_on_error == false` the first failing item stops dispatch:
//! invocations already running finish, nothing new starts, and the run
//! reports that first failure.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};

use futures::FutureExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::MigrateError;

/// Mutual-exclusion handle shared by every invocation of one run.
///
/// Workers whose collaborator is not safe for concurrent use lock it around
/// the critical section.
pub type SharedGuard = Arc<Mutex<()>>;

/// Outcome of one worker invocation. Either field, both, or neither may be set.
#[derive(Debug)]
pub struct TaskResult<O> {
    pub result: Option<O>,
    pub err: Option<MigrateError>,
}

impl<O> TaskResult<O> {
    pub fn ok(result: O) -> Self {
        Self {
            result: Some(result),
            err: None,
        }
    }

    pub fn err(err: MigrateError) -> Self {
        Self {
            result: None,
            err: Some(err),
        }
    }

    /// A partial result that still counts as a failure.
    pub fn partial(result: O, err: MigrateError) -> Self {
        Self {
            result: Some(result),
            err: Some(err),
        }
    }

    pub fn is_err(&self) -> bool {
        self.err.is_some()
    }
}

/// Results of a whole run.
#[derive(Debug)]
pub struct TaskRunOutcome<O> {
    /// One slot per input item, in input order. `None` marks an item that was
    /// never dispatched because a fail-fast run stopped early.
    pub results: Vec<Option<TaskResult<O>>>,

    /// First failure observed, reported only for fail-fast runs.
    pub error: Option<MigrateError>,
}

impl<O> TaskRunOutcome<O> {
    fn empty() -> Self {
        Self {
            results: Vec::new(),
            error: None,
        }
    }

    /// Number of items whose invocation reported an error.
    pub fn failed(&self) -> usize {
        self.results
            .iter()
            .flatten()
            .filter(|r| r.is_err())
            .count()
    }

    /// Number of items never dispatched.
    pub fn skipped(&self) -> usize {
        self.results.iter().filter(|r| r.is_none()).count()
    }
}

/// Apply `worker` to every item with bounded parallelism.
///
/// `concurrency` is clamped to `[1, items.len()]`. Every pool task is joined
/// before this returns.
pub async fn run_parallel_tasks<I, O, F, Fut>(
    items: Vec<I>,
    concurrency: usize,
    worker: F,
    continue_on_error: bool,
) -> TaskRunOutcome<O>
where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(I, SharedGuard) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TaskResult<O>> + Send + 'static,
{
    let total = items.len();
    if total == 0 {
        return TaskRunOutcome::empty();
    }

    let concurrency = concurrency.clamp(1, total);
    debug!("Running {} tasks with concurrency {}", total, concurrency);

    // Every item is queued up front, so the channel never blocks the feeder
    let (item_tx, item_rx) = async_channel::bounded::<(usize, I)>(total);
    for pair in items.into_iter().enumerate() {
        if item_tx.try_send(pair).is_err() {
            break;
        }
    }
    item_tx.close();

    // Results leave the pool task as soon as they exist, so a pool task that
    // dies later cannot take finished slots with it
    let (done_tx, done_rx) = async_channel::unbounded::<(usize, TaskResult<O>)>();

    let worker = Arc::new(worker);
    let guard: SharedGuard = Arc::new(Mutex::new(()));
    let stop = CancellationToken::new();
    let first_error: Arc<OnceLock<MigrateError>> = Arc::new(OnceLock::new());

    let mut handles = Vec::with_capacity(concurrency);
    for _ in 0..concurrency {
        let item_rx = item_rx.clone();
        let done_tx = done_tx.clone();
        let worker = worker.clone();
        let guard = guard.clone();
        let stop = stop.clone();
        let first_error = first_error.clone();

        handles.push(tokio::spawn(async move {
            loop {
                if stop.is_cancelled() {
                    break;
                }
                let (index, item) = match item_rx.recv().await {
                    Ok(pair) => pair,
                    Err(_) => break,
                };
                // Another worker may have failed while this one waited on the queue
                if stop.is_cancelled() {
                    break;
                }

                let task_result = invoke(&*worker, index, item, guard.clone()).await;

                if let Some(e) = &task_result.err {
                    if !continue_on_error {
                        let _ = first_error.set(MigrateError::TaskFailed {
                            index,
                            message: e.to_string(),
                        });
                        stop.cancel();
                    }
                }

                if done_tx.send((index, task_result)).await.is_err() {
                    break;
                }
            }
        }));
    }
    drop(item_rx);
    drop(done_tx);

    for handle in handles {
        if let Err(e) = handle.await {
            warn!("Task pool worker ended abnormally: {}", e);
        }
    }

    let mut results: Vec<Option<TaskResult<O>>> = (0..total).map(|_| None).collect();
    while let Ok((index, r)) = done_rx.try_recv() {
        results[index] = Some(r);
    }

    let error = if continue_on_error {
        None
    } else {
        Arc::try_unwrap(first_error)
            .ok()
            .and_then(OnceLock::into_inner)
    };

    if let Some(e) = &error {
        debug!("Task run stopped early: {}", e);
    }

    TaskRunOutcome { results, error }
}

/// Run one invocation, turning a panic in either the worker call or the
/// future it returns into that item's error.
async fn invoke<I, O, F, Fut>(
    worker: &F,
    index: usize,
    item: I,
    guard: SharedGuard,
) -> TaskResult<O>
where
    F: Fn(I, SharedGuard) -> Fut,
    Fut: Future<Output = TaskResult<O>>,
{
    let caught = match std::panic::catch_unwind(AssertUnwindSafe(|| worker(item, guard))) {
        Ok(invocation) => AssertUnwindSafe(invocation).catch_unwind().await,
        Err(payload) => Err(payload),
    };

    caught.unwrap_or_else(|payload| {
        let message = panic_message(payload.as_ref());
        error!("Task {} panicked: {}", index, message);
        TaskResult::err(MigrateError::TaskPanicked { index, message })
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
