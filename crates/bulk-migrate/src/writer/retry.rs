//! Retry policy for batch writes.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::RetryIf;

use crate::config::WriterConfig;
use crate::core::Batch;
use crate::error::WriteError;
use crate::target::MutationWriter;

/// Bounded exponential backoff for one batch.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &WriterConfig) -> Self {
        Self {
            max_attempts: config.retry_limit.max(1),
            initial_delay: Duration::from_millis(config.retry_initial_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
        }
    }

    /// Delays between attempts: initial, 2x, 4x, ... capped at `max_delay`.
    ///
    /// `ExponentialBackoff::from_millis(2)` yields 2, 4, 8, ... times its
    /// factor; halving each step makes the first delay exactly `initial_delay`.
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        let initial_ms = self.initial_delay.as_millis() as u64;
        let max_delay = self.max_delay;
        ExponentialBackoff::from_millis(2)
            .factor(initial_ms)
            .map(move |d| (d / 2).min(max_delay))
            .take(self.max_attempts.saturating_sub(1) as usize)
    }
}

/// Outcome of writing one batch under the policy.
#[derive(Debug)]
pub struct WriteOutcome {
    pub attempts: u32,
    pub result: Result<(), WriteError>,
}

/// Write `batch`, retrying transient failures per `policy`.
///
/// Permanent failures stop immediately.
pub async fn write_with_retry(
    writer: &dyn MutationWriter,
    batch: &Batch,
    policy: &RetryPolicy,
) -> WriteOutcome {
    let attempts = AtomicU32::new(0);
    let counter = &attempts;

    let result = RetryIf::spawn(
        policy.delays(),
        move || {
            counter.fetch_add(1, Ordering::Relaxed);
            writer.write(batch)
        },
        |e: &WriteError| e.is_transient(),
    )
    .await;

    WriteOutcome {
        attempts: attempts.load(Ordering::Relaxed),
        result,
    }
}
