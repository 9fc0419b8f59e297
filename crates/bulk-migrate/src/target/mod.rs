//! Target database abstractions.

mod postgres;

pub(crate) use postgres::build_pool;
pub use postgres::{PgMutationWriter, MAX_ROWS_PER_STATEMENT};

use crate::core::Batch;
use crate::error::WriteError;
use async_trait::async_trait;

/// Applies one batch of mutations to the target store.
///
/// Implementations must be safe to call from several write workers at once.
/// A successful return means every mutation in the batch is durable; errors
/// are classified so the retry policy knows whether another attempt can help.
#[async_trait]
pub trait MutationWriter: Send + Sync {
    /// Write every mutation in `batch`, all or nothing.
    async fn write(&self, batch: &Batch) -> Result<(), WriteError>;

    /// Short name used in log messages.
    fn name(&self) -> &str;
}
