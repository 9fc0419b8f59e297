//! Batch accumulation with size and row-count ceilings.

use tracing::warn;

use crate::core::{Batch, Mutation};

/// Buffers mutations into the currently open batch and seals it when the
/// next mutation would cross the byte limit or the row ceiling.
///
/// Batch ids are assigned at seal time, so they follow seal order.
#[derive(Debug)]
pub struct Accumulator {
    bytes_limit: usize,
    max_rows: usize,
    next_id: u64,
    open: Batch,
}

impl Accumulator {
    pub fn new(bytes_limit: usize, max_rows: usize) -> Self {
        Self {
            bytes_limit: bytes_limit.max(1),
            max_rows: max_rows.max(1),
            next_id: 1,
            open: Batch::new(0),
        }
    }

    /// Append a mutation, returning any batches sealed as a result, in seal order.
    ///
    /// An oversized mutation seals the open batch first and is then sealed
    /// alone, so at most two batches come back.
    pub fn push(&mut self, mutation: Mutation) -> Vec<Batch> {
        let size = mutation.estimated_size();
        let mut sealed = Vec::new();

        if size > self.bytes_limit {
            warn!(
                "Row for {} is {} bytes, over the {} byte batch limit; writing it alone",
                mutation.table(),
                size,
                self.bytes_limit
            );
            sealed.extend(self.flush());
            let mut single = Batch::new(0);
            single.push(mutation, size);
            sealed.push(self.seal(single));
            return sealed;
        }

        let would_overflow = self.open.size_bytes() + size > self.bytes_limit;
        let at_ceiling = self.open.row_count() >= self.max_rows;
        if !self.open.is_empty() && (would_overflow || at_ceiling) {
            sealed.extend(self.flush());
        }

        self.open.push(mutation, size);
        sealed
    }

    /// Seal the open batch. Returns `None` when it holds no rows.
    pub fn flush(&mut self) -> Option<Batch> {
        if self.open.is_empty() {
            return None;
        }
        let batch = std::mem::replace(&mut self.open, Batch::new(0));
        Some(self.seal(batch))
    }

    /// Rows waiting in the open batch.
    pub fn pending_rows(&self) -> usize {
        self.open.row_count()
    }

    fn seal(&mut self, mut batch: Batch) -> Batch {
        batch.seal(self.next_id);
        self.next_id += 1;
        batch
    }
}
