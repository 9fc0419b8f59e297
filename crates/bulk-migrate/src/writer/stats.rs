//! Row accounting shared by the write workers.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Row and batch counters for one write session.
///
/// After a drain, `committed + total_dropped() == accepted`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowStats {
    /// Rows handed to the worker pool.
    pub accepted: i64,

    /// Rows durably written.
    pub committed: i64,

    /// Rows permanently lost, by table.
    pub dropped: BTreeMap<String, i64>,

    pub batches_committed: u64,
    pub batches_dropped: u64,

    /// Last write error seen for each table with drops.
    pub last_errors: BTreeMap<String, String>,
}

impl RowStats {
    pub fn dropped_rows_by_table(&self) -> &BTreeMap<String, i64> {
        &self.dropped
    }

    pub fn total_dropped(&self) -> i64 {
        self.dropped.values().sum()
    }

    /// Every accepted row is either committed or recorded as dropped.
    pub fn is_balanced(&self) -> bool {
        self.committed + self.total_dropped() == self.accepted
    }

    /// One line per table with dropped rows, for the migration report.
    pub fn drop_summary(&self) -> Vec<String> {
        self.dropped
            .iter()
            .filter(|(_, rows)| **rows > 0)
            .map(|(table, rows)| match self.last_errors.get(table) {
                Some(err) => format!("{} rows dropped from table {} ({})", rows, table, err),
                None => format!("{} rows dropped from table {}", rows, table),
            })
            .collect()
    }

    pub(crate) fn record_accepted(&mut self, rows: usize) {
        self.accepted += rows as i64;
    }

    pub(crate) fn record_committed(&mut self, rows: usize) {
        self.committed += rows as i64;
        self.batches_committed += 1;
    }

    pub(crate) fn record_dropped(&mut self, rows_by_table: BTreeMap<String, i64>, error: &str) {
        for (table, rows) in rows_by_table {
            self.last_errors.insert(table.clone(), error.to_string());
            *self.dropped.entry(table).or_insert(0) += rows;
        }
        self.batches_dropped += 1;
    }
}

/// Handle to the stats the workers update under a lock.
pub(crate) type SharedStats = Arc<Mutex<RowStats>>;
