//! Row mutations and the batches that carry them to the target.

use std::collections::BTreeMap;

use crate::error::{MigrateError, Result};

use super::value::SqlValue;

/// One logical row write: target table, column names, column-aligned values.
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    table: String,
    columns: Vec<String>,
    values: Vec<SqlValue>,
}

impl Mutation {
    /// Build a mutation, rejecting rows whose column and value counts differ.
    pub fn new(
        table: impl Into<String>,
        columns: Vec<String>,
        values: Vec<SqlValue>,
    ) -> Result<Self> {
        let table = table.into();
        if columns.len() != values.len() {
            return Err(MigrateError::RowShape {
                table,
                columns: columns.len(),
                values: values.len(),
            });
        }
        Ok(Self {
            table,
            columns,
            values,
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn values(&self) -> &[SqlValue] {
        &self.values
    }

    /// Approximate serialized size: table name, column names and values.
    pub fn estimated_size(&self) -> usize {
        let names: usize = self.columns.iter().map(String::len).sum();
        let values: usize = self.values.iter().map(SqlValue::estimated_size).sum();
        self.table.len() + names + values
    }
}

/// Lifecycle of a batch, used in diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    Open,
    Sealed,
    Submitted,
    Committed,
    Dropped,
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BatchStatus::Open => "open",
            BatchStatus::Sealed => "sealed",
            BatchStatus::Submitted => "submitted",
            BatchStatus::Committed => "committed",
            BatchStatus::Dropped => "dropped",
        };
        f.write_str(s)
    }
}

/// A bounded, ordered group of mutations written in one call.
#[derive(Debug)]
pub struct Batch {
    id: u64,
    mutations: Vec<Mutation>,
    size_bytes: usize,
    status: BatchStatus,
}

impl Batch {
    /// Create an empty open batch.
    pub fn new(id: u64) -> Self {
        Self {
            id,
            mutations: Vec::new(),
            size_bytes: 0,
            status: BatchStatus::Open,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }

    /// Accumulated size estimate of all mutations.
    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    pub fn row_count(&self) -> usize {
        self.mutations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    pub fn status(&self) -> BatchStatus {
        self.status
    }

    /// Whether this batch exceeds `limit`; only a singleton batch can.
    pub fn is_oversized(&self, limit: usize) -> bool {
        self.size_bytes > limit
    }

    /// Row counts per target table, for drop attribution.
    pub fn rows_by_table(&self) -> BTreeMap<String, i64> {
        let mut counts = BTreeMap::new();
        for m in &self.mutations {
            *counts.entry(m.table().to_string()).or_insert(0) += 1;
        }
        counts
    }

    pub(crate) fn push(&mut self, mutation: Mutation, size: usize) {
        debug_assert_eq!(self.status, BatchStatus::Open);
        self.size_bytes += size;
        self.mutations.push(mutation);
    }

    pub(crate) fn mark(&mut self, status: BatchStatus) {
        self.status = status;
    }

    /// Close the batch to further rows under its final id.
    pub(crate) fn seal(&mut self, id: u64) {
        self.id = id;
        self.status = BatchStatus::Sealed;
    }
}
