//! Error types for the migration library.

use thiserror::Error;

/// Main error type for migration operations.
#[derive(Error, Debug)]
pub enum MigrateError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Target database connection or query error
    #[error("Target database error: {0}")]
    Target(#[from] tokio_postgres::Error),

    /// Connection pool error with context
    #[error("Pool error: {message}\n  Context: {context}")]
    Pool { message: String, context: String },

    /// A row whose column and value counts disagree
    #[error("Row for table {table} has {columns} columns but {values} values")]
    RowShape {
        table: String,
        columns: usize,
        values: usize,
    },

    /// Write to the target failed for a specific table
    #[error("Write failed for table {table}: {message}")]
    Write { table: String, message: String },

    /// Rows were offered to a writer that has already been drained
    #[error("Batch writer has already been drained and cannot accept more rows")]
    WriterDrained,

    /// A write worker panicked; its in-flight batch is unaccounted for
    #[error("Write worker {worker_id} panicked: {message}")]
    WorkerPanicked { worker_id: usize, message: String },

    /// A task runner item failed
    #[error("Task {index} failed: {message}")]
    TaskFailed { index: usize, message: String },

    /// A task runner item panicked
    #[error("Task {index} panicked: {message}")]
    TaskPanicked { index: usize, message: String },

    /// Source data could not be read
    #[error("Source data error: {0}")]
    Source(String),

    /// Expression verification error
    #[error("Verification failed: {0}")]
    Verification(String),

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV parsing error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Migration was cancelled (SIGINT, etc.)
    #[error("Migration cancelled")]
    Cancelled,
}

impl MigrateError {
    /// Create a Pool error with context about where it occurred
    pub fn pool(message: impl Into<String>, context: impl Into<String>) -> Self {
        MigrateError::Pool {
            message: message.into(),
            context: context.into(),
        }
    }

    /// Create a Write error
    pub fn write(table: impl Into<String>, message: impl Into<String>) -> Self {
        MigrateError::Write {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            MigrateError::Config(_) | MigrateError::Yaml(_) => 2,
            MigrateError::Cancelled => 130,
            _ => 1,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        // Add error chain for wrapped errors
        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Failure of a single batch write, classified for the retry policy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WriteError {
    /// Target temporarily unavailable or overloaded; worth retrying.
    #[error("transient write failure: {0}")]
    Transient(String),

    /// Structurally invalid batch (constraint violation, bad data); retrying cannot help.
    #[error("permanent write failure: {0}")]
    Permanent(String),
}

impl WriteError {
    pub fn transient(message: impl Into<String>) -> Self {
        WriteError::Transient(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        WriteError::Permanent(message.into())
    }

    /// Whether the retry policy should attempt this write again.
    pub fn is_transient(&self) -> bool {
        matches!(self, WriteError::Transient(_))
    }
}

/// Result type alias for migration operations.
pub type Result<T> = std::result::Result<T, MigrateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(MigrateError::Config("bad".into()).exit_code(), 2);
        assert_eq!(MigrateError::Cancelled.exit_code(), 130);
        assert_eq!(MigrateError::WriterDrained.exit_code(), 1);
    }

    #[test]
    fn test_format_detailed_includes_chain() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing.csv");
        let err = MigrateError::from(io);
        let detailed = err.format_detailed();
        assert!(detailed.starts_with("Error: IO error: missing.csv"));
    }

    #[test]
    fn test_write_error_classification() {
        assert!(WriteError::transient("deadlock").is_transient());
        assert!(!WriteError::permanent("not null violation").is_transient());
    }
}
