//! Configuration validation.

use super::{Config, WriterConfig};
use crate::error::{MigrateError, Result};

/// Validate the configuration.
pub fn validate(config: &Config) -> Result<()> {
    // Target validation
    if config.target.host.is_empty() {
        return Err(MigrateError::Config("target.host is required".into()));
    }
    if config.target.database.is_empty() {
        return Err(MigrateError::Config("target.database is required".into()));
    }
    if config.target.user.is_empty() {
        return Err(MigrateError::Config("target.user is required".into()));
    }
    if let Some(0) = config.target.max_connections {
        return Err(MigrateError::Config(
            "target.max_connections must be at least 1".into(),
        ));
    }

    validate_writer(&config.writer)?;

    if config.verify.concurrency == 0 {
        return Err(MigrateError::Config(
            "verify.concurrency must be at least 1".into(),
        ));
    }

    Ok(())
}

/// Validate batch writer settings - only check optional fields if explicitly set.
pub fn validate_writer(writer: &WriterConfig) -> Result<()> {
    if let Some(0) = writer.bytes_limit {
        return Err(MigrateError::Config(
            "writer.bytes_limit must be at least 1".into(),
        ));
    }
    if let Some(0) = writer.write_limit {
        return Err(MigrateError::Config(
            "writer.write_limit must be at least 1".into(),
        ));
    }
    if let Some(0) = writer.queue_depth {
        return Err(MigrateError::Config(
            "writer.queue_depth must be at least 1".into(),
        ));
    }
    if writer.retry_limit == 0 {
        return Err(MigrateError::Config(
            "writer.retry_limit must be at least 1".into(),
        ));
    }
    if writer.max_rows_per_batch == 0 {
        return Err(MigrateError::Config(
            "writer.max_rows_per_batch must be at least 1".into(),
        ));
    }
    if writer.retry_initial_delay_ms > writer.retry_max_delay_ms {
        return Err(MigrateError::Config(format!(
            "writer.retry_initial_delay_ms ({}) exceeds writer.retry_max_delay_ms ({})",
            writer.retry_initial_delay_ms, writer.retry_max_delay_ms
        )));
    }

    Ok(())
}
