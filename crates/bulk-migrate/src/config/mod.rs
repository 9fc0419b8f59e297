//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use crate::error::Result;
use std::path::Path;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }
}

impl WriterConfig {
    /// Validate writer settings on their own, for callers that build them in code.
    pub fn validate(&self) -> Result<()> {
        validation::validate_writer(self)
    }
}

impl TargetConfig {
    /// Effective pool size for a given number of write workers.
    pub fn pool_size(&self, workers: usize) -> usize {
        self.max_connections.unwrap_or(workers + 1).max(1)
    }
}
