//! Configuration management for scrape-relay

mod agent;
mod serde_utils;

pub use agent::{AgentConfig, BackoffConfig, PathEntry};

use crate::error::ConfigError;
use std::path::Path;

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<AgentConfig, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to read config: {}", e)))?;

    let config: AgentConfig = toml::from_str(&content)?;
    Ok(config)
}
