//! Immutable path-to-target registry
//!
//! Built once from configuration at process start and never mutated
//! afterwards, so it is safe to share across tasks behind an `Arc`
//! without synchronization. Reconfiguration requires a restart.

use std::collections::HashMap;

use crate::config::PathEntry;
use crate::error::ConfigError;

/// Mapping from logical path name to fetch target URL
#[derive(Debug, Clone)]
pub struct PathRegistry {
    paths: HashMap<String, String>,
    // Preserves config order for handshake registration
    order: Vec<String>,
}

impl PathRegistry {
    /// Build a registry from configuration entries.
    ///
    /// Paths are stored verbatim, with no normalization. A path that
    /// appears more than once is rejected rather than silently letting
    /// one entry win.
    pub fn from_entries(entries: &[PathEntry]) -> Result<Self, ConfigError> {
        let mut paths = HashMap::with_capacity(entries.len());
        let mut order = Vec::with_capacity(entries.len());

        for entry in entries {
            if paths
                .insert(entry.path.clone(), entry.url.clone())
                .is_some()
            {
                return Err(ConfigError::DuplicatePath(entry.path.clone()));
            }
            order.push(entry.path.clone());
            tracing::info!("Path {} will be fetched from {}", entry.path, entry.url);
        }

        Ok(Self { paths, order })
    }

    /// Resolve a path to its fetch target
    pub fn resolve(&self, path: &str) -> Option<&str> {
        self.paths.get(path).map(String::as_str)
    }

    /// Iterate paths in configuration order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.order.iter().map(move |path| {
            let url = self.paths[path].as_str();
            (path.as_str(), url)
        })
    }

    /// Number of registered paths
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    /// Whether the registry is empty
    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}
