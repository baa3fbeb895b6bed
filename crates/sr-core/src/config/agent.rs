//! Agent configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::serde_utils::duration_secs;

/// One path-to-target mapping entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathEntry {
    /// Logical path name registered with the broker
    pub path: String,
    /// URL fetched when the broker requests this path
    pub url: String,
}

/// Configuration for the relay agent
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Broker address to connect to (host:port)
    pub broker_address: String,

    /// Port for the local metrics endpoint
    pub metrics_port: u16,

    /// Timeout applied to the broker connect and each handshake round-trip
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Timeout applied to each target fetch
    #[serde(with = "duration_secs")]
    pub fetch_timeout: Duration,

    /// Maximum number of fetches in flight at once
    pub max_inflight_fetches: usize,

    /// Backoff configuration for reconnections
    pub backoff: BackoffConfig,

    /// Path-to-target mappings, registered with the broker at handshake
    pub paths: Vec<PathEntry>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            broker_address: "localhost:50051".to_string(),
            metrics_port: 8000,
            connect_timeout: Duration::from_secs(30),
            fetch_timeout: Duration::from_secs(10),
            max_inflight_fetches: 4,
            backoff: BackoffConfig::default(),
            paths: vec![],
        }
    }
}

/// Exponential backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Initial delay
    #[serde(with = "duration_secs")]
    pub initial: Duration,

    /// Maximum delay
    #[serde(with = "duration_secs")]
    pub max: Duration,

    /// Multiplier for each retry
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            multiplier: 2.0,
            jitter: 0.25,
        }
    }
}
