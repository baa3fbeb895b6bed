//! Identifier newtypes used across the protocol

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier assigned to an agent by the broker at registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentId(pub u64);

impl AgentId {
    /// Create a new agent ID
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw ID value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "agent-{}", self.0)
    }
}

impl From<u64> for AgentId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Correlation identifier for one scrape request/response pair.
///
/// Assigned by the broker; the agent must echo it unchanged on the
/// response so the broker can match out-of-order completions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScrapeId(pub u64);

impl ScrapeId {
    /// Create a new scrape ID
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw ID value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ScrapeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scrape-{}", self.0)
    }
}

impl From<u64> for ScrapeId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// Identifier assigned by the broker when a path is registered.
///
/// The agent only logs it; routing on the broker side is out of scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PathId(pub u64);

impl PathId {
    /// Create a new path ID
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw ID value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for PathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "path-{}", self.0)
    }
}
