//! sr-core: Configuration and path registry for scrape-relay
//!
//! This crate provides the configuration structures loaded at process
//! start and the immutable path-to-target registry built from them.

pub mod config;
pub mod error;
pub mod registry;

pub use config::AgentConfig;
pub use error::ConfigError;
pub use registry::PathRegistry;
