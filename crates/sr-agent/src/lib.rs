//! sr-agent: Reverse-tunnel scrape agent for scrape-relay
//!
//! The agent runs next to HTTP-scrapeable targets that the central
//! collector cannot reach directly. It opens one outbound connection to
//! the broker, registers its configured paths, and then relays scrape
//! requests to local targets and results back to the broker.

pub mod broker;
pub mod dispatch;
pub mod fetch;
pub mod metrics;
pub mod relay;
pub mod supervisor;

pub use supervisor::Supervisor;
