//! Broker connection management

mod backoff;
mod connector;

pub use backoff::ExponentialBackoff;
pub use connector::{BrokerConnector, BrokerSession, ConnectionError};
