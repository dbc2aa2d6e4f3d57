//! Broker integration.
//!
//! - `BrokerClient`: the trait every broker adapter implements
//!   (quotes, order listing, submission, cancellation)
//! - `PaperBroker`: in-process simulation used for paper trading and tests

pub mod paper;
mod traits;
mod types;

pub use paper::PaperBroker;
pub use traits::BrokerClient;
#[cfg(test)]
pub use traits::MockBrokerClient;
pub use types::*;
