//! # Grid Trader
//!
//! An intraday grid trading engine. Each strategy keeps a ladder of resting
//! limit orders around a moving base price, rebalances cash against its
//! position at set times, and continuously reconciles local orders and
//! positions against the broker.
//!
//! ## Architecture
//!
//! - `config`: Configuration loading and validation
//! - `error`: Engine error type
//! - `exchange`: Broker client trait and the paper broker
//! - `market`: Tick-size table and tick arithmetic
//! - `model`: Strategies, orders, positions
//! - `persistence`: SQLite-backed durable ledger
//! - `store`: In-memory ledgers with write-behind persistence
//! - `strategy`: Reconciliation, order placement, grid and rebalance engines
//! - `scheduler`: Periodic passes over all runnable strategies
//! - `utils`: Clock and decimal helpers

pub mod config;
pub mod error;
pub mod exchange;
pub mod market;
pub mod model;
pub mod persistence;
pub mod scheduler;
pub mod store;
pub mod strategy;
pub mod utils;

pub use config::Config;
pub use error::{EngineError, Result};
