//! Trading services.
//!
//! Contains the core logic for:
//! - Reconciling local orders and positions with broker fills
//! - Order placement and the hold/release reservation protocol
//! - Grid leveling around the base price
//! - Cash/position rebalancing

mod executor;
mod grid;
mod rebalancer;
mod reconciler;

pub use executor::OrderExecutor;
pub use grid::{grid_width, GridEngine, MAX_GRID_SPAN_TICKS};
pub use rebalancer::{rebalance_quantity, RebalanceEngine};
pub use reconciler::Reconciler;
