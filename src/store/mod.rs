//! In-memory authoritative ledgers with write-behind persistence.
//!
//! Each ledger guards its map with one mutex. Locks are never nested
//! across ledgers, so cross-ledger updates (a position debit and the
//! matching cash credit) are not atomic; reconciliation is idempotent and
//! repairs partial progress on the next pass.

mod order;
mod position;
mod strategy;
mod write_behind;

pub use order::OrderLedger;
pub use position::PositionLedger;
pub use strategy::StrategyLedger;
pub use write_behind::WriteBehind;

use crate::error::{EngineError, Result};
use crate::persistence::Ledger;
use std::sync::Arc;
use tracing::info;

/// The three ledgers sharing one write-behind queue.
pub struct Stores {
    pub strategies: Arc<StrategyLedger>,
    pub orders: Arc<OrderLedger>,
    pub positions: Arc<PositionLedger>,
    pub writes: WriteBehind,
}

impl Stores {
    /// Build empty ledgers writing behind to `ledger`.
    pub fn new(ledger: Arc<dyn Ledger>) -> Self {
        let writes = WriteBehind::spawn(ledger);
        Self {
            strategies: Arc::new(StrategyLedger::new(writes.clone())),
            orders: Arc::new(OrderLedger::new(writes.clone())),
            positions: Arc::new(PositionLedger::new(writes.clone())),
            writes,
        }
    }

    /// Build ledgers hydrated from the durable ledger's active entities.
    pub async fn hydrate(ledger: Arc<dyn Ledger>) -> Result<Self> {
        let strategies = ledger
            .load_strategies()
            .await
            .map_err(|e| EngineError::Storage(e.context("Failed to load strategies")))?;
        let orders = ledger
            .load_active_orders()
            .await
            .map_err(|e| EngineError::Storage(e.context("Failed to load active orders")))?;
        let positions = ledger
            .load_active_positions()
            .await
            .map_err(|e| EngineError::Storage(e.context("Failed to load active positions")))?;

        info!(
            strategies = strategies.len(),
            orders = orders.len(),
            positions = positions.len(),
            "Hydrated ledgers"
        );

        let stores = Self::new(ledger);
        stores.strategies.load(strategies);
        stores.orders.load(orders);
        stores.positions.load(positions);
        Ok(stores)
    }
}
