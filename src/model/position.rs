//! Open positions created by entry fills.

use super::Side;
use crate::utils::clock::Timestamp;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Shares acquired by one entry fill. `owned_quantity` only ever decreases.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    /// Broker execution id of the opening fill
    pub code: String,
    pub strategy_code: String,
    pub order_code: String,
    pub symbol_code: String,
    pub exchange: String,
    pub side: Side,
    /// Entry price
    pub price: Decimal,
    pub owned_quantity: Decimal,
    /// Quantity reserved by in-flight exit orders
    pub hold_quantity: Decimal,
    pub contracted_at: Timestamp,
}

impl Position {
    /// Quantity free to be reserved by a new exit order.
    pub fn leave_quantity(&self) -> Decimal {
        self.owned_quantity - self.hold_quantity
    }

    pub fn is_active(&self) -> bool {
        self.owned_quantity > Decimal::ZERO
    }
}
