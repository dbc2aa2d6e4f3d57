//! Orders, their fills and the positions they hold for exit.

use super::{ExecutionType, MarginTradeType, OrderStatus, Product, Side, TradeType};
use crate::utils::clock::Timestamp;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A fill reported by the broker. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contract {
    pub order_code: String,
    /// Broker execution id; doubles as the code of the position it opens.
    pub position_code: String,
    pub price: Decimal,
    pub quantity: Decimal,
    pub contracted_at: Timestamp,
}

/// Part of a position reserved for one exit order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HoldPosition {
    pub position_code: String,
    /// Entry price of the held position
    pub price: Decimal,
    pub hold_quantity: Decimal,
    pub contract_quantity: Decimal,
    pub release_quantity: Decimal,
}

impl HoldPosition {
    pub fn new(position_code: impl Into<String>, price: Decimal, hold_quantity: Decimal) -> Self {
        Self {
            position_code: position_code.into(),
            price,
            hold_quantity,
            contract_quantity: Decimal::ZERO,
            release_quantity: Decimal::ZERO,
        }
    }

    /// Reserved quantity neither filled nor released yet.
    pub fn leave_quantity(&self) -> Decimal {
        self.hold_quantity - self.contract_quantity - self.release_quantity
    }
}

/// A local order record. Created by the executor, then advanced only by
/// reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    /// Broker-assigned code, empty until the broker accepts the order
    pub code: String,
    pub strategy_code: String,
    pub symbol_code: String,
    pub exchange: String,
    pub product: Product,
    pub margin_trade_type: MarginTradeType,
    pub trade_type: TradeType,
    pub side: Side,
    pub execution_type: ExecutionType,
    pub price: Decimal,
    pub order_quantity: Decimal,
    pub contract_quantity: Decimal,
    pub status: OrderStatus,
    pub ordered_at: Timestamp,
    pub contracted_at: Option<Timestamp>,
    pub canceled_at: Option<Timestamp>,
    #[serde(default)]
    pub contracts: Vec<Contract>,
    #[serde(default)]
    pub hold_positions: Vec<HoldPosition>,
}

impl Order {
    pub fn is_active(&self) -> bool {
        self.status == OrderStatus::InOrder
    }

    /// Quantity still resting at the broker.
    pub fn unfilled_quantity(&self) -> Decimal {
        self.order_quantity - self.contract_quantity
    }

    pub fn has_contract(&self, position_code: &str) -> bool {
        self.contracts.iter().any(|c| c.position_code == position_code)
    }

    /// Total reserved quantity still attached to this order.
    pub fn hold_leave_quantity(&self) -> Decimal {
        self.hold_positions.iter().map(HoldPosition::leave_quantity).sum()
    }
}
