//! Broker-side data shapes.

use crate::market::TickGroup;
use crate::model::{Contract, ExecutionType, OrderStatus, Product, Side};
use crate::utils::clock::Timestamp;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Current market data for a symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolQuote {
    pub symbol_code: String,
    pub exchange: String,
    /// Last traded price
    pub price: Decimal,
    pub price_at: Option<Timestamp>,
    pub bid: Decimal,
    pub ask: Decimal,
    pub trading_unit: Decimal,
    pub tick_group: TickGroup,
}

/// Broker's view of an order, including every fill. Read-only input to
/// reconciliation; never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct SecurityOrder {
    pub code: String,
    pub symbol_code: String,
    pub exchange: String,
    pub product: Product,
    pub side: Side,
    pub execution_type: ExecutionType,
    pub price: Decimal,
    pub order_quantity: Decimal,
    pub contract_quantity: Decimal,
    pub status: OrderStatus,
    pub ordered_at: Timestamp,
    pub contracted_at: Option<Timestamp>,
    pub canceled_at: Option<Timestamp>,
    pub contracts: Vec<Contract>,
}

/// Result of an order submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderResult {
    pub accepted: bool,
    /// Broker order code; empty when rejected
    pub code: String,
}

impl OrderResult {
    pub fn accepted(code: impl Into<String>) -> Self {
        Self {
            accepted: true,
            code: code.into(),
        }
    }

    pub fn rejected() -> Self {
        Self {
            accepted: false,
            code: String::new(),
        }
    }
}

/// Result of a cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelResult {
    pub accepted: bool,
}
