//! Domain entities: strategies, orders, positions and their enums.

mod order;
mod position;
mod strategy;

pub use order::{Contract, HoldPosition, Order};
pub use position::Position;
pub use strategy::{
    at_time_of_day, Account, CancelStrategy, DynamicGridMinMax, ExitCondition, ExitStrategy,
    GridStrategy, RebalanceStrategy, Rounding, Strategy, TimeRange, WidthOperation,
};

use serde::{Deserialize, Serialize};

/// Order direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

/// Whether an order opens or closes a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeType {
    Entry,
    Exit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionType {
    Market,
    Limit,
    /// Market order executed at the morning session close
    MarketMorningClose,
    /// Market order executed at the afternoon session close
    MarketAfternoonClose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    InOrder,
    Done,
    Canceled,
}

/// Cash equity or margin trading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Product {
    #[default]
    Stock,
    Margin,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarginTradeType {
    #[default]
    None,
    System,
    General,
    Day,
}

/// Which positions an exit order consumes first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Newest,
    Oldest,
}
