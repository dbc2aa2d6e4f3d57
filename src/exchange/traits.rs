//! Broker client abstraction.
//!
//! The engine talks to the broker only through this trait, so the wire
//! client can be swapped for the paper broker or a test double.

use super::types::{CancelResult, OrderResult, SecurityOrder, SymbolQuote};
use crate::model::{Order, Product, Strategy};
use crate::utils::clock::Timestamp;
use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

/// Quotes, order listing, submission and cancellation against a broker.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn get_symbol_quote(&self, symbol_code: &str, exchange: &str)
        -> anyhow::Result<SymbolQuote>;

    /// Orders for a symbol whose state changed at or after `since`
    /// (every known order when `since` is `None`).
    async fn get_orders(
        &self,
        product: Product,
        symbol_code: &str,
        since: Option<Timestamp>,
    ) -> anyhow::Result<Vec<SecurityOrder>>;

    async fn submit_order(&self, strategy: &Strategy, order: &Order)
        -> anyhow::Result<OrderResult>;

    async fn cancel_order(&self, password: &str, order_code: &str)
        -> anyhow::Result<CancelResult>;
}
