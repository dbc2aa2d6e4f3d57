//! Rebalancing of cash against position exposure.
//!
//! At each configured timing the engine trades toward holding half of the
//! strategy's total value in the position and half in cash, in whole
//! trading units at the current mid price.

use super::executor::OrderExecutor;
use crate::error::{EngineError, Result};
use crate::exchange::BrokerClient;
use crate::model::{Order, SortOrder, Strategy};
use crate::store::PositionLedger;
use crate::utils::clock::Clock;
use crate::utils::decimal::round_half_away;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info};

pub struct RebalanceEngine {
    broker: Arc<dyn BrokerClient>,
    positions: Arc<PositionLedger>,
    executor: Arc<OrderExecutor>,
    clock: Arc<dyn Clock>,
}

impl RebalanceEngine {
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        positions: Arc<PositionLedger>,
        executor: Arc<OrderExecutor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            broker,
            positions,
            executor,
            clock,
        }
    }

    /// Submit the market order that brings the strategy back to balance.
    ///
    /// Returns the order placed, if any.
    pub async fn rebalance(&self, strategy: &Strategy) -> Result<Option<Order>> {
        if !strategy.rebalance.is_running(&self.clock.now()) {
            return Ok(None);
        }

        let quote = self
            .broker
            .get_symbol_quote(&strategy.symbol_code, &strategy.exchange)
            .await
            .map_err(EngineError::Broker)?;
        let mid = (quote.bid + quote.ask) / Decimal::TWO;
        let owned: Decimal = self
            .positions
            .active_by_strategy(&strategy.code)
            .iter()
            .map(|p| p.owned_quantity)
            .sum();

        let quantity = rebalance_quantity(strategy.cash, owned, mid, quote.trading_unit);
        debug!(
            strategy = %strategy.code,
            %mid,
            %owned,
            unit = %quote.trading_unit,
            %quantity,
            "Rebalance computed"
        );

        let order = if quantity > Decimal::ZERO {
            self.executor.entry_market(&strategy.code, quantity).await?
        } else if quantity < Decimal::ZERO {
            self.executor
                .exit_market(&strategy.code, -quantity, SortOrder::Oldest)
                .await?
        } else {
            return Ok(None);
        };

        info!(
            strategy = %strategy.code,
            trade = ?order.trade_type,
            quantity = %order.order_quantity,
            "Rebalanced"
        );
        Ok(Some(order))
    }
}

/// Signed quantity to trade: positive buys into the position, negative
/// sells out of it. Always a whole number of trading units.
pub fn rebalance_quantity(
    cash: Decimal,
    owned: Decimal,
    mid: Decimal,
    trading_unit: Decimal,
) -> Decimal {
    if mid <= Decimal::ZERO || trading_unit <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    let lots = round_half_away((cash - owned * mid) / Decimal::TWO / mid / trading_unit);
    lots * trading_unit
}
