//! Order placement and the hold/release reservation protocol.
//!
//! Exit orders reserve ("hold") the positions they will close before they
//! are submitted. A reservation either covers the full requested quantity
//! or is rolled back completely, so two concurrent exit orders can never
//! claim the same shares. When a submission fails, its holds are released
//! on a best-effort basis; release failures are reported alongside the
//! submission error rather than hidden.

use crate::error::{EngineError, Result};
use crate::exchange::BrokerClient;
use crate::model::{
    ExecutionType, HoldPosition, Order, OrderStatus, SortOrder, Strategy, TradeType,
};
use crate::store::{OrderLedger, PositionLedger, StrategyLedger};
use crate::utils::Clock;
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Builds, reserves for and submits orders on behalf of strategies.
pub struct OrderExecutor {
    broker: Arc<dyn BrokerClient>,
    strategies: Arc<StrategyLedger>,
    orders: Arc<OrderLedger>,
    positions: Arc<PositionLedger>,
    clock: Arc<dyn Clock>,
}

impl OrderExecutor {
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        strategies: Arc<StrategyLedger>,
        orders: Arc<OrderLedger>,
        positions: Arc<PositionLedger>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            broker,
            strategies,
            orders,
            positions,
            clock,
        }
    }

    /// Place a limit order opening a position.
    ///
    /// Fails with `InsufficientCash` when the strategy's cash does not cover
    /// the unfilled notional of its resting entry limits plus this order.
    pub async fn entry_limit(
        &self,
        strategy_code: &str,
        price: Decimal,
        quantity: Decimal,
    ) -> Result<Order> {
        ensure_positive("price", price)?;
        ensure_positive("quantity", quantity)?;
        let strategy = self.strategies.by_code(strategy_code)?;

        let resting: Decimal = self
            .orders
            .active_by_strategy(&strategy.code)
            .iter()
            .filter(|o| o.trade_type == TradeType::Entry && o.execution_type == ExecutionType::Limit)
            .map(|o| o.price * o.unfilled_quantity())
            .sum();
        let required = resting + price * quantity;
        if strategy.cash < required {
            return Err(EngineError::InsufficientCash {
                required,
                available: strategy.cash,
            });
        }

        let order = self.build_order(
            &strategy,
            TradeType::Entry,
            ExecutionType::Limit,
            price,
            quantity,
            Vec::new(),
        );
        self.send_order(&strategy, order).await
    }

    /// Place a market order opening a position.
    pub async fn entry_market(&self, strategy_code: &str, quantity: Decimal) -> Result<Order> {
        ensure_positive("quantity", quantity)?;
        let strategy = self.strategies.by_code(strategy_code)?;
        let order = self.build_order(
            &strategy,
            TradeType::Entry,
            ExecutionType::Market,
            Decimal::ZERO,
            quantity,
            Vec::new(),
        );
        self.send_order(&strategy, order).await
    }

    /// Place a limit order closing exactly `quantity` of held positions.
    pub async fn exit_limit(
        &self,
        strategy_code: &str,
        price: Decimal,
        quantity: Decimal,
        sort: SortOrder,
    ) -> Result<Order> {
        ensure_positive("price", price)?;
        self.exit(strategy_code, ExecutionType::Limit, price, quantity, sort)
            .await
    }

    /// Place a market order closing exactly `quantity` of held positions.
    pub async fn exit_market(
        &self,
        strategy_code: &str,
        quantity: Decimal,
        sort: SortOrder,
    ) -> Result<Order> {
        self.exit(strategy_code, ExecutionType::Market, Decimal::ZERO, quantity, sort)
            .await
    }

    async fn exit(
        &self,
        strategy_code: &str,
        execution_type: ExecutionType,
        price: Decimal,
        quantity: Decimal,
        sort: SortOrder,
    ) -> Result<Order> {
        ensure_positive("quantity", quantity)?;
        let strategy = self.strategies.by_code(strategy_code)?;
        let holds = self.hold_positions(&strategy.code, quantity, sort)?;
        let order = self.build_order(
            &strategy,
            TradeType::Exit,
            execution_type,
            price,
            quantity,
            holds,
        );
        self.send_order(&strategy, order).await
    }

    /// Reserve exactly `quantity` across the strategy's active positions.
    ///
    /// Positions are consumed newest-first or oldest-first. If not enough
    /// unreserved quantity exists (including when a concurrent reservation
    /// wins the race for a position), every reservation made here is
    /// released and `InsufficientPosition` is returned.
    pub fn hold_positions(
        &self,
        strategy_code: &str,
        quantity: Decimal,
        sort: SortOrder,
    ) -> Result<Vec<HoldPosition>> {
        let mut candidates = self.positions.active_by_strategy(strategy_code);
        if sort == SortOrder::Newest {
            candidates.reverse();
        }

        let mut holds = Vec::new();
        let mut remaining = quantity;
        for position in candidates {
            if remaining <= Decimal::ZERO {
                break;
            }
            let leave = position.leave_quantity();
            if leave <= Decimal::ZERO {
                continue;
            }
            let take = leave.min(remaining);
            match self.positions.hold(&position.code, take) {
                Ok(()) => {
                    holds.push(HoldPosition::new(&position.code, position.price, take));
                    remaining -= take;
                }
                Err(e) => {
                    debug!(position = %position.code, error = %e, "Position reserved concurrently, skipping");
                }
            }
        }

        if remaining > Decimal::ZERO {
            let suppressed = self.release_holds(&holds);
            warn!(
                strategy = %strategy_code,
                requested = %quantity,
                short = %remaining,
                "Not enough position to hold, reservations rolled back"
            );
            return Err(EngineError::with_suppressed(
                EngineError::InsufficientPosition {
                    requested: quantity,
                    available: quantity - remaining,
                },
                suppressed,
            ));
        }

        Ok(holds)
    }

    /// Submit an order. Accepted orders are stamped with the broker code
    /// and stored as active; otherwise attached holds are released.
    #[instrument(skip(self, strategy, order), fields(strategy = %strategy.code))]
    async fn send_order(&self, strategy: &Strategy, mut order: Order) -> Result<Order> {
        let cause = match self.broker.submit_order(strategy, &order).await {
            Ok(result) if result.accepted => {
                order.code = result.code;
                self.orders.save(order.clone());
                info!(
                    code = %order.code,
                    trade = ?order.trade_type,
                    side = ?order.side,
                    execution = ?order.execution_type,
                    price = %order.price,
                    quantity = %order.order_quantity,
                    "Order accepted"
                );
                return Ok(order);
            }
            Ok(_) => EngineError::OrderRejected,
            Err(e) => EngineError::Broker(e),
        };

        let suppressed = self.release_holds(&order.hold_positions);
        warn!(
            error = %cause,
            released = order.hold_positions.len(),
            stranded = suppressed.len(),
            "Order submission failed"
        );
        Err(EngineError::with_suppressed(cause, suppressed))
    }

    /// Cancel one order at the broker.
    pub async fn cancel(&self, strategy: &Strategy, order_code: &str) -> Result<()> {
        let result = self
            .broker
            .cancel_order(&strategy.account.password, order_code)
            .await
            .map_err(EngineError::Broker)?;
        if !result.accepted {
            return Err(EngineError::CancelRejected(order_code.to_string()));
        }
        info!(strategy = %strategy.code, order = %order_code, "Cancel accepted");
        Ok(())
    }

    /// Cancel every active order, only during a cancel timing.
    pub async fn cancel_all(&self, strategy: &Strategy) -> Result<()> {
        if !strategy.cancel.is_running(&self.clock.now()) {
            return Ok(());
        }
        for order in self.orders.active_by_strategy(&strategy.code) {
            self.cancel(strategy, &order.code).await?;
        }
        Ok(())
    }

    /// Close every position in one combined order, only during an exit timing.
    ///
    /// Reserves the entire unreserved quantity of each active position;
    /// returns `None` when there is nothing left to close.
    pub async fn exit_all(&self, strategy: &Strategy) -> Result<Option<Order>> {
        let now = self.clock.now();
        let Some(condition) = strategy.exit.condition_at(&now) else {
            return Ok(None);
        };

        let mut holds = Vec::new();
        for position in self.positions.active_by_strategy(&strategy.code) {
            let leave = position.leave_quantity();
            if leave <= Decimal::ZERO {
                continue;
            }
            if let Err(e) = self.positions.hold(&position.code, leave) {
                let suppressed = self.release_holds(&holds);
                return Err(EngineError::with_suppressed(e, suppressed));
            }
            holds.push(HoldPosition::new(&position.code, position.price, leave));
        }

        let quantity: Decimal = holds.iter().map(|h| h.hold_quantity).sum();
        if quantity <= Decimal::ZERO {
            return Ok(None);
        }

        let order = self.build_order(
            strategy,
            TradeType::Exit,
            condition.execution_type,
            Decimal::ZERO,
            quantity,
            holds,
        );
        self.send_order(strategy, order).await.map(Some)
    }

    /// Release the unconsumed part of each hold; returns the failures.
    fn release_holds(&self, holds: &[HoldPosition]) -> Vec<EngineError> {
        holds
            .iter()
            .filter(|h| h.leave_quantity() > Decimal::ZERO)
            .filter_map(|h| self.positions.release(&h.position_code, h.leave_quantity()).err())
            .collect()
    }

    fn build_order(
        &self,
        strategy: &Strategy,
        trade_type: TradeType,
        execution_type: ExecutionType,
        price: Decimal,
        quantity: Decimal,
        hold_positions: Vec<HoldPosition>,
    ) -> Order {
        let side = match trade_type {
            TradeType::Entry => strategy.entry_side,
            TradeType::Exit => strategy.entry_side.opposite(),
        };
        Order {
            code: String::new(),
            strategy_code: strategy.code.clone(),
            symbol_code: strategy.symbol_code.clone(),
            exchange: strategy.exchange.clone(),
            product: strategy.product,
            margin_trade_type: strategy.margin_trade_type,
            trade_type,
            side,
            execution_type,
            price,
            order_quantity: quantity,
            contract_quantity: Decimal::ZERO,
            status: OrderStatus::InOrder,
            ordered_at: self.clock.now(),
            contracted_at: None,
            canceled_at: None,
            contracts: Vec::new(),
            hold_positions,
        }
    }
}

fn ensure_positive(name: &str, value: Decimal) -> Result<()> {
    if value <= Decimal::ZERO {
        return Err(EngineError::InvalidArgument(format!(
            "{} must be positive, got {}",
            name, value
        )));
    }
    Ok(())
}
