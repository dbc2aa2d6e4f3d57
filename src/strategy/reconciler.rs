//! Reconciliation of local orders against the broker.
//!
//! Each pass diffs the strategy's active orders with the broker's view,
//! applies fills that have not been seen yet, and advances local order
//! state. Every applied fill is recorded on the local order before the next
//! one is processed, so a pass that fails halfway leaves the order in a
//! state the next pass picks up from without applying anything twice.

use crate::error::{EngineError, Result};
use crate::exchange::{BrokerClient, SecurityOrder};
use crate::model::{Contract, Order, OrderStatus, Position, Side, Strategy, TradeType};
use crate::store::{OrderLedger, PositionLedger, StrategyLedger};
use crate::utils::clock::{Clock, Timestamp};
use chrono::Duration;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Applies broker fills and cancellations to the local ledgers.
pub struct Reconciler {
    broker: Arc<dyn BrokerClient>,
    strategies: Arc<StrategyLedger>,
    orders: Arc<OrderLedger>,
    positions: Arc<PositionLedger>,
    clock: Arc<dyn Clock>,
    lookback: Duration,
}

impl Reconciler {
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        strategies: Arc<StrategyLedger>,
        orders: Arc<OrderLedger>,
        positions: Arc<PositionLedger>,
        clock: Arc<dyn Clock>,
        lookback: Duration,
    ) -> Self {
        Self {
            broker,
            strategies,
            orders,
            positions,
            clock,
            lookback,
        }
    }

    /// Reconcile orders changed since shortly before the last known fill.
    ///
    /// Returns the number of newly applied fills.
    pub async fn confirm(&self, strategy: &Strategy) -> Result<usize> {
        let current = self.strategies.by_code(&strategy.code)?;
        let since = current.last_contract_at.map(|at| at - self.lookback);
        self.reconcile(&current, since).await
    }

    /// Sweep the whole session right after a grid time range ends.
    ///
    /// Picks up fills older than the lookback that `confirm` may have
    /// missed. Only runs in the minute following the range end.
    pub async fn confirm_grid_end(&self, strategy: &Strategy) -> Result<usize> {
        if !strategy.grid.runnable {
            return Ok(0);
        }
        let now = self.clock.now();
        let Some(range) = strategy.grid.ending_range(&now) else {
            return Ok(0);
        };
        let since = range.start_on(&now);
        debug!(strategy = %strategy.code, %since, "Grid range ended, sweeping session");
        self.reconcile(strategy, Some(since)).await
    }

    #[instrument(skip(self, strategy), fields(strategy = %strategy.code))]
    async fn reconcile(&self, strategy: &Strategy, since: Option<Timestamp>) -> Result<usize> {
        let local = self.orders.active_by_strategy(&strategy.code);
        if local.is_empty() {
            return Ok(0);
        }

        let remote = self
            .broker
            .get_orders(strategy.product, &strategy.symbol_code, since)
            .await
            .map_err(EngineError::Broker)?;
        let remote: HashMap<&str, &SecurityOrder> = remote
            .iter()
            .filter(|o| o.product == strategy.product && o.symbol_code == strategy.symbol_code)
            .map(|o| (o.code.as_str(), o))
            .collect();

        let mut applied = 0;
        for order in local {
            let Some(security) = remote.get(order.code.as_str()) else {
                continue;
            };
            if is_unchanged(&order, security) {
                continue;
            }
            applied += self.apply(order, security)?;
        }

        if applied > 0 {
            info!(fills = applied, "Applied broker fills");
        }
        Ok(applied)
    }

    /// Bring one local order in line with the broker's view.
    fn apply(&self, mut order: Order, security: &SecurityOrder) -> Result<usize> {
        let fresh: Vec<&Contract> = security
            .contracts
            .iter()
            .filter(|c| !order.has_contract(&c.position_code))
            .collect();

        for contract in &fresh {
            match order.trade_type {
                TradeType::Entry => self.entry_contract(&order, contract)?,
                TradeType::Exit => self.exit_contract(&mut order, contract)?,
            }
            self.update_contract_price(&order.strategy_code, contract)?;
            order.contracts.push((*contract).clone());
            self.orders.save(order.clone());
        }

        if security.status == OrderStatus::Canceled && order.trade_type == TradeType::Exit {
            self.release_hold_positions(&mut order)?;
        }

        order.status = security.status;
        order.contract_quantity = security.contract_quantity;
        order.contracted_at = security.contracted_at;
        order.canceled_at = security.canceled_at;
        order.contracts = security.contracts.clone();
        debug!(order = %order.code, status = ?order.status, "Order updated from broker");
        self.orders.save(order);

        Ok(fresh.len())
    }

    /// Open a position for an entry fill and debit its notional.
    pub fn entry_contract(&self, order: &Order, contract: &Contract) -> Result<()> {
        self.positions.save(Position {
            code: contract.position_code.clone(),
            strategy_code: order.strategy_code.clone(),
            order_code: order.code.clone(),
            symbol_code: order.symbol_code.clone(),
            exchange: order.exchange.clone(),
            side: order.side,
            price: contract.price,
            owned_quantity: contract.quantity,
            hold_quantity: Decimal::ZERO,
            contracted_at: contract.contracted_at,
        });
        self.strategies
            .add_cash(&order.strategy_code, -(contract.price * contract.quantity));
        info!(
            strategy = %order.strategy_code,
            position = %contract.position_code,
            side = ?order.side,
            price = %contract.price,
            quantity = %contract.quantity,
            "Entry filled"
        );
        Ok(())
    }

    /// Allocate an exit fill across the order's holds in reservation order.
    ///
    /// A sell exit credits the fill proceeds. A buy exit closes a short and
    /// credits back the collateral adjusted by the entry/fill difference:
    /// `(2 * entry - fill) * quantity`.
    pub fn exit_contract(&self, order: &mut Order, contract: &Contract) -> Result<()> {
        let mut remaining = contract.quantity;
        for hold in order.hold_positions.iter_mut() {
            if remaining <= Decimal::ZERO {
                break;
            }
            let leave = hold.leave_quantity();
            if leave <= Decimal::ZERO {
                continue;
            }
            let quantity = leave.min(remaining);
            self.positions.exit_contract(&hold.position_code, quantity)?;
            hold.contract_quantity += quantity;

            let proceeds = match order.side {
                Side::Sell => contract.price * quantity,
                Side::Buy => (Decimal::TWO * hold.price - contract.price) * quantity,
            };
            self.strategies.add_cash(&order.strategy_code, proceeds);
            remaining -= quantity;

            info!(
                strategy = %order.strategy_code,
                position = %hold.position_code,
                entry = %hold.price,
                price = %contract.price,
                %quantity,
                "Exit filled"
            );
        }

        if remaining > Decimal::ZERO {
            warn!(
                order = %order.code,
                unallocated = %remaining,
                "Exit fill exceeds held quantity"
            );
        }
        Ok(())
    }

    /// Return every unconsumed reservation of an exit order.
    pub fn release_hold_positions(&self, order: &mut Order) -> Result<()> {
        for hold in order.hold_positions.iter_mut() {
            let leave = hold.leave_quantity();
            if leave <= Decimal::ZERO {
                continue;
            }
            self.positions.release(&hold.position_code, leave)?;
            hold.release_quantity += leave;
        }
        debug!(order = %order.code, "Released holds of canceled exit");
        Ok(())
    }

    /// Track the last fill and the running high/low of the current grid
    /// session. Fills older than the last recorded one are ignored.
    fn update_contract_price(&self, strategy_code: &str, contract: &Contract) -> Result<()> {
        let strategy = self.strategies.by_code(strategy_code)?;
        let at = contract.contracted_at;
        if strategy.last_contract_at.is_some_and(|last| at <= last) {
            return Ok(());
        }
        self.strategies.set_contract(strategy_code, contract.price, at);

        if !strategy.grid.runnable {
            return Ok(());
        }
        let Some(range) = strategy.grid.range_at(&at) else {
            return Ok(());
        };
        let session_start = range.start_on(&at);
        let stale = |seen: Option<Timestamp>| {
            seen.map_or(true, |s| s < session_start || !range.contains(s.time()))
        };

        if stale(strategy.max_contract_at) || contract.price > strategy.max_contract_price {
            self.strategies.set_max_contract(strategy_code, contract.price, at);
        }
        if stale(strategy.min_contract_at) || contract.price < strategy.min_contract_price {
            self.strategies.set_min_contract(strategy_code, contract.price, at);
        }
        Ok(())
    }
}

fn is_unchanged(order: &Order, security: &SecurityOrder) -> bool {
    order.status == security.status
        && order.contract_quantity == security.contract_quantity
        && order.contracted_at == security.contracted_at
        && order.canceled_at == security.canceled_at
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::MockBrokerClient;
    use crate::model::{ExecutionType, HoldPosition, Product, TimeRange};
    use crate::store::test_support::{at, order, position, sample_strategy, stores};
    use crate::store::Stores;
    use crate::utils::FixedClock;
    use chrono::NaiveTime;
    use rust_decimal_macros::dec;

    fn reconciler(stores: &Stores, broker: MockBrokerClient, now: Timestamp) -> Reconciler {
        Reconciler::new(
            Arc::new(broker),
            stores.strategies.clone(),
            stores.orders.clone(),
            stores.positions.clone(),
            Arc::new(FixedClock::new(now)),
            Duration::seconds(60),
        )
    }

    fn broker_with(orders: Vec<SecurityOrder>) -> MockBrokerClient {
        let mut broker = MockBrokerClient::new();
        broker
            .expect_get_orders()
            .returning(move |_, _, _| Ok(orders.clone()));
        broker
    }

    fn fill(
        order_code: &str,
        position_code: &str,
        price: Decimal,
        quantity: Decimal,
        minute: u32,
    ) -> Contract {
        Contract {
            order_code: order_code.to_string(),
            position_code: position_code.to_string(),
            price,
            quantity,
            contracted_at: at(9, minute),
        }
    }

    fn security(local: &Order, status: OrderStatus, contracts: Vec<Contract>) -> SecurityOrder {
        let contract_quantity = contracts.iter().map(|c| c.quantity).sum();
        SecurityOrder {
            code: local.code.clone(),
            symbol_code: local.symbol_code.clone(),
            exchange: local.exchange.clone(),
            product: Product::Stock,
            side: local.side,
            execution_type: local.execution_type,
            price: local.price,
            order_quantity: local.order_quantity,
            contract_quantity,
            status,
            ordered_at: local.ordered_at,
            contracted_at: contracts.last().map(|c| c.contracted_at),
            canceled_at: None,
            contracts,
        }
    }

    fn exit_order(code: &str, side: Side, quantity: Decimal, holds: Vec<HoldPosition>) -> Order {
        let mut exit = order(code, "S1", 5);
        exit.trade_type = TradeType::Exit;
        exit.side = side;
        exit.order_quantity = quantity;
        exit.hold_positions = holds;
        exit
    }

    // =========================================================================
    // Entry fills
    // =========================================================================

    #[tokio::test]
    async fn test_entry_fill_opens_position_and_debits_cash() {
        let s = stores();
        s.strategies.save(sample_strategy("S1"));
        let local = order("O1", "S1", 1);
        s.orders.save(local.clone());
        let remote = security(
            &local,
            OrderStatus::Done,
            vec![fill("O1", "E1", dec!(2000), dec!(2), 10)],
        );

        let r = reconciler(&s, broker_with(vec![remote]), at(9, 10));
        let applied = r.confirm(&sample_strategy("S1")).await.unwrap();

        assert_eq!(applied, 1);
        let p = s.positions.get("E1").unwrap();
        assert_eq!(p.owned_quantity, dec!(2));
        assert_eq!(p.price, dec!(2000));
        let strategy = s.strategies.by_code("S1").unwrap();
        assert_eq!(strategy.cash, dec!(996_000));
        assert_eq!(strategy.last_contract_price, dec!(2000));
        assert_eq!(strategy.last_contract_at, Some(at(9, 10)));
        assert!(s.orders.active_by_strategy("S1").is_empty());
    }

    #[tokio::test]
    async fn test_confirm_twice_applies_nothing_new() {
        let s = stores();
        s.strategies.save(sample_strategy("S1"));
        let local = order("O1", "S1", 1);
        s.orders.save(local.clone());
        // Partially filled, stays active so the second pass sees it again
        let remote = security(
            &local,
            OrderStatus::InOrder,
            vec![fill("O1", "E1", dec!(2000), dec!(1), 10)],
        );

        let r = reconciler(&s, broker_with(vec![remote]), at(9, 10));
        assert_eq!(r.confirm(&sample_strategy("S1")).await.unwrap(), 1);
        let strategies = s.strategies.snapshot();
        let orders = s.orders.snapshot();
        let positions = s.positions.snapshot();

        assert_eq!(r.confirm(&sample_strategy("S1")).await.unwrap(), 0);
        assert_eq!(s.strategies.snapshot(), strategies);
        assert_eq!(s.orders.snapshot(), orders);
        assert_eq!(s.positions.snapshot(), positions);
    }

    #[tokio::test]
    async fn test_no_active_orders_skips_broker() {
        let s = stores();
        s.strategies.save(sample_strategy("S1"));
        let mut broker = MockBrokerClient::new();
        broker.expect_get_orders().never();

        let r = reconciler(&s, broker, at(9, 10));
        assert_eq!(r.confirm(&sample_strategy("S1")).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_confirm_looks_back_from_last_contract() {
        let s = stores();
        let mut strategy = sample_strategy("S1");
        strategy.last_contract_at = Some(at(9, 10));
        s.strategies.save(strategy.clone());
        s.orders.save(order("O1", "S1", 1));

        let mut broker = MockBrokerClient::new();
        broker
            .expect_get_orders()
            .withf(|product, symbol, since| {
                *product == Product::Stock && symbol == "1475" && *since == Some(at(9, 9))
            })
            .times(1)
            .returning(|_, _, _| Ok(Vec::new()));

        let r = reconciler(&s, broker, at(9, 20));
        assert_eq!(r.confirm(&strategy).await.unwrap(), 0);
    }

    // =========================================================================
    // Exit fills
    // =========================================================================

    #[tokio::test]
    async fn test_exit_fill_split_across_holds_in_order() {
        let s = stores();
        s.strategies.save(sample_strategy("S1"));
        s.positions.save(position("E1", "S1", dec!(100), 1));
        s.positions.save(position("E2", "S1", dec!(100), 2));
        s.positions.hold("E1", dec!(100)).unwrap();
        s.positions.hold("E2", dec!(100)).unwrap();
        let local = exit_order(
            "O9",
            Side::Sell,
            dec!(200),
            vec![
                HoldPosition::new("E1", dec!(2000), dec!(100)),
                HoldPosition::new("E2", dec!(2000), dec!(100)),
            ],
        );
        s.orders.save(local.clone());
        let remote = security(
            &local,
            OrderStatus::InOrder,
            vec![fill("O9", "X1", dec!(2010), dec!(150), 20)],
        );

        let r = reconciler(&s, broker_with(vec![remote]), at(9, 20));
        r.confirm(&sample_strategy("S1")).await.unwrap();

        let e1 = s.positions.get("E1").unwrap();
        let e2 = s.positions.get("E2").unwrap();
        assert_eq!((e1.owned_quantity, e1.hold_quantity), (Decimal::ZERO, Decimal::ZERO));
        assert_eq!((e2.owned_quantity, e2.hold_quantity), (dec!(50), dec!(50)));

        let stored = s.orders.get("O9").unwrap();
        assert_eq!(stored.hold_positions[0].contract_quantity, dec!(100));
        assert_eq!(stored.hold_positions[1].contract_quantity, dec!(50));
        assert_eq!(
            s.strategies.by_code("S1").unwrap().cash,
            dec!(1_000_000) + dec!(2010) * dec!(150)
        );
    }

    #[tokio::test]
    async fn test_short_cover_credits_collateral_difference() {
        let s = stores();
        let mut strategy = sample_strategy("S1");
        strategy.entry_side = Side::Sell;
        strategy.cash = Decimal::ZERO;
        s.strategies.save(strategy.clone());
        let mut short = position("E1", "S1", dec!(20), 1);
        short.side = Side::Sell;
        short.price = dec!(2110);
        s.positions.save(short);
        s.positions.hold("E1", dec!(20)).unwrap();
        let local = exit_order(
            "O9",
            Side::Buy,
            dec!(20),
            vec![HoldPosition::new("E1", dec!(2110), dec!(20))],
        );
        s.orders.save(local.clone());
        let remote = security(
            &local,
            OrderStatus::Done,
            vec![fill("O9", "X1", dec!(2070), dec!(20), 20)],
        );

        let r = reconciler(&s, broker_with(vec![remote]), at(9, 20));
        r.confirm(&strategy).await.unwrap();

        assert_eq!(s.strategies.by_code("S1").unwrap().cash, dec!(2150) * dec!(20));
        assert!(s.positions.active_by_strategy("S1").is_empty());
    }

    #[tokio::test]
    async fn test_canceled_exit_releases_unfilled_holds() {
        let s = stores();
        s.strategies.save(sample_strategy("S1"));
        s.positions.save(position("E1", "S1", dec!(100), 1));
        s.positions.hold("E1", dec!(100)).unwrap();
        let local = exit_order(
            "O9",
            Side::Sell,
            dec!(100),
            vec![HoldPosition::new("E1", dec!(2000), dec!(100))],
        );
        s.orders.save(local.clone());
        let mut remote = security(
            &local,
            OrderStatus::Canceled,
            vec![fill("O9", "X1", dec!(2005), dec!(30), 20)],
        );
        remote.canceled_at = Some(at(9, 25));

        let r = reconciler(&s, broker_with(vec![remote]), at(9, 25));
        r.confirm(&sample_strategy("S1")).await.unwrap();

        let p = s.positions.get("E1").unwrap();
        assert_eq!(p.owned_quantity, dec!(70));
        assert_eq!(p.hold_quantity, Decimal::ZERO);
        let stored = s.orders.get("O9").unwrap();
        assert_eq!(stored.status, OrderStatus::Canceled);
        assert_eq!(stored.hold_positions[0].release_quantity, dec!(70));
        assert_eq!(stored.hold_leave_quantity(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_canceled_entry_does_not_touch_positions() {
        let s = stores();
        s.strategies.save(sample_strategy("S1"));
        let local = order("O1", "S1", 1);
        s.orders.save(local.clone());
        let remote = security(&local, OrderStatus::Canceled, Vec::new());

        let r = reconciler(&s, broker_with(vec![remote]), at(9, 25));
        assert_eq!(r.confirm(&sample_strategy("S1")).await.unwrap(), 0);

        assert_eq!(s.orders.get("O1").unwrap().status, OrderStatus::Canceled);
        assert!(s.positions.snapshot().is_empty());
        assert_eq!(s.strategies.by_code("S1").unwrap().cash, dec!(1_000_000));
    }

    // =========================================================================
    // Contract-price bookkeeping
    // =========================================================================

    fn grid_strategy() -> Strategy {
        let mut strategy = sample_strategy("S1");
        strategy.grid.runnable = true;
        strategy.grid.time_ranges = vec![TimeRange::new(
            NaiveTime::from_hms_opt(9, 0, 0).unwrap(),
            NaiveTime::from_hms_opt(11, 30, 0).unwrap(),
        )];
        strategy
    }

    #[tokio::test]
    async fn test_session_high_low_tracking() {
        let s = stores();
        let mut strategy = grid_strategy();
        // Left over from the previous session
        let yesterday = at(10, 0) - Duration::days(1);
        strategy.max_contract_price = dec!(2500);
        strategy.max_contract_at = Some(yesterday);
        strategy.min_contract_price = dec!(1500);
        strategy.min_contract_at = Some(yesterday);
        s.strategies.save(strategy.clone());

        let local = order("O1", "S1", 1);
        s.orders.save(local.clone());
        let remote = security(
            &local,
            OrderStatus::InOrder,
            vec![
                fill("O1", "E1", dec!(2000), dec!(1), 10),
                fill("O1", "E2", dec!(1990), dec!(1), 11),
            ],
        );
        let r = reconciler(&s, broker_with(vec![remote]), at(9, 12));
        r.confirm(&strategy).await.unwrap();

        let updated = s.strategies.by_code("S1").unwrap();
        assert_eq!(updated.max_contract_price, dec!(2000));
        assert_eq!(updated.max_contract_at, Some(at(9, 10)));
        assert_eq!(updated.min_contract_price, dec!(1990));
        assert_eq!(updated.min_contract_at, Some(at(9, 11)));
        assert_eq!(updated.last_contract_price, dec!(1990));
    }

    #[tokio::test]
    async fn test_stale_fill_does_not_move_last_price() {
        let s = stores();
        let mut strategy = sample_strategy("S1");
        strategy.last_contract_price = dec!(2100);
        strategy.last_contract_at = Some(at(9, 30));
        s.strategies.save(strategy.clone());
        let local = order("O1", "S1", 1);
        s.orders.save(local.clone());
        let remote = security(
            &local,
            OrderStatus::Done,
            vec![fill("O1", "E1", dec!(2000), dec!(2), 29)],
        );

        let r = reconciler(&s, broker_with(vec![remote]), at(9, 31));
        assert_eq!(r.confirm(&strategy).await.unwrap(), 1);

        let updated = s.strategies.by_code("S1").unwrap();
        assert_eq!(updated.last_contract_price, dec!(2100));
        assert!(s.positions.get("E1").is_some());
    }

    // =========================================================================
    // Grid end sweep
    // =========================================================================

    #[tokio::test]
    async fn test_confirm_grid_end_only_right_after_range() {
        let s = stores();
        let strategy = grid_strategy();
        s.strategies.save(strategy.clone());
        s.orders.save(order("O1", "S1", 1));

        let mut broker = MockBrokerClient::new();
        broker
            .expect_get_orders()
            .withf(|_, _, since| *since == Some(at(9, 0)))
            .times(1)
            .returning(|_, _, _| Ok(Vec::new()));

        let r = reconciler(&s, broker, at(11, 30));
        assert_eq!(r.confirm_grid_end(&strategy).await.unwrap(), 0);

        let idle = reconciler(&s, MockBrokerClient::new(), at(11, 31));
        assert_eq!(idle.confirm_grid_end(&strategy).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_broker_failure_surfaces() {
        let s = stores();
        s.strategies.save(sample_strategy("S1"));
        s.orders.save(order("O1", "S1", 1));
        let mut broker = MockBrokerClient::new();
        broker
            .expect_get_orders()
            .returning(|_, _, _| Err(anyhow::anyhow!("timeout")));

        let r = reconciler(&s, broker, at(9, 10));
        let err = r.confirm(&sample_strategy("S1")).await.unwrap_err();
        assert!(matches!(err, EngineError::Broker(_)));
        assert_eq!(s.orders.get("O1").unwrap().execution_type, ExecutionType::Limit);
    }
}
