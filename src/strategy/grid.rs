//! Grid leveling: keeps a symmetric ladder of resting limit orders around
//! a moving base price.

use super::executor::OrderExecutor;
use crate::error::{EngineError, Result};
use crate::exchange::{BrokerClient, SymbolQuote};
use crate::market::{tick_added_price, ticks, TickGroup};
use crate::model::{
    ExecutionType, Rounding, Side, SortOrder, Strategy, TimeRange, WidthOperation,
};
use crate::store::OrderLedger;
use crate::utils::clock::{Clock, Timestamp};
use crate::utils::decimal::round_half_away;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument};

/// Widest band, in ticks either side of the base, the ladder may cover.
pub const MAX_GRID_SPAN_TICKS: i64 = 10_000;

pub struct GridEngine {
    broker: Arc<dyn BrokerClient>,
    orders: Arc<OrderLedger>,
    executor: Arc<OrderExecutor>,
    clock: Arc<dyn Clock>,
    /// Trading session used to judge whether a price is current
    session: TimeRange,
}

impl GridEngine {
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        orders: Arc<OrderLedger>,
        executor: Arc<OrderExecutor>,
        clock: Arc<dyn Clock>,
        session: TimeRange,
    ) -> Self {
        Self {
            broker,
            orders,
            executor,
            clock,
            session,
        }
    }

    /// Cancel rungs that drifted out of the band and top up the missing ones.
    ///
    /// Rungs on the entry side become entry limits; rungs on the other side
    /// become exit limits closing the newest positions first. The first
    /// failed cancel or submission aborts the pass.
    #[instrument(skip(self, strategy), fields(strategy = %strategy.code))]
    pub async fn leveling(&self, strategy: &Strategy) -> Result<()> {
        let now = self.clock.now();
        if !strategy.grid.is_running(&now) {
            return Ok(());
        }

        let resting: Vec<_> = self
            .orders
            .active_by_strategy(&strategy.code)
            .into_iter()
            .filter(|o| o.execution_type == ExecutionType::Limit)
            .collect();
        let quote = self.quote(strategy).await?;
        let base = self.resolve_base_price(strategy, &quote, &now)?;
        let group = quote.tick_group;
        let width = grid_width(strategy, group, &now)?;

        let grids = strategy.grid.number_of_grids;
        let span = width
            .checked_mul(grids)
            .filter(|span| *span <= MAX_GRID_SPAN_TICKS)
            .ok_or_else(|| {
                EngineError::InvalidArgument(format!(
                    "grid span of {} x {} ticks exceeds {}",
                    width, grids, MAX_GRID_SPAN_TICKS
                ))
            })?;
        let upper = tick_added_price(group, base, span);
        let lower = tick_added_price(group, base, -span);

        let mut resting_quantity: BTreeMap<Decimal, Decimal> = BTreeMap::new();
        for order in resting {
            if order.price < lower || order.price > upper {
                debug!(order = %order.code, price = %order.price, "Rung out of band, canceling");
                self.executor.cancel(strategy, &order.code).await?;
                continue;
            }
            *resting_quantity.entry(order.price).or_default() += order.unfilled_quantity();
        }
        let at_base = resting_quantity.get(&base).copied().unwrap_or_default();

        for i in 1..=grids {
            for direction in [-1, 1] {
                let price = tick_added_price(group, base, direction * i * width);
                let mut quantity = strategy.grid.quantity
                    - resting_quantity.get(&price).copied().unwrap_or_default();
                if i == 1 {
                    quantity -= at_base;
                }
                if quantity <= Decimal::ZERO {
                    continue;
                }

                let side = match price.cmp(&base) {
                    Ordering::Less => Side::Buy,
                    Ordering::Greater => Side::Sell,
                    Ordering::Equal => {
                        return Err(EngineError::UndecidableValue(format!(
                            "rung {} resolves to base price {}",
                            i * direction,
                            base
                        )))
                    }
                };
                if side == strategy.entry_side {
                    self.executor
                        .entry_limit(&strategy.code, price, quantity)
                        .await?;
                } else {
                    self.executor
                        .exit_limit(&strategy.code, price, quantity, SortOrder::Newest)
                        .await?;
                }
            }
        }

        info!(%base, width, grids, "Grid leveled");
        Ok(())
    }

    /// The price the ladder is centered on.
    ///
    /// The last fill if it happened during today's session, otherwise the
    /// broker's last traded price if that is from today's session.
    pub async fn base_price(&self, strategy: &Strategy) -> Result<Decimal> {
        let quote = self.quote(strategy).await?;
        self.resolve_base_price(strategy, &quote, &self.clock.now())
    }

    async fn quote(&self, strategy: &Strategy) -> Result<SymbolQuote> {
        self.broker
            .get_symbol_quote(&strategy.symbol_code, &strategy.exchange)
            .await
            .map_err(EngineError::Broker)
    }

    fn resolve_base_price(
        &self,
        strategy: &Strategy,
        quote: &SymbolQuote,
        now: &Timestamp,
    ) -> Result<Decimal> {
        if let Some(at) = strategy.last_contract_at {
            if strategy.last_contract_price > Decimal::ZERO && self.same_session(now, &at) {
                return Ok(strategy.last_contract_price);
            }
        }

        match quote.price_at {
            Some(at) if quote.price > Decimal::ZERO && self.same_session(now, &at) => {
                Ok(quote.price)
            }
            _ => Err(EngineError::CannotGetBasePrice(strategy.symbol_code.clone())),
        }
    }

    fn same_session(&self, now: &Timestamp, at: &Timestamp) -> bool {
        let at = at.with_timezone(now.offset());
        now.date_naive() == at.date_naive()
            && self.session.contains(now.time())
            && self.session.contains(at.time())
    }
}

/// Rung spacing in ticks.
///
/// With a dynamic setting and a session high/low recorded since the current
/// grid range started, the spread between them (in ticks, divided and
/// rounded) is added to or multiplies the static width. Ticks are counted
/// in the broker's tick group for the symbol. A dynamic width has no
/// meaning outside the grid's time ranges.
pub fn grid_width(strategy: &Strategy, group: TickGroup, now: &Timestamp) -> Result<i64> {
    let grid = &strategy.grid;
    let mut width = grid.width;

    if let Some(dynamic) = &grid.dynamic_min_max {
        let range = grid.range_at(now).ok_or(EngineError::NotExistsTimeRange)?;
        let session_start = range.start_on(now);
        let recorded = |at: Option<Timestamp>| at.is_some_and(|at| at >= session_start);
        if recorded(strategy.max_contract_at) && recorded(strategy.min_contract_at) {
            if dynamic.divide <= Decimal::ZERO {
                return Err(EngineError::InvalidArgument(format!(
                    "dynamic grid divide must be positive, got {}",
                    dynamic.divide
                )));
            }
            let spread = Decimal::from(ticks(
                group,
                strategy.min_contract_price,
                strategy.max_contract_price,
            ));
            let term = spread / dynamic.divide;
            let term = match dynamic.rounding {
                Rounding::Floor => term.floor(),
                Rounding::Round => round_half_away(term),
                Rounding::Ceil => term.ceil(),
            }
            .to_i64()
            .unwrap_or(0);
            width = match dynamic.operation {
                WidthOperation::Add => width.checked_add(term),
                WidthOperation::Multiply => width.checked_mul(term),
            }
            .ok_or_else(|| {
                EngineError::InvalidArgument(format!("dynamic grid width overflows: {}", term))
            })?;
        }
    }

    match width.cmp(&0) {
        Ordering::Equal => Err(EngineError::ZeroGridWidth),
        Ordering::Less => Err(EngineError::InvalidArgument(format!(
            "grid width must be positive, got {}",
            width
        ))),
        Ordering::Greater => Ok(width),
    }
}
