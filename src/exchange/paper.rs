//! Paper broker for simulated trading and integration tests.
//!
//! Market orders fill immediately at the current quote. Limit orders rest
//! until a quote update trades through them, then fill in full at the
//! limit price. Every fill gets a fresh execution code, which becomes the
//! code of the position it opens.

use super::traits::BrokerClient;
use super::types::*;
use crate::model::{Contract, ExecutionType, Order, OrderStatus, Product, Side, Strategy};
use crate::utils::clock::{Clock, Timestamp};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

#[derive(Debug, Clone)]
struct PaperOrder {
    order: SecurityOrder,
    updated_at: Timestamp,
}

#[derive(Debug, Default)]
struct PaperState {
    quotes: HashMap<String, SymbolQuote>,
    orders: HashMap<String, PaperOrder>,
    reject_submissions: u32,
    fail_submissions: u32,
}

/// In-process broker simulation.
pub struct PaperBroker {
    state: Arc<RwLock<PaperState>>,
    order_seq: AtomicU64,
    execution_seq: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl PaperBroker {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(RwLock::new(PaperState::default())),
            order_seq: AtomicU64::new(1),
            execution_seq: AtomicU64::new(1),
            clock,
        }
    }

    /// Publish a quote and fill any resting limit orders it trades through.
    pub async fn set_quote(&self, quote: SymbolQuote) {
        let now = self.clock.now();
        let mut state = self.state.write().await;

        let crossed: Vec<(String, Decimal, Decimal)> = state
            .orders
            .values()
            .filter(|p| {
                let o = &p.order;
                o.symbol_code == quote.symbol_code
                    && o.status == OrderStatus::InOrder
                    && o.execution_type == ExecutionType::Limit
                    && match o.side {
                        Side::Buy => quote.price <= o.price,
                        Side::Sell => quote.price >= o.price,
                    }
            })
            .map(|p| {
                (
                    p.order.code.clone(),
                    p.order.price,
                    p.order.order_quantity - p.order.contract_quantity,
                )
            })
            .collect();

        for (code, price, quantity) in crossed {
            self.fill_locked(&mut state, &code, price, quantity, now);
        }

        state.quotes.insert(quote.symbol_code.clone(), quote);
    }

    /// Fill part or all of an active order at `price`.
    pub async fn fill(&self, code: &str, price: Decimal, quantity: Decimal) -> Result<()> {
        let now = self.clock.now();
        let mut state = self.state.write().await;
        let order = state
            .orders
            .get(code)
            .ok_or_else(|| anyhow!("unknown paper order {}", code))?;
        if order.order.status != OrderStatus::InOrder {
            return Err(anyhow!("paper order {} is not active", code));
        }
        self.fill_locked(&mut state, code, price, quantity, now);
        Ok(())
    }

    /// Reject the next `n` submissions.
    pub async fn reject_next(&self, n: u32) {
        self.state.write().await.reject_submissions = n;
    }

    /// Fail the next `n` submissions with a transport error.
    pub async fn fail_next(&self, n: u32) {
        self.state.write().await.fail_submissions = n;
    }

    /// Every order the broker knows about, ordered by code.
    pub async fn orders(&self) -> Vec<SecurityOrder> {
        let state = self.state.read().await;
        let mut orders: Vec<SecurityOrder> =
            state.orders.values().map(|p| p.order.clone()).collect();
        orders.sort_by_key(|o| o.code[1..].parse::<u64>().unwrap_or(0));
        orders
    }

    fn next_order_code(&self) -> String {
        format!("P{}", self.order_seq.fetch_add(1, Ordering::SeqCst))
    }

    fn next_execution_code(&self) -> String {
        format!("E{}", self.execution_seq.fetch_add(1, Ordering::SeqCst))
    }

    fn fill_locked(
        &self,
        state: &mut PaperState,
        code: &str,
        price: Decimal,
        quantity: Decimal,
        now: Timestamp,
    ) {
        let position_code = self.next_execution_code();
        let Some(paper) = state.orders.get_mut(code) else {
            return;
        };
        let order = &mut paper.order;
        let quantity = quantity.min(order.order_quantity - order.contract_quantity);
        if quantity <= Decimal::ZERO {
            return;
        }

        order.contracts.push(Contract {
            order_code: order.code.clone(),
            position_code,
            price,
            quantity,
            contracted_at: now,
        });
        order.contract_quantity += quantity;
        order.contracted_at = Some(now);
        if order.contract_quantity >= order.order_quantity {
            order.status = OrderStatus::Done;
        }
        paper.updated_at = now;

        info!(
            order = %code,
            side = ?paper.order.side,
            %price,
            %quantity,
            "Paper order filled"
        );
    }
}

#[async_trait]
impl BrokerClient for PaperBroker {
    async fn get_symbol_quote(&self, symbol_code: &str, _exchange: &str) -> Result<SymbolQuote> {
        self.state
            .read()
            .await
            .quotes
            .get(symbol_code)
            .cloned()
            .ok_or_else(|| anyhow!("no quote for {}", symbol_code))
    }

    async fn get_orders(
        &self,
        product: Product,
        symbol_code: &str,
        since: Option<Timestamp>,
    ) -> Result<Vec<SecurityOrder>> {
        let state = self.state.read().await;
        Ok(state
            .orders
            .values()
            .filter(|p| p.order.product == product && p.order.symbol_code == symbol_code)
            .filter(|p| since.map_or(true, |since| p.updated_at >= since))
            .map(|p| p.order.clone())
            .collect())
    }

    #[instrument(skip(self, strategy, order), fields(strategy = %strategy.code))]
    async fn submit_order(&self, strategy: &Strategy, order: &Order) -> Result<OrderResult> {
        let now = self.clock.now();
        let mut state = self.state.write().await;

        if state.fail_submissions > 0 {
            state.fail_submissions -= 1;
            return Err(anyhow!("paper broker connection reset"));
        }
        if state.reject_submissions > 0 {
            state.reject_submissions -= 1;
            debug!("Paper order rejected");
            return Ok(OrderResult::rejected());
        }

        let code = self.next_order_code();
        let security = SecurityOrder {
            code: code.clone(),
            symbol_code: order.symbol_code.clone(),
            exchange: order.exchange.clone(),
            product: order.product,
            side: order.side,
            execution_type: order.execution_type,
            price: order.price,
            order_quantity: order.order_quantity,
            contract_quantity: Decimal::ZERO,
            status: OrderStatus::InOrder,
            ordered_at: now,
            contracted_at: None,
            canceled_at: None,
            contracts: Vec::new(),
        };
        state.orders.insert(
            code.clone(),
            PaperOrder {
                order: security,
                updated_at: now,
            },
        );

        if order.execution_type != ExecutionType::Limit {
            if let Some(price) = state.quotes.get(&order.symbol_code).map(|q| q.price) {
                self.fill_locked(&mut state, &code, price, order.order_quantity, now);
            }
        }

        info!(
            %code,
            side = ?order.side,
            execution = ?order.execution_type,
            price = %order.price,
            quantity = %order.order_quantity,
            "Paper order accepted"
        );
        Ok(OrderResult::accepted(code))
    }

    async fn cancel_order(&self, _password: &str, order_code: &str) -> Result<CancelResult> {
        let now = self.clock.now();
        let mut state = self.state.write().await;
        let Some(paper) = state.orders.get_mut(order_code) else {
            return Ok(CancelResult { accepted: false });
        };
        if paper.order.status != OrderStatus::InOrder {
            return Ok(CancelResult { accepted: false });
        }
        paper.order.status = OrderStatus::Canceled;
        paper.order.canceled_at = Some(now);
        paper.updated_at = now;
        debug!(order = %order_code, "Paper order canceled");
        Ok(CancelResult { accepted: true })
    }
}
