//! In-memory authoritative order ledger.

use super::WriteBehind;
use crate::model::Order;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

/// Orders keyed by broker code.
pub struct OrderLedger {
    orders: Mutex<HashMap<String, Order>>,
    writes: WriteBehind,
}

impl OrderLedger {
    pub fn new(writes: WriteBehind) -> Self {
        Self {
            orders: Mutex::new(HashMap::new()),
            writes,
        }
    }

    /// Hydrate from previously persisted orders without writing back.
    pub fn load(&self, orders: Vec<Order>) {
        let mut map = self.lock();
        for order in orders {
            map.insert(order.code.clone(), order);
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Order>> {
        self.orders.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn save(&self, order: Order) {
        let mut map = self.lock();
        map.insert(order.code.clone(), order.clone());
        self.writes.order(order);
    }

    pub fn get(&self, code: &str) -> Option<Order> {
        self.lock().get(code).cloned()
    }

    /// In-order orders of a strategy, oldest first.
    pub fn active_by_strategy(&self, strategy_code: &str) -> Vec<Order> {
        let mut orders: Vec<Order> = self
            .lock()
            .values()
            .filter(|o| o.strategy_code == strategy_code && o.is_active())
            .cloned()
            .collect();
        orders.sort_by(|a, b| a.ordered_at.cmp(&b.ordered_at));
        orders
    }

    pub fn snapshot(&self) -> Vec<Order> {
        let mut orders: Vec<Order> = self.lock().values().cloned().collect();
        orders.sort_by(|a, b| a.code.cmp(&b.code));
        orders
    }
}
