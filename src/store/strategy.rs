//! In-memory authoritative strategy ledger.

use super::WriteBehind;
use crate::error::{EngineError, Result};
use crate::model::Strategy;
use crate::utils::clock::Timestamp;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

pub struct StrategyLedger {
    strategies: Mutex<HashMap<String, Strategy>>,
    writes: WriteBehind,
}

impl StrategyLedger {
    pub fn new(writes: WriteBehind) -> Self {
        Self {
            strategies: Mutex::new(HashMap::new()),
            writes,
        }
    }

    /// Hydrate from previously persisted strategies without writing back.
    pub fn load(&self, strategies: Vec<Strategy>) {
        let mut map = self.lock();
        for strategy in strategies {
            map.insert(strategy.code.clone(), strategy);
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Strategy>> {
        self.strategies.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn save(&self, strategy: Strategy) {
        let mut map = self.lock();
        map.insert(strategy.code.clone(), strategy.clone());
        self.writes.strategy(strategy);
    }

    pub fn by_code(&self, code: &str) -> Result<Strategy> {
        self.lock()
            .get(code)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("strategy {}", code)))
    }

    /// Runnable strategies, ordered by code.
    pub fn runnable(&self) -> Vec<Strategy> {
        let mut strategies: Vec<Strategy> =
            self.lock().values().filter(|s| s.runnable).cloned().collect();
        strategies.sort_by(|a, b| a.code.cmp(&b.code));
        strategies
    }

    pub fn snapshot(&self) -> Vec<Strategy> {
        let mut strategies: Vec<Strategy> = self.lock().values().cloned().collect();
        strategies.sort_by(|a, b| a.code.cmp(&b.code));
        strategies
    }

    /// Adjust cash by `delta`. Unknown codes are a no-op.
    pub fn add_cash(&self, code: &str, delta: Decimal) {
        self.update(code, |s| s.cash += delta);
    }

    /// Overwrite the last contract price and time.
    pub fn set_contract(&self, code: &str, price: Decimal, at: Timestamp) {
        self.update(code, |s| {
            s.last_contract_price = price;
            s.last_contract_at = Some(at);
        });
    }

    pub fn set_max_contract(&self, code: &str, price: Decimal, at: Timestamp) {
        self.update(code, |s| {
            s.max_contract_price = price;
            s.max_contract_at = Some(at);
        });
    }

    pub fn set_min_contract(&self, code: &str, price: Decimal, at: Timestamp) {
        self.update(code, |s| {
            s.min_contract_price = price;
            s.min_contract_at = Some(at);
        });
    }

    fn update(&self, code: &str, f: impl FnOnce(&mut Strategy)) {
        let mut map = self.lock();
        let Some(strategy) = map.get_mut(code) else {
            debug!(strategy = %code, "Update on unknown strategy ignored");
            return;
        };
        f(strategy);
        self.writes.strategy(strategy.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::{sample_strategy, write_behind};
    use crate::utils::clock::offset_hours;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_by_code_not_found() {
        let ledger = StrategyLedger::new(write_behind());
        assert!(matches!(
            ledger.by_code("missing"),
            Err(EngineError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_add_cash_and_unknown_noop() {
        let ledger = StrategyLedger::new(write_behind());
        ledger.save(sample_strategy("S1"));

        ledger.add_cash("S1", dec!(-1999));
        ledger.add_cash("missing", dec!(100));

        assert_eq!(ledger.by_code("S1").unwrap().cash, dec!(1_000_000) - dec!(1999));
        assert_eq!(ledger.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn test_set_contract_overwrites_unconditionally() {
        let ledger = StrategyLedger::new(write_behind());
        ledger.save(sample_strategy("S1"));
        let later = offset_hours(9).with_ymd_and_hms(2024, 6, 3, 10, 0, 0).unwrap();
        let earlier = offset_hours(9).with_ymd_and_hms(2024, 6, 3, 9, 0, 0).unwrap();

        ledger.set_contract("S1", dec!(2001), later);
        ledger.set_contract("S1", dec!(1999), earlier);

        let s = ledger.by_code("S1").unwrap();
        assert_eq!(s.last_contract_price, dec!(1999));
        assert_eq!(s.last_contract_at, Some(earlier));
    }

    #[tokio::test]
    async fn test_runnable_filters() {
        let ledger = StrategyLedger::new(write_behind());
        ledger.save(sample_strategy("S1"));
        let mut stopped = sample_strategy("S2");
        stopped.runnable = false;
        ledger.save(stopped);

        let runnable = ledger.runnable();
        assert_eq!(runnable.len(), 1);
        assert_eq!(runnable[0].code, "S1");
    }
}
