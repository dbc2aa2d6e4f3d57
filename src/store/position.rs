//! In-memory authoritative position ledger.

use super::WriteBehind;
use crate::error::{EngineError, Result};
use crate::model::Position;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Positions keyed by code. Every mutation and every active-list read goes
/// through one mutex; the lock is never held across an await.
pub struct PositionLedger {
    positions: Mutex<HashMap<String, Position>>,
    writes: WriteBehind,
}

impl PositionLedger {
    pub fn new(writes: WriteBehind) -> Self {
        Self {
            positions: Mutex::new(HashMap::new()),
            writes,
        }
    }

    /// Hydrate from previously persisted positions without writing back.
    pub fn load(&self, positions: Vec<Position>) {
        let mut map = self.lock();
        for position in positions {
            map.insert(position.code.clone(), position);
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Position>> {
        self.positions.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn save(&self, position: Position) {
        let mut map = self.lock();
        map.insert(position.code.clone(), position.clone());
        self.writes.position(position);
    }

    pub fn get(&self, code: &str) -> Option<Position> {
        self.lock().get(code).cloned()
    }

    /// Active positions of a strategy, oldest fill first.
    pub fn active_by_strategy(&self, strategy_code: &str) -> Vec<Position> {
        let mut positions: Vec<Position> = self
            .lock()
            .values()
            .filter(|p| p.strategy_code == strategy_code && p.is_active())
            .cloned()
            .collect();
        positions.sort_by(|a, b| a.contracted_at.cmp(&b.contracted_at));
        positions
    }

    /// Reserve `quantity` of a position for an exit order.
    ///
    /// Unknown codes are a no-op. Fails if the position does not have that
    /// much unreserved quantity at the moment of the call.
    pub fn hold(&self, code: &str, quantity: Decimal) -> Result<()> {
        ensure_positive(code, quantity)?;
        let mut map = self.lock();
        let Some(position) = map.get_mut(code) else {
            debug!(position = %code, "Hold on unknown position ignored");
            return Ok(());
        };
        if quantity > position.leave_quantity() {
            return Err(EngineError::InsufficientPosition {
                requested: quantity,
                available: position.leave_quantity(),
            });
        }
        position.hold_quantity += quantity;
        self.writes.position(position.clone());
        Ok(())
    }

    /// Return a reservation. Unknown codes are a no-op.
    pub fn release(&self, code: &str, quantity: Decimal) -> Result<()> {
        ensure_positive(code, quantity)?;
        let mut map = self.lock();
        let Some(position) = map.get_mut(code) else {
            debug!(position = %code, "Release on unknown position ignored");
            return Ok(());
        };
        if quantity > position.hold_quantity {
            return Err(EngineError::InvalidQuantity {
                position_code: code.to_string(),
                quantity,
            });
        }
        position.hold_quantity -= quantity;
        self.writes.position(position.clone());
        Ok(())
    }

    /// Consume held shares that were filled by an exit order.
    /// Unknown codes are a no-op.
    pub fn exit_contract(&self, code: &str, quantity: Decimal) -> Result<()> {
        ensure_positive(code, quantity)?;
        let mut map = self.lock();
        let Some(position) = map.get_mut(code) else {
            debug!(position = %code, "Exit contract on unknown position ignored");
            return Ok(());
        };
        if quantity > position.hold_quantity {
            return Err(EngineError::InvalidQuantity {
                position_code: code.to_string(),
                quantity,
            });
        }
        position.owned_quantity -= quantity;
        position.hold_quantity -= quantity;
        self.writes.position(position.clone());
        Ok(())
    }

    /// Copy of every position, for status reporting and tests.
    pub fn snapshot(&self) -> Vec<Position> {
        let mut positions: Vec<Position> = self.lock().values().cloned().collect();
        positions.sort_by(|a, b| a.code.cmp(&b.code));
        positions
    }
}

fn ensure_positive(code: &str, quantity: Decimal) -> Result<()> {
    if quantity <= Decimal::ZERO {
        return Err(EngineError::InvalidArgument(format!(
            "quantity {} for position {} must be positive",
            quantity, code
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::test_support::{position, write_behind};
    use rust_decimal_macros::dec;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_persisted_row_tracks_concurrent_mutations() {
        use crate::persistence::{Ledger, SqliteLedger};
        use std::sync::Arc;

        let durable = Arc::new(SqliteLedger::open(":memory:").unwrap());
        let writes = WriteBehind::spawn(durable.clone());
        let ledger = Arc::new(PositionLedger::new(writes.clone()));
        ledger.save(position("E1", "S1", dec!(1000), 1));

        let workers: Vec<_> = (0..4)
            .map(|worker| {
                let ledger = ledger.clone();
                std::thread::spawn(move || {
                    for i in 0..200 {
                        ledger.hold("E1", dec!(1)).unwrap();
                        if (i + worker) % 3 == 0 {
                            ledger.release("E1", dec!(1)).unwrap();
                        }
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }
        writes.flush().await;

        let persisted = durable.load_active_positions().await.unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0], ledger.get("E1").unwrap());
    }

    #[tokio::test]
    async fn test_hold_and_release() {
        let ledger = PositionLedger::new(write_behind());
        ledger.save(position("E1", "S1", dec!(100), 1));

        ledger.hold("E1", dec!(60)).unwrap();
        assert_eq!(ledger.get("E1").unwrap().hold_quantity, dec!(60));
        assert_eq!(ledger.get("E1").unwrap().leave_quantity(), dec!(40));

        ledger.release("E1", dec!(60)).unwrap();
        assert_eq!(ledger.get("E1").unwrap().hold_quantity, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_hold_beyond_leave_fails_and_leaves_position_unchanged() {
        let ledger = PositionLedger::new(write_behind());
        ledger.save(position("E1", "S1", dec!(100), 1));
        ledger.hold("E1", dec!(80)).unwrap();

        let err = ledger.hold("E1", dec!(30)).unwrap_err();
        assert!(matches!(err, EngineError::InsufficientPosition { .. }));
        assert_eq!(ledger.get("E1").unwrap().hold_quantity, dec!(80));
    }

    #[tokio::test]
    async fn test_unknown_code_is_noop() {
        let ledger = PositionLedger::new(write_behind());
        ledger.save(position("E1", "S1", dec!(100), 1));
        let before = ledger.snapshot();

        tokio_test::assert_ok!(ledger.hold("missing", dec!(10)));
        tokio_test::assert_ok!(ledger.release("missing", dec!(10)));
        tokio_test::assert_ok!(ledger.exit_contract("missing", dec!(10)));

        assert_eq!(ledger.snapshot(), before);
    }

    #[tokio::test]
    async fn test_exit_contract_reduces_owned_and_hold() {
        let ledger = PositionLedger::new(write_behind());
        ledger.save(position("E1", "S1", dec!(100), 1));
        ledger.hold("E1", dec!(100)).unwrap();

        ledger.exit_contract("E1", dec!(100)).unwrap();
        let p = ledger.get("E1").unwrap();
        assert_eq!(p.owned_quantity, Decimal::ZERO);
        assert_eq!(p.hold_quantity, Decimal::ZERO);
        assert!(ledger.active_by_strategy("S1").is_empty());
    }

    #[tokio::test]
    async fn test_release_more_than_held_is_rejected() {
        let ledger = PositionLedger::new(write_behind());
        ledger.save(position("E1", "S1", dec!(100), 1));
        ledger.hold("E1", dec!(10)).unwrap();

        tokio_test::assert_err!(ledger.release("E1", dec!(11)));
        tokio_test::assert_err!(ledger.hold("E1", Decimal::ZERO));
    }

    #[tokio::test]
    async fn test_active_by_strategy_sorted_by_fill_time() {
        let ledger = PositionLedger::new(write_behind());
        ledger.save(position("E3", "S1", dec!(100), 3));
        ledger.save(position("E1", "S1", dec!(100), 1));
        ledger.save(position("E2", "S2", dec!(100), 2));

        let codes: Vec<String> = ledger
            .active_by_strategy("S1")
            .into_iter()
            .map(|p| p.code)
            .collect();
        assert_eq!(codes, vec!["E1", "E3"]);
    }
}
