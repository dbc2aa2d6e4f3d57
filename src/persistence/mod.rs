//! Durable storage for strategies, orders and positions.
//!
//! The engine keeps authoritative state in memory (see `store`) and writes
//! behind to a `Ledger`. On startup the ledger is loaded back to hydrate
//! the in-memory stores.

use crate::model::{Order, Position, Strategy};
use anyhow::{Context, Result};
use async_trait::async_trait;
use rusqlite::{params, Connection};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::Mutex;
use tracing::{debug, info, warn};

/// Durable store behind the in-memory ledgers.
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn upsert_strategy(&self, strategy: &Strategy) -> Result<()>;
    async fn upsert_order(&self, order: &Order) -> Result<()>;
    async fn upsert_position(&self, position: &Position) -> Result<()>;

    async fn load_strategies(&self) -> Result<Vec<Strategy>>;
    async fn load_active_orders(&self) -> Result<Vec<Order>>;
    async fn load_active_positions(&self) -> Result<Vec<Position>>;
}

/// SQLite-backed ledger. Entities are stored as JSON bodies keyed by code.
pub struct SqliteLedger {
    conn: Mutex<Connection>,
}

impl SqliteLedger {
    /// Open (or create) the database and initialize the schema.
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;

        let ledger = Self {
            conn: Mutex::new(conn),
        };
        ledger.init_schema()?;

        info!("Ledger initialized at {:?}", db_path.as_ref());
        Ok(ledger)
    }

    fn init_schema(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS strategies (
                    code TEXT PRIMARY KEY,
                    body TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS orders (
                    code TEXT PRIMARY KEY,
                    strategy_code TEXT NOT NULL,
                    active INTEGER NOT NULL,
                    body TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_orders_active ON orders(active);

                CREATE TABLE IF NOT EXISTS positions (
                    code TEXT PRIMARY KEY,
                    strategy_code TEXT NOT NULL,
                    active INTEGER NOT NULL,
                    body TEXT NOT NULL,
                    updated_at TEXT NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_positions_active ON positions(active);
                "#,
            )?;
            Ok(())
        })?;
        debug!("Database schema initialized");
        Ok(())
    }

    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow::anyhow!("ledger connection mutex poisoned"))?;
        f(&conn)
    }

    fn load_bodies<T: DeserializeOwned>(&self, sql: &str) -> Result<Vec<T>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let bodies: Vec<String> = stmt
                .query_map([], |row| row.get(0))?
                .collect::<rusqlite::Result<_>>()?;

            let mut entities = Vec::with_capacity(bodies.len());
            for body in bodies {
                match serde_json::from_str(&body) {
                    Ok(entity) => entities.push(entity),
                    Err(e) => warn!(error = %e, "Skipping undecodable ledger row"),
                }
            }
            Ok(entities)
        })
    }
}

fn to_body<T: Serialize>(entity: &T) -> Result<String> {
    serde_json::to_string(entity).context("Failed to encode ledger entity")
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

#[async_trait]
impl Ledger for SqliteLedger {
    async fn upsert_strategy(&self, strategy: &Strategy) -> Result<()> {
        let body = to_body(strategy)?;
        self.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT INTO strategies (code, body, updated_at) VALUES (?1, ?2, ?3)
                ON CONFLICT(code) DO UPDATE SET body = ?2, updated_at = ?3
                "#,
                params![strategy.code, body, now_rfc3339()],
            )?;
            Ok(())
        })
    }

    async fn upsert_order(&self, order: &Order) -> Result<()> {
        let body = to_body(order)?;
        self.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT INTO orders (code, strategy_code, active, body, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(code) DO UPDATE SET active = ?3, body = ?4, updated_at = ?5
                "#,
                params![
                    order.code,
                    order.strategy_code,
                    order.is_active() as i32,
                    body,
                    now_rfc3339()
                ],
            )?;
            Ok(())
        })
    }

    async fn upsert_position(&self, position: &Position) -> Result<()> {
        let body = to_body(position)?;
        self.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT INTO positions (code, strategy_code, active, body, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(code) DO UPDATE SET active = ?3, body = ?4, updated_at = ?5
                "#,
                params![
                    position.code,
                    position.strategy_code,
                    position.is_active() as i32,
                    body,
                    now_rfc3339()
                ],
            )?;
            Ok(())
        })
    }

    async fn load_strategies(&self) -> Result<Vec<Strategy>> {
        self.load_bodies("SELECT body FROM strategies ORDER BY code")
    }

    async fn load_active_orders(&self) -> Result<Vec<Order>> {
        self.load_bodies("SELECT body FROM orders WHERE active = 1")
    }

    async fn load_active_positions(&self) -> Result<Vec<Position>> {
        self.load_bodies("SELECT body FROM positions WHERE active = 1")
    }
}
