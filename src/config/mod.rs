//! Configuration management for the grid trader.
//!
//! Loads settings from an optional `config.{toml,yaml,json}` file and
//! `GRID__`-prefixed environment variables.

use crate::market::TickGroup;
use crate::model::{Strategy, TimeRange};
use crate::strategy::MAX_GRID_SPAN_TICKS;
use crate::utils::clock::offset_hours;
use anyhow::{Context, Result};
use chrono::{FixedOffset, NaiveTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Pass intervals
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Market clock and trading session
    #[serde(default)]
    pub market: MarketConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    /// Ledger database and log locations
    #[serde(default)]
    pub persistence: PersistenceConfig,
    /// Paper broker seed data
    #[serde(default)]
    pub paper: PaperConfig,
    /// Strategies seeded into an empty ledger
    #[serde(default)]
    pub strategies: Vec<Strategy>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between reconciliation passes
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,
    /// Seconds between order-management passes
    #[serde(default = "default_order_interval")]
    pub order_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketConfig {
    /// Exchange-local UTC offset, in hours
    #[serde(default = "default_utc_offset_hours")]
    pub utc_offset_hours: i32,
    /// Prices timestamped outside `[session_start, session_end)` are stale
    #[serde(default = "default_session_start")]
    pub session_start: NaiveTime,
    #[serde(default = "default_session_end")]
    pub session_end: NaiveTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// How far before the last known fill to ask the broker for changes.
    /// Covers clock skew between broker cancel and fill timestamps.
    #[serde(default = "default_lookback_secs")]
    pub lookback_secs: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_db_path")]
    pub db_path: String,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PaperConfig {
    #[serde(default)]
    pub quotes: Vec<PaperQuote>,
}

/// Opening quote for one symbol on the paper broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaperQuote {
    pub symbol_code: String,
    pub exchange: String,
    pub price: Decimal,
    #[serde(default = "default_paper_trading_unit")]
    pub trading_unit: Decimal,
    #[serde(default)]
    pub tick_group: TickGroup,
}

// Default value functions
fn default_reconcile_interval() -> u64 {
    5
}

fn default_order_interval() -> u64 {
    60
}

fn default_utc_offset_hours() -> i32 {
    9 // JST
}

fn default_session_start() -> NaiveTime {
    NaiveTime::from_hms_opt(9, 0, 0).unwrap_or_default()
}

fn default_session_end() -> NaiveTime {
    NaiveTime::from_hms_opt(15, 0, 0).unwrap_or_default()
}

fn default_lookback_secs() -> i64 {
    60
}

fn default_db_path() -> String {
    "grid-trader.db".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

fn default_paper_trading_unit() -> Decimal {
    Decimal::ONE_HUNDRED
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("GRID"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.scheduler.reconcile_interval_secs > 0 && self.scheduler.order_interval_secs > 0,
            "scheduler intervals must be positive"
        );

        anyhow::ensure!(
            (-12..=14).contains(&self.market.utc_offset_hours),
            "utc_offset_hours must be between -12 and 14"
        );

        anyhow::ensure!(
            self.market.session_start < self.market.session_end,
            "session_start must be before session_end"
        );

        anyhow::ensure!(self.reconcile.lookback_secs >= 0, "lookback_secs must not be negative");

        let mut codes = HashSet::new();
        for strategy in &self.strategies {
            anyhow::ensure!(
                codes.insert(strategy.code.as_str()),
                "duplicate strategy code {}",
                strategy.code
            );
            validate_strategy(strategy)
                .with_context(|| format!("invalid strategy {}", strategy.code))?;
        }

        Ok(())
    }
}

fn validate_strategy(strategy: &Strategy) -> Result<()> {
    anyhow::ensure!(!strategy.code.is_empty(), "code must not be empty");
    anyhow::ensure!(strategy.cash >= Decimal::ZERO, "cash must not be negative");

    let grid = &strategy.grid;
    if grid.runnable {
        anyhow::ensure!(grid.quantity > Decimal::ZERO, "grid quantity must be positive");
        anyhow::ensure!(grid.number_of_grids >= 1, "number_of_grids must be at least 1");
        anyhow::ensure!(grid.width >= 0, "grid width must not be negative");
        anyhow::ensure!(
            grid.width
                .checked_mul(grid.number_of_grids)
                .is_some_and(|span| span <= MAX_GRID_SPAN_TICKS),
            "width x number_of_grids must not exceed {} ticks",
            MAX_GRID_SPAN_TICKS
        );
        anyhow::ensure!(
            grid.time_ranges.iter().all(|r| r.start < r.end),
            "grid time range start must be before end"
        );
        if let Some(dynamic) = &grid.dynamic_min_max {
            anyhow::ensure!(dynamic.divide > Decimal::ZERO, "dynamic divide must be positive");
        }
    }
    Ok(())
}

impl MarketConfig {
    pub fn offset(&self) -> FixedOffset {
        offset_hours(self.utc_offset_hours)
    }

    pub fn session(&self) -> TimeRange {
        TimeRange::new(self.session_start, self.session_end)
    }
}

impl ReconcileConfig {
    pub fn lookback(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lookback_secs)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: default_reconcile_interval(),
            order_interval_secs: default_order_interval(),
        }
    }
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            utc_offset_hours: default_utc_offset_hours(),
            session_start: default_session_start(),
            session_end: default_session_end(),
        }
    }
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            lookback_secs: default_lookback_secs(),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            log_dir: default_log_dir(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Side;
    use rust_decimal_macros::dec;

    fn from_toml(source: &str) -> Config {
        config::Config::builder()
            .add_source(config::File::from_str(source, config::FileFormat::Toml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scheduler.reconcile_interval_secs, 5);
        assert_eq!(config.scheduler.order_interval_secs, 60);
        assert_eq!(config.reconcile.lookback(), chrono::Duration::seconds(60));
        assert_eq!(config.market.offset().local_minus_utc(), 9 * 3600);
    }

    #[test]
    fn test_strategies_from_toml() {
        let config = from_toml(
            r#"
            [market]
            session_end = "15:30:00"

            [[strategies]]
            code = "S1"
            symbol_code = "1475"
            exchange = "TSE"
            entry_side = "buy"
            cash = 301065
            runnable = true

            [strategies.grid]
            runnable = true
            width = 1
            quantity = 2
            number_of_grids = 3
            time_ranges = [{ start = "09:00:00", end = "11:30:00" }]

            [[paper.quotes]]
            symbol_code = "1475"
            exchange = "TSE"
            price = 2000
            "#,
        );

        assert!(config.validate().is_ok());
        assert_eq!(
            config.market.session_end,
            NaiveTime::from_hms_opt(15, 30, 0).unwrap()
        );
        let strategy = &config.strategies[0];
        assert_eq!(strategy.entry_side, Side::Buy);
        assert_eq!(strategy.cash, dec!(301065));
        assert_eq!(strategy.grid.number_of_grids, 3);
        assert_eq!(strategy.grid.time_ranges.len(), 1);
        assert!(strategy.last_contract_at.is_none());
        assert_eq!(config.paper.quotes[0].price, dec!(2000));
    }

    #[test]
    fn test_validate_rejects_inverted_session() {
        let mut config = Config::default();
        config.market.session_start = NaiveTime::from_hms_opt(15, 0, 0).unwrap();
        config.market.session_end = NaiveTime::from_hms_opt(9, 0, 0).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_duplicate_strategy_codes() {
        let config = from_toml(
            r#"
            [[strategies]]
            code = "S1"
            symbol_code = "1475"
            exchange = "TSE"
            entry_side = "buy"
            cash = 1000

            [[strategies]]
            code = "S1"
            symbol_code = "1306"
            exchange = "TSE"
            entry_side = "sell"
            cash = 1000
            "#,
        );
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_validate_rejects_oversized_grid() {
        let mut config = Config::default();
        let mut strategy: Strategy = serde_json::from_str(
            r#"{"code":"S1","symbol_code":"1475","exchange":"TSE","entry_side":"buy","cash":"1000"}"#,
        )
        .unwrap();
        strategy.grid.runnable = true;
        strategy.grid.quantity = dec!(1);
        strategy.grid.width = i64::MAX;
        strategy.grid.number_of_grids = 2;
        config.strategies.push(strategy);
        assert!(config.validate().is_err());

        config.strategies[0].grid.width = 100;
        config.strategies[0].grid.number_of_grids = 100;
        assert!(config.validate().is_ok());

        config.strategies[0].grid.number_of_grids = 101;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_grid() {
        let mut config = Config::default();
        let mut strategy: Strategy = serde_json::from_str(
            r#"{"code":"S1","symbol_code":"1475","exchange":"TSE","entry_side":"buy","cash":"1000"}"#,
        )
        .unwrap();
        strategy.grid.runnable = true;
        config.strategies.push(strategy);
        assert!(config.validate().is_err());
    }
}
