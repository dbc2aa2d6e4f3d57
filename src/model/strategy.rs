//! Strategy definition and its time-windowed sub-strategies.

use super::{ExecutionType, MarginTradeType, Product, Side};
use crate::utils::clock::Timestamp;
use chrono::{Duration, NaiveTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// One configured trading program: a symbol, a side and an account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Strategy {
    pub code: String,
    pub symbol_code: String,
    pub exchange: String,
    #[serde(default)]
    pub product: Product,
    #[serde(default)]
    pub margin_trade_type: MarginTradeType,
    pub entry_side: Side,
    /// Cash available to this strategy
    pub cash: Decimal,
    #[serde(default)]
    pub last_contract_price: Decimal,
    #[serde(default)]
    pub last_contract_at: Option<Timestamp>,
    #[serde(default)]
    pub max_contract_price: Decimal,
    #[serde(default)]
    pub max_contract_at: Option<Timestamp>,
    #[serde(default)]
    pub min_contract_price: Decimal,
    #[serde(default)]
    pub min_contract_at: Option<Timestamp>,
    #[serde(default)]
    pub account: Account,
    #[serde(default)]
    pub grid: GridStrategy,
    #[serde(default)]
    pub rebalance: RebalanceStrategy,
    #[serde(default)]
    pub cancel: CancelStrategy,
    #[serde(default)]
    pub exit: ExitStrategy,
    #[serde(default)]
    pub runnable: bool,
}

/// Broker account credentials used for order and cancel requests.
#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Account {
    #[serde(default)]
    pub password: String,
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account").field("password", &"***").finish()
    }
}

/// Half-open time-of-day window `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeRange {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, t: NaiveTime) -> bool {
        self.start <= t && t < self.end
    }

    /// True during the minute right after the range ends.
    pub fn just_ended(&self, t: NaiveTime) -> bool {
        within_minute(self.end, t)
    }

    /// This range's start on the same day as `at`.
    pub fn start_on(&self, at: &Timestamp) -> Timestamp {
        at_time_of_day(at, self.start)
    }
}

/// Same date and offset as `at`, with the time of day replaced.
pub fn at_time_of_day(at: &Timestamp, t: NaiveTime) -> Timestamp {
    at.date_naive()
        .and_time(t)
        .and_local_timezone(*at.offset())
        .earliest()
        .unwrap_or(*at)
}

/// A timing fires during the minute `[timing, timing + 1min)`.
fn within_minute(timing: NaiveTime, t: NaiveTime) -> bool {
    let elapsed = t.signed_duration_since(timing);
    elapsed >= Duration::zero() && elapsed < Duration::minutes(1)
}

/// How the dynamic width term is rounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rounding {
    Floor,
    Round,
    Ceil,
}

/// How the dynamic width term combines with the static width.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WidthOperation {
    Add,
    Multiply,
}

/// Widens the grid according to the session's high/low spread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicGridMinMax {
    pub divide: Decimal,
    pub rounding: Rounding,
    pub operation: WidthOperation,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GridStrategy {
    #[serde(default)]
    pub runnable: bool,
    /// Distance between rungs, in ticks
    #[serde(default)]
    pub width: i64,
    /// Shares per rung
    #[serde(default)]
    pub quantity: Decimal,
    /// Rungs on each side of the base price
    #[serde(default)]
    pub number_of_grids: i64,
    #[serde(default)]
    pub time_ranges: Vec<TimeRange>,
    #[serde(default)]
    pub dynamic_min_max: Option<DynamicGridMinMax>,
}

impl GridStrategy {
    /// Whether leveling should run at `now`.
    pub fn is_running(&self, now: &Timestamp) -> bool {
        self.runnable && self.range_at(now).is_some()
    }

    /// The configured range containing `at`, if any.
    pub fn range_at(&self, at: &Timestamp) -> Option<&TimeRange> {
        let t = at.time();
        self.time_ranges.iter().find(|r| r.contains(t))
    }

    /// The range that ended less than a minute before `now`, if any.
    pub fn ending_range(&self, now: &Timestamp) -> Option<&TimeRange> {
        let t = now.time();
        self.time_ranges.iter().find(|r| r.just_ended(t))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RebalanceStrategy {
    #[serde(default)]
    pub runnable: bool,
    #[serde(default)]
    pub timings: Vec<NaiveTime>,
}

impl RebalanceStrategy {
    pub fn is_running(&self, now: &Timestamp) -> bool {
        self.runnable && self.timings.iter().any(|t| within_minute(*t, now.time()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CancelStrategy {
    #[serde(default)]
    pub runnable: bool,
    #[serde(default)]
    pub timings: Vec<NaiveTime>,
}

impl CancelStrategy {
    pub fn is_running(&self, now: &Timestamp) -> bool {
        self.runnable && self.timings.iter().any(|t| within_minute(*t, now.time()))
    }
}

/// Flatten-everything rule: at `timing`, exit all positions with `execution_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExitCondition {
    pub execution_type: ExecutionType,
    pub timing: NaiveTime,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExitStrategy {
    #[serde(default)]
    pub runnable: bool,
    #[serde(default)]
    pub conditions: Vec<ExitCondition>,
}

impl ExitStrategy {
    /// The condition firing at `now`, if the exit strategy is enabled.
    pub fn condition_at(&self, now: &Timestamp) -> Option<&ExitCondition> {
        if !self.runnable {
            return None;
        }
        self.conditions
            .iter()
            .find(|c| within_minute(c.timing, now.time()))
    }
}
