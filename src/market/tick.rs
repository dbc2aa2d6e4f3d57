//! Tick-size table for exchange-listed stocks.
//!
//! The tick size depends on the price band and on whether the symbol is a
//! TOPIX100 constituent. Upper bounds are inclusive: a price equal to a
//! band's upper bound uses that band's tick.

use crate::utils::decimal::{ceil_div, round_half_up};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Tick-table selector for a symbol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TickGroup {
    /// Unknown group; resolves to the default table.
    #[default]
    Unspecified,
    Topix100,
    Other,
}

/// One price band: every price `<= upper` (and above the previous band) uses `tick`.
/// `upper == None` is the open-ended top band.
#[derive(Debug, Clone, Copy)]
struct Band {
    upper: Option<Decimal>,
    tick: Decimal,
}

const fn band(upper: Decimal, tick: Decimal) -> Band {
    Band {
        upper: Some(upper),
        tick,
    }
}

const DEFAULT_BANDS: [Band; 11] = [
    band(dec!(3000), dec!(1)),
    band(dec!(5000), dec!(5)),
    band(dec!(30000), dec!(10)),
    band(dec!(50000), dec!(50)),
    band(dec!(300000), dec!(100)),
    band(dec!(500000), dec!(500)),
    band(dec!(3000000), dec!(1000)),
    band(dec!(5000000), dec!(5000)),
    band(dec!(30000000), dec!(10000)),
    band(dec!(50000000), dec!(50000)),
    Band {
        upper: None,
        tick: dec!(100000),
    },
];

const TOPIX100_BANDS: [Band; 11] = [
    band(dec!(1000), dec!(0.1)),
    band(dec!(3000), dec!(0.5)),
    band(dec!(10000), dec!(1)),
    band(dec!(30000), dec!(5)),
    band(dec!(100000), dec!(10)),
    band(dec!(300000), dec!(50)),
    band(dec!(1000000), dec!(100)),
    band(dec!(3000000), dec!(500)),
    band(dec!(10000000), dec!(1000)),
    band(dec!(30000000), dec!(5000)),
    Band {
        upper: None,
        tick: dec!(10000),
    },
];

/// Offset used to probe which band a step leaves from at a boundary.
const BOUNDARY_NUDGE: Decimal = dec!(0.005);

fn bands(group: TickGroup) -> &'static [Band] {
    match group {
        TickGroup::Topix100 => &TOPIX100_BANDS,
        TickGroup::Other | TickGroup::Unspecified => &DEFAULT_BANDS,
    }
}

/// Tick size for a price.
pub fn tick(group: TickGroup, price: Decimal) -> Decimal {
    let table = bands(group);
    table
        .iter()
        .find(|b| b.upper.map_or(true, |upper| price <= upper))
        .unwrap_or(&table[table.len() - 1])
        .tick
}

/// Move `price` by `n` ticks (negative `n` moves down), one step at a time.
///
/// Each step resolves the tick size just beyond the current price in the
/// direction of travel, so crossing a band boundary uses the correct tick.
pub fn tick_added_price(group: TickGroup, price: Decimal, n: i64) -> Decimal {
    let mut current = price;
    if n > 0 {
        for _ in 0..n {
            current += tick(group, current + BOUNDARY_NUDGE);
        }
    } else {
        for _ in 0..n.unsigned_abs() {
            current -= tick(group, current - BOUNDARY_NUDGE);
        }
    }
    round_half_up(current, 1)
}

/// Number of ticks between two prices, band by band.
///
/// Symmetric in its arguments; zero for equal prices.
pub fn ticks(group: TickGroup, a: Decimal, b: Decimal) -> i64 {
    let (low, high) = if a <= b { (a, b) } else { (b, a) };
    if low == high {
        return 0;
    }

    let mut total = Decimal::ZERO;
    let mut lower_bound = Decimal::MIN;
    for b in bands(group) {
        let upper_bound = b.upper.unwrap_or(Decimal::MAX);
        let from = low.max(lower_bound);
        let to = high.min(upper_bound);
        if to > from {
            total += ceil_div(to - from, b.tick);
        }
        if high <= upper_bound {
            break;
        }
        lower_bound = upper_bound;
    }

    total.to_i64().unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_boundaries_belong_to_lower_band() {
        assert_eq!(tick(TickGroup::Other, dec!(3000)), dec!(1));
        assert_eq!(tick(TickGroup::Other, dec!(3000.1)), dec!(5));
        assert_eq!(tick(TickGroup::Topix100, dec!(1000)), dec!(0.1));
        assert_eq!(tick(TickGroup::Topix100, dec!(1001)), dec!(0.5));
        assert_eq!(tick(TickGroup::Other, dec!(60000000)), dec!(100000));
    }

    #[test]
    fn test_unspecified_group_uses_default_table() {
        assert_eq!(
            tick(TickGroup::Unspecified, dec!(4000)),
            tick(TickGroup::Other, dec!(4000))
        );
    }

    #[test]
    fn test_tick_added_price_crosses_band() {
        assert_eq!(tick_added_price(TickGroup::Other, dec!(2999), 1), dec!(3000));
        assert_eq!(tick_added_price(TickGroup::Other, dec!(3000), 1), dec!(3005));
        assert_eq!(tick_added_price(TickGroup::Other, dec!(3005), -1), dec!(3000));
        assert_eq!(tick_added_price(TickGroup::Other, dec!(3000), -1), dec!(2999));
        assert_eq!(tick_added_price(TickGroup::Other, dec!(2998), 3), dec!(3005));
    }

    #[test]
    fn test_tick_added_price_topix_decimals() {
        assert_eq!(tick_added_price(TickGroup::Topix100, dec!(999.8), 3), dec!(1000.5));
        assert_eq!(tick_added_price(TickGroup::Topix100, dec!(1000.5), -3), dec!(999.8));
    }

    #[test]
    fn test_tick_added_price_zero_steps() {
        assert_eq!(tick_added_price(TickGroup::Other, dec!(2000), 0), dec!(2000));
    }

    #[test]
    fn test_ticks_within_band() {
        assert_eq!(ticks(TickGroup::Other, dec!(1999), dec!(2001)), 2);
        assert_eq!(ticks(TickGroup::Other, dec!(2001), dec!(1999)), 2);
        assert_eq!(ticks(TickGroup::Other, dec!(2000), dec!(2000)), 0);
    }

    #[test]
    fn test_ticks_across_bands() {
        // 2990..3000 is 10 one-yen ticks, 3000..3050 is 10 five-yen ticks.
        assert_eq!(ticks(TickGroup::Other, dec!(2990), dec!(3050)), 20);
        // Partial segment rounds up.
        assert_eq!(ticks(TickGroup::Other, dec!(3000), dec!(3003)), 1);
        assert_eq!(ticks(TickGroup::Topix100, dec!(999), dec!(1001)), 12);
    }
}
