//! Decimal arithmetic utilities for price and quantity calculations.

use rust_decimal::{Decimal, RoundingStrategy};

/// Round half-up (away from zero) to a number of decimal places.
pub fn round_half_up(value: Decimal, decimals: u32) -> Decimal {
    value.round_dp_with_strategy(decimals, RoundingStrategy::MidpointAwayFromZero)
}

/// Round to the nearest integer, halves away from zero.
pub fn round_half_away(value: Decimal) -> Decimal {
    round_half_up(value, 0)
}

/// Number of `step`-sized pieces needed to cover `length`, rounding up.
///
/// Returns zero for a non-positive step.
pub fn ceil_div(length: Decimal, step: Decimal) -> Decimal {
    if step <= Decimal::ZERO {
        return Decimal::ZERO;
    }
    (length / step).ceil()
}
