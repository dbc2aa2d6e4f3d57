//! Market structure: tick sizes and price-step arithmetic.

pub mod tick;

pub use tick::{tick, tick_added_price, ticks, TickGroup};
