//! Shared utilities: decimal arithmetic and the injectable clock.

pub mod clock;
pub mod decimal;

pub use clock::{Clock, FixedClock, SystemClock};
