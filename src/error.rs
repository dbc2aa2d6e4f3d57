//! Error types for the trading engine.
//!
//! Broker and storage failures pass through as `anyhow::Error` so the
//! transport layer keeps its context chain; everything the engine decides
//! on its own is a typed variant.

use rust_decimal::Decimal;
use thiserror::Error;

/// Errors raised by the ledgers and the trading services.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Insufficient cash: required {required}, available {available}")]
    InsufficientCash { required: Decimal, available: Decimal },

    #[error("Insufficient position: requested {requested}, available {available}")]
    InsufficientPosition { requested: Decimal, available: Decimal },

    #[error("Invalid quantity {quantity} for position {position_code}")]
    InvalidQuantity {
        position_code: String,
        quantity: Decimal,
    },

    #[error("Order rejected by broker")]
    OrderRejected,

    #[error("Cancel rejected by broker for order {0}")]
    CancelRejected(String),

    #[error("Undecidable value: {0}")]
    UndecidableValue(String),

    #[error("Grid width resolved to zero")]
    ZeroGridWidth,

    #[error("Cannot get base price for {0}")]
    CannotGetBasePrice(String),

    #[error("No matching time range")]
    NotExistsTimeRange,

    #[error("Broker error: {0:#}")]
    Broker(anyhow::Error),

    #[error("Storage error: {0:#}")]
    Storage(anyhow::Error),

    /// A failure whose best-effort compensation (releasing holds) also
    /// failed. The holds named in `suppressed` are stranded.
    #[error("{cause} ({} suppressed compensation error(s))", .suppressed.len())]
    Compensated {
        cause: Box<EngineError>,
        suppressed: Vec<EngineError>,
    },
}

impl EngineError {
    /// Attach compensation errors to a primary failure.
    ///
    /// Returns the cause unchanged when nothing was suppressed.
    pub fn with_suppressed(cause: EngineError, suppressed: Vec<EngineError>) -> EngineError {
        if suppressed.is_empty() {
            cause
        } else {
            EngineError::Compensated {
                cause: Box::new(cause),
                suppressed,
            }
        }
    }

    /// The primary failure, looking through compensation wrappers.
    pub fn root(&self) -> &EngineError {
        match self {
            EngineError::Compensated { cause, .. } => cause.root(),
            other => other,
        }
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
