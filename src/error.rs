use rust_decimal::Decimal;
use thiserror::Error;

use crate::models::{OrderId, OrderStatus};

/// A malformed draft. Blocks locally; never reaches the backend.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("quantity must be positive, got {0}")]
    NonPositiveQuantity(Decimal),

    #[error("limit price is required for LIMIT orders")]
    MissingLimitPrice,

    #[error("limit price must be positive, got {0}")]
    NonPositiveLimitPrice(Decimal),

    #[error("MARKET orders do not take a limit price")]
    UnexpectedLimitPrice,

    #[error("invalid symbol format: {0:?}")]
    InvalidSymbol(String),

    #[error("filled quantity {filled} exceeds order quantity {quantity}")]
    Overfilled { filled: Decimal, quantity: Decimal },
}

/// A request that failed at the backend boundary
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NetworkError {
    #[error("request timed out")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("backend rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("malformed response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for NetworkError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            NetworkError::Timeout
        } else if e.is_decode() {
            NetworkError::Decode(e.to_string())
        } else {
            NetworkError::Transport(e.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeskError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error("unknown order {0}")]
    UnknownOrder(OrderId),

    #[error("order {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
    },

    #[error("order {0} was already submitted")]
    AlreadySubmitted(OrderId),

    #[error("order {id} is {status} and cannot be cancelled")]
    NotCancellable { id: OrderId, status: OrderStatus },

    #[error("a cancel request for {0} is already in flight")]
    CancelInFlight(OrderId),

    #[error("{} of {} cancellations failed", .failed.len(), .failed.len() + .succeeded.len())]
    PartialBatchFailure {
        succeeded: Vec<OrderId>,
        failed: Vec<(OrderId, String)>,
    },

    #[error("{} selected order(s) no longer exist", .pruned.len())]
    StaleSelection { pruned: Vec<OrderId> },
}
