use crate::types::{ReservationId, UserId};
use thiserror::Error;

/// Errors raised by credit ledger operations.
#[derive(Error, Debug)]
pub enum LedgerError {
    /// The account balance does not cover the requested reservation. Nothing was mutated.
    #[error("Insufficient credits: requested {requested}, available {available}")]
    InsufficientCredits {
        user_id: UserId,
        requested: i64,
        available: i64,
    },

    /// Settlement was attempted on a reservation the ledger never issued.
    /// Correct callers never hit this; it surfaces programming errors.
    #[error("Unknown reservation {0}")]
    UnknownReservation(ReservationId),

    #[error("Credit account {0} not found")]
    AccountNotFound(UserId),

    #[error("Credit account {0} already exists")]
    AccountExists(UserId),

    #[error("Invalid credit amount {amount}: {reason}")]
    InvalidAmount { amount: i64, reason: &'static str },

    /// Database operation failed
    #[cfg(feature = "postgres")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Catch-all for non-recoverable errors
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Type alias for ledger operation results
pub type Result<T> = std::result::Result<T, LedgerError>;
