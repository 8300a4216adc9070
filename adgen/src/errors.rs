use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error as ThisError;

use crate::job::JobError;
use crate::ledger::LedgerError;

#[derive(ThisError, Debug)]
pub enum Error {
    /// Caller identity missing or malformed
    #[error("Not authenticated")]
    Unauthenticated { message: Option<String> },

    /// The caller's balance cannot cover the operation
    #[error("Insufficient credits: requested {requested}, available {available}")]
    InsufficientCredits { requested: i64, available: i64 },

    /// Invalid request data or business rule violation
    #[error("{message}")]
    BadRequest { message: String },

    /// Requested resource not found
    #[error("{resource} with ID {id} not found")]
    NotFound { resource: String, id: String },

    /// The resource is in a state that does not allow the operation
    #[error("Conflict: {message}")]
    Conflict { message: String },

    /// Generic internal service error
    #[error("Failed to {operation}")]
    Internal { operation: String },

    #[error(transparent)]
    Job(JobError),

    #[error(transparent)]
    Ledger(LedgerError),

    /// Unexpected error with full context chain
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<LedgerError> for Error {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientCredits { requested, available, .. } => {
                Error::InsufficientCredits { requested, available }
            }
            LedgerError::AccountNotFound(user_id) => Error::NotFound {
                resource: "Credit account".to_string(),
                id: user_id.to_string(),
            },
            LedgerError::InvalidAmount { amount, reason } => Error::BadRequest {
                message: format!("Invalid credit amount {amount}: {reason}"),
            },
            other => Error::Ledger(other),
        }
    }
}

impl From<JobError> for Error {
    fn from(err: JobError) -> Self {
        match err {
            JobError::NotFound(id) => Error::NotFound {
                resource: "Job".to_string(),
                id: id.to_string(),
            },
            JobError::NotCancellable { job_id, status } => Error::Conflict {
                message: format!("Job {job_id} is {status} and can no longer be cancelled"),
            },
            JobError::UnknownOperation(operation) => Error::BadRequest {
                message: format!("Unknown operation '{operation}'"),
            },
            JobError::Ledger(ledger) => ledger.into(),
            other => Error::Job(other),
        }
    }
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Unauthenticated { .. } => StatusCode::UNAUTHORIZED,
            Error::InsufficientCredits { .. } => StatusCode::PAYMENT_REQUIRED,
            Error::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Error::NotFound { .. } => StatusCode::NOT_FOUND,
            Error::Conflict { .. } => StatusCode::CONFLICT,
            Error::Internal { .. } | Error::Job(_) | Error::Ledger(_) | Error::Other(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Returns a user-safe error message, without leaking internal implementation details
    pub fn user_message(&self) -> String {
        match self {
            Error::Unauthenticated { message } => message.clone().unwrap_or_else(|| "Authentication required".to_string()),
            Error::InsufficientCredits { requested, available } => {
                format!("Insufficient credits: this operation costs {requested}, your balance is {available}")
            }
            Error::BadRequest { message } => message.clone(),
            Error::NotFound { resource, id } => format!("{resource} with ID {id} not found"),
            Error::Conflict { message } => message.clone(),
            Error::Internal { .. } | Error::Job(_) | Error::Ledger(_) | Error::Other(_) => {
                "Internal server error".to_string()
            }
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match &self {
            Error::Internal { .. } | Error::Job(_) | Error::Ledger(_) | Error::Other(_) => {
                tracing::error!("Internal service error: {:#}", self);
            }
            Error::Unauthenticated { .. } => {
                tracing::info!("Authentication error: {}", self);
            }
            Error::Conflict { .. } | Error::InsufficientCredits { .. } => {
                tracing::info!("Request rejected: {}", self);
            }
            Error::BadRequest { .. } | Error::NotFound { .. } => {
                tracing::debug!("Client error: {}", self);
            }
        }

        let status = self.status_code();
        match &self {
            Error::InsufficientCredits { requested, available } => {
                let body = json!({
                    "message": self.user_message(),
                    "requested": requested,
                    "available": available,
                });
                (status, Json(body)).into_response()
            }
            _ => (status, self.user_message()).into_response(),
        }
    }
}

/// Convert from String errors (e.g., from external functions)
impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Internal { operation: msg }
    }
}

/// Type alias for service operation results
pub type Result<T> = std::result::Result<T, Error>;
