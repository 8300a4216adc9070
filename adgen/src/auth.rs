//! Caller identity.
//!
//! Authentication happens in front of this service: a proxy verifies the user and forwards
//! their id in the `X-User-Id` header. When `credits.initial_credits` is configured, a caller
//! seen for the first time gets a standard account holding that many credits.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use tracing::instrument;
use uuid::Uuid;

use crate::AppState;
use crate::errors::{Error, Result};
use crate::ledger::LedgerError;
use crate::types::{Tier, UserId};

pub const USER_ID_HEADER: &str = "x-user-id";

/// The user a request acts for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caller {
    pub user_id: UserId,
}

impl FromRequestParts<AppState> for Caller {
    type Rejection = Error;

    #[instrument(skip_all)]
    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self> {
        let header = parts.headers.get(USER_ID_HEADER).ok_or(Error::Unauthenticated { message: None })?;
        let user_id = header
            .to_str()
            .ok()
            .and_then(|value| Uuid::parse_str(value.trim()).ok())
            .ok_or_else(|| Error::Unauthenticated {
                message: Some(format!("{USER_ID_HEADER} header must be a UUID")),
            })?;

        if let Some(initial_credits) = state.config.credits.initial_credits {
            ensure_account(state, user_id, initial_credits).await?;
        }

        Ok(Caller { user_id })
    }
}

async fn ensure_account(state: &AppState, user_id: UserId, initial_credits: i64) -> Result<()> {
    match state.ledger.get_account(user_id).await {
        Ok(_) => Ok(()),
        Err(LedgerError::AccountNotFound(_)) => match state.ledger.open_account(user_id, Tier::Standard, initial_credits).await {
            Ok(_) => {
                tracing::info!(user_id = %user_id, initial_credits, "Opened credit account for new caller");
                Ok(())
            }
            // Another request for the same caller got there first
            Err(LedgerError::AccountExists(_)) => Ok(()),
            Err(e) => Err(e.into()),
        },
        Err(e) => Err(e.into()),
    }
}
