//! Read-only views of the caller's credit account.

use axum::{
    extract::{Query, State},
    response::Json,
};

use crate::AppState;
use crate::api::models::{BalanceResponse, Pagination, TransactionListResponse, TransactionResponse};
use crate::auth::Caller;
use crate::errors::Result;

#[tracing::instrument(skip_all, fields(user_id = %caller.user_id))]
pub async fn get_balance(State(state): State<AppState>, caller: Caller) -> Result<Json<BalanceResponse>> {
    let account = state.ledger.get_account(caller.user_id).await?;
    Ok(Json(BalanceResponse::from(account)))
}

/// The caller's transactions, newest first.
#[tracing::instrument(skip_all, fields(user_id = %caller.user_id))]
pub async fn list_transactions(
    State(state): State<AppState>,
    Query(pagination): Query<Pagination>,
    caller: Caller,
) -> Result<Json<TransactionListResponse>> {
    let (skip, limit) = (pagination.skip(), pagination.limit());
    let transactions = state.ledger.list_transactions(caller.user_id, skip, limit).await?;

    Ok(Json(TransactionListResponse {
        data: transactions.into_iter().map(TransactionResponse::from).collect(),
        skip,
        limit,
    }))
}
