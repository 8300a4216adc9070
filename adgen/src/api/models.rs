//! Request and response bodies for the HTTP API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ledger::{CreditAccount, CreditTransaction, TransactionKind};
use crate::types::{JobId, ReservationId, Tier, TransactionId, UserId};

/// Default number of items to return per page.
pub const DEFAULT_LIMIT: usize = 10;

/// Maximum number of items that can be requested per page.
pub const MAX_LIMIT: usize = 100;

/// Body of `POST /generate/{operation}`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateRequest {
    /// Passed to the provider untouched
    pub input: serde_json::Value,
    /// Skip the fallback chain and use only this provider
    #[serde(default)]
    pub provider: Option<String>,
}

/// Offset pagination: `skip` defaults to 0, `limit` to 10 and is clamped to 1..=100.
#[derive(Debug, Default, Deserialize)]
pub struct Pagination {
    pub skip: Option<usize>,
    pub limit: Option<usize>,
}

impl Pagination {
    #[inline]
    pub fn skip(&self) -> usize {
        self.skip.unwrap_or(0)
    }

    #[inline]
    pub fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceResponse {
    pub user_id: UserId,
    pub balance: i64,
    pub tier: Tier,
}

impl From<CreditAccount> for BalanceResponse {
    fn from(account: CreditAccount) -> Self {
        Self {
            user_id: account.user_id,
            balance: account.balance,
            tier: account.tier,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionResponse {
    pub id: TransactionId,
    pub kind: TransactionKind,
    pub amount: i64,
    pub balance_after: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reservation_id: Option<ReservationId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<CreditTransaction> for TransactionResponse {
    fn from(tx: CreditTransaction) -> Self {
        Self {
            id: tx.id,
            kind: tx.kind,
            amount: tx.amount,
            balance_after: tx.balance_after,
            job_id: tx.job_id,
            reservation_id: tx.reservation_id,
            description: tx.description,
            created_at: tx.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionListResponse {
    pub data: Vec<TransactionResponse>,
    pub skip: usize,
    pub limit: usize,
}
