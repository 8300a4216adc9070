//! Credit ledger: an append-only transaction log with a derived per-user balance.
//!
//! Credits move through three calls per job:
//!
//! 1. [`Ledger::reserve`] debits the cost up front and returns a [`ReservationId`].
//! 2. On success, [`Ledger::consume`] marks the debit permanent (no balance change).
//! 3. On failure, [`Ledger::refund`] appends a compensating credit.
//!
//! Settlement is idempotent: each reservation is settled at most once, and later
//! `consume`/`refund` calls report [`Settlement::AlreadySettled`] without touching the
//! balance. All operations for one user are linearised, so concurrent reservations can
//! never jointly overdraw a standard account.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::types::{JobId, ReservationId, Tier, UserId};

pub mod audit;
pub mod errors;
pub mod in_memory;
pub mod models;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use errors::{LedgerError, Result};
pub use in_memory::InMemoryLedger;
pub use models::{
    CreditAccount, CreditTransaction, LedgerAudit, Reservation, Settlement, SettlementStatus, TransactionKind,
};
#[cfg(feature = "postgres")]
pub use postgres::PostgresLedger;

#[async_trait]
pub trait Ledger: Send + Sync {
    /// Create a credit account. A positive `initial_credits` is recorded as a `bonus` transaction.
    async fn open_account(&self, user_id: UserId, tier: Tier, initial_credits: i64) -> Result<CreditAccount>;

    async fn get_account(&self, user_id: UserId) -> Result<CreditAccount>;

    /// Add credits through a `purchase` or `bonus` transaction.
    ///
    /// # Errors
    /// - `InvalidAmount` if `amount <= 0` or `kind` is not purchase/bonus
    async fn grant(
        &self,
        user_id: UserId,
        kind: TransactionKind,
        amount: i64,
        description: Option<String>,
    ) -> Result<CreditTransaction>;

    /// Atomically check the balance and append a `reserve` transaction of `-amount`.
    ///
    /// The returned id is the settlement handle for the job.
    ///
    /// # Errors
    /// - `InsufficientCredits` if a standard account cannot cover `amount` (no mutation)
    /// - `InvalidAmount` if `amount <= 0`
    async fn reserve(&self, user_id: UserId, amount: i64, job_id: Option<JobId>) -> Result<ReservationId>;

    /// Mark a reservation permanent. Never changes the balance.
    async fn consume(&self, reservation_id: ReservationId) -> Result<Settlement>;

    /// Reverse a pending reservation by appending a `refund` of the reserved amount.
    async fn refund(&self, reservation_id: ReservationId) -> Result<Settlement>;

    /// Current balance, served from the maintained running total.
    async fn get_balance(&self, user_id: UserId) -> Result<i64> {
        Ok(self.get_account(user_id).await?.balance)
    }

    async fn get_reservation(&self, reservation_id: ReservationId) -> Result<Reservation>;

    /// Unsettled reservations created before `created_before`, oldest first.
    async fn list_pending_reservations(&self, created_before: DateTime<Utc>) -> Result<Vec<Reservation>>;

    /// List a user's transactions, newest first.
    async fn list_transactions(&self, user_id: UserId, skip: usize, limit: usize) -> Result<Vec<CreditTransaction>>;

    /// Replay a user's full log and compare it with the running total.
    async fn verify(&self, user_id: UserId) -> Result<LedgerAudit>;

    /// Replay every account.
    async fn verify_all(&self) -> Result<Vec<LedgerAudit>>;
}

/// Reject non-positive amounts before touching any account.
pub(crate) fn ensure_positive(amount: i64) -> Result<()> {
    if amount <= 0 {
        return Err(LedgerError::InvalidAmount {
            amount,
            reason: "amount must be greater than zero",
        });
    }
    Ok(())
}

/// Only purchases and bonuses may be granted directly.
pub(crate) fn ensure_grantable(kind: TransactionKind, amount: i64) -> Result<()> {
    if !matches!(kind, TransactionKind::Purchase | TransactionKind::Bonus) {
        return Err(LedgerError::InvalidAmount {
            amount,
            reason: "only purchase and bonus transactions can be granted",
        });
    }
    ensure_positive(amount)
}
