//! In-memory ledger implementation.
//!
//! Each account lives behind its own mutex, which plays the role of the account row lock:
//! every mutation for one user runs under it, and no lock is ever held across an `.await`.
//! Suitable for tests and single-process deployments. Balances are lost on restart.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::Mutex;
use uuid::Uuid;

use super::models::replay;
use super::{
    CreditAccount, CreditTransaction, Ledger, LedgerAudit, LedgerError, Reservation, Result, Settlement,
    SettlementStatus, TransactionKind, ensure_grantable, ensure_positive,
};
use crate::types::{JobId, ReservationId, Tier, UserId};

/// One user's account, log and reservations, guarded together.
struct AccountBook {
    account: CreditAccount,
    transactions: Vec<CreditTransaction>,
    reservations: HashMap<ReservationId, Reservation>,
}

impl AccountBook {
    /// Apply `amount` to the running total and append the matching log entry.
    fn append(
        &mut self,
        sequence: i64,
        kind: TransactionKind,
        amount: i64,
        job_id: Option<JobId>,
        reservation_id: Option<ReservationId>,
        description: Option<String>,
    ) -> CreditTransaction {
        self.account.balance += amount;
        let tx = CreditTransaction {
            id: Uuid::new_v4(),
            user_id: self.account.user_id,
            kind,
            amount,
            balance_after: self.account.balance,
            job_id,
            reservation_id,
            description,
            sequence,
            created_at: Utc::now(),
        };
        self.transactions.push(tx.clone());
        tx
    }
}

#[derive(Default)]
pub struct InMemoryLedger {
    accounts: DashMap<UserId, Arc<Mutex<AccountBook>>>,
    /// reservation id -> owning user, to find the right book on settlement
    reservations: DashMap<ReservationId, UserId>,
    sequence: AtomicI64,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_sequence(&self) -> i64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn book(&self, user_id: UserId) -> Result<Arc<Mutex<AccountBook>>> {
        // Clone the Arc so the map shard guard is released before the book is locked
        self.accounts
            .get(&user_id)
            .map(|entry| entry.value().clone())
            .ok_or(LedgerError::AccountNotFound(user_id))
    }

    fn book_for_reservation(&self, reservation_id: ReservationId) -> Result<Arc<Mutex<AccountBook>>> {
        let user_id = self
            .reservations
            .get(&reservation_id)
            .map(|entry| *entry.value())
            .ok_or(LedgerError::UnknownReservation(reservation_id))?;
        self.book(user_id)
    }

    fn settle(&self, reservation_id: ReservationId, target: SettlementStatus) -> Result<Settlement> {
        let book = self.book_for_reservation(reservation_id)?;
        let mut book = book.lock();

        let reservation = book
            .reservations
            .get(&reservation_id)
            .cloned()
            .ok_or(LedgerError::UnknownReservation(reservation_id))?;

        if reservation.status != SettlementStatus::Pending {
            if reservation.status != target {
                tracing::warn!(
                    reservation_id = %reservation_id,
                    current = reservation.status.as_str(),
                    requested = target.as_str(),
                    "Reservation already settled the other way, ignoring"
                );
            }
            return Ok(Settlement::AlreadySettled(reservation.status));
        }

        let (kind, amount) = if target == SettlementStatus::Refunded {
            (TransactionKind::Refund, reservation.amount)
        } else {
            (TransactionKind::Consume, 0)
        };

        let sequence = self.next_sequence();
        let tx = book.append(
            sequence,
            kind,
            amount,
            reservation.job_id,
            Some(reservation_id),
            None,
        );

        if let Some(stored) = book.reservations.get_mut(&reservation_id) {
            stored.status = target;
            stored.settled_at = Some(tx.created_at);
        }

        Ok(Settlement::Applied(tx))
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn open_account(&self, user_id: UserId, tier: Tier, initial_credits: i64) -> Result<CreditAccount> {
        if initial_credits < 0 {
            return Err(LedgerError::InvalidAmount {
                amount: initial_credits,
                reason: "initial credits cannot be negative",
            });
        }

        match self.accounts.entry(user_id) {
            Entry::Occupied(_) => Err(LedgerError::AccountExists(user_id)),
            Entry::Vacant(vacant) => {
                let mut book = AccountBook {
                    account: CreditAccount {
                        user_id,
                        tier,
                        balance: 0,
                        created_at: Utc::now(),
                    },
                    transactions: Vec::new(),
                    reservations: HashMap::new(),
                };
                if initial_credits > 0 {
                    let sequence = self.next_sequence();
                    book.append(
                        sequence,
                        TransactionKind::Bonus,
                        initial_credits,
                        None,
                        None,
                        Some("Initial credits".to_string()),
                    );
                }
                let account = book.account.clone();
                vacant.insert(Arc::new(Mutex::new(book)));
                tracing::debug!(user_id = %user_id, tier = tier.as_str(), initial_credits, "Opened credit account");
                Ok(account)
            }
        }
    }

    async fn get_account(&self, user_id: UserId) -> Result<CreditAccount> {
        Ok(self.book(user_id)?.lock().account.clone())
    }

    async fn grant(
        &self,
        user_id: UserId,
        kind: TransactionKind,
        amount: i64,
        description: Option<String>,
    ) -> Result<CreditTransaction> {
        ensure_grantable(kind, amount)?;
        let book = self.book(user_id)?;
        let mut book = book.lock();
        let sequence = self.next_sequence();
        Ok(book.append(sequence, kind, amount, None, None, description))
    }

    #[tracing::instrument(skip(self), err(level = "debug"))]
    async fn reserve(&self, user_id: UserId, amount: i64, job_id: Option<JobId>) -> Result<ReservationId> {
        ensure_positive(amount)?;
        let book = self.book(user_id)?;

        let reservation_id = {
            let mut book = book.lock();
            let available = book.account.balance;
            if book.account.tier == Tier::Standard && available < amount {
                return Err(LedgerError::InsufficientCredits {
                    user_id,
                    requested: amount,
                    available,
                });
            }

            let sequence = self.next_sequence();
            let tx = book.append(sequence, TransactionKind::Reserve, -amount, job_id, None, None);
            book.reservations.insert(
                tx.id,
                Reservation {
                    id: tx.id,
                    user_id,
                    amount,
                    job_id,
                    status: SettlementStatus::Pending,
                    created_at: tx.created_at,
                    settled_at: None,
                },
            );
            tx.id
        };

        self.reservations.insert(reservation_id, user_id);
        Ok(reservation_id)
    }

    async fn consume(&self, reservation_id: ReservationId) -> Result<Settlement> {
        self.settle(reservation_id, SettlementStatus::Consumed)
    }

    async fn refund(&self, reservation_id: ReservationId) -> Result<Settlement> {
        self.settle(reservation_id, SettlementStatus::Refunded)
    }

    async fn get_reservation(&self, reservation_id: ReservationId) -> Result<Reservation> {
        let book = self.book_for_reservation(reservation_id)?;
        let book = book.lock();
        book.reservations
            .get(&reservation_id)
            .cloned()
            .ok_or(LedgerError::UnknownReservation(reservation_id))
    }

    async fn list_pending_reservations(&self, created_before: DateTime<Utc>) -> Result<Vec<Reservation>> {
        let books: Vec<_> = self.accounts.iter().map(|entry| entry.value().clone()).collect();
        let mut pending: Vec<Reservation> = books
            .iter()
            .flat_map(|book| {
                book.lock()
                    .reservations
                    .values()
                    .filter(|r| r.status == SettlementStatus::Pending && r.created_at < created_before)
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        pending.sort_by_key(|r| r.created_at);
        Ok(pending)
    }

    async fn list_transactions(&self, user_id: UserId, skip: usize, limit: usize) -> Result<Vec<CreditTransaction>> {
        let book = self.book(user_id)?;
        let book = book.lock();
        Ok(book.transactions.iter().rev().skip(skip).take(limit).cloned().collect())
    }

    async fn verify(&self, user_id: UserId) -> Result<LedgerAudit> {
        let book = self.book(user_id)?;
        let book = book.lock();
        Ok(replay(user_id, book.account.balance, &book.transactions))
    }

    async fn verify_all(&self) -> Result<Vec<LedgerAudit>> {
        let users: Vec<UserId> = self.accounts.iter().map(|entry| *entry.key()).collect();
        let mut audits = Vec::with_capacity(users.len());
        for user_id in users {
            audits.push(self.verify(user_id).await?);
        }
        Ok(audits)
    }
}
