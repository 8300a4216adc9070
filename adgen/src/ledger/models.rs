//! Ledger records: accounts, immutable transactions and reservation settlement state.

use crate::types::{JobId, ReservationId, Tier, TransactionId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Credit transaction kind, stored as TEXT in the database
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Reserve,
    Consume,
    Refund,
    Purchase,
    Bonus,
}

impl TransactionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Reserve => "reserve",
            TransactionKind::Consume => "consume",
            TransactionKind::Refund => "refund",
            TransactionKind::Purchase => "purchase",
            TransactionKind::Bonus => "bonus",
        }
    }
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "reserve" => Ok(TransactionKind::Reserve),
            "consume" => Ok(TransactionKind::Consume),
            "refund" => Ok(TransactionKind::Refund),
            "purchase" => Ok(TransactionKind::Purchase),
            "bonus" => Ok(TransactionKind::Bonus),
            other => Err(format!("unknown transaction kind '{other}'")),
        }
    }
}

/// An immutable entry in a user's credit log.
///
/// `balance_after` is the running balance snapshot immediately after this entry was applied.
/// `sequence` gives the creation order used when replaying the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditTransaction {
    pub id: TransactionId,
    pub user_id: UserId,
    pub kind: TransactionKind,
    pub amount: i64,
    pub balance_after: i64,
    pub job_id: Option<JobId>,
    /// For refunds and consumes, the reservation being settled
    pub reservation_id: Option<ReservationId>,
    pub description: Option<String>,
    pub sequence: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditAccount {
    pub user_id: UserId,
    pub tier: Tier,
    pub balance: i64,
    pub created_at: DateTime<Utc>,
}

/// Settlement state of a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementStatus {
    Pending,
    Consumed,
    Refunded,
}

impl SettlementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SettlementStatus::Pending => "pending",
            SettlementStatus::Consumed => "consumed",
            SettlementStatus::Refunded => "refunded",
        }
    }
}

impl FromStr for SettlementStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SettlementStatus::Pending),
            "consumed" => Ok(SettlementStatus::Consumed),
            "refunded" => Ok(SettlementStatus::Refunded),
            other => Err(format!("unknown settlement status '{other}'")),
        }
    }
}

/// A pending or settled credit debit tied to one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    /// Same as the id of the `reserve` transaction that created it
    pub id: ReservationId,
    pub user_id: UserId,
    /// Positive number of credits held
    pub amount: i64,
    pub job_id: Option<JobId>,
    pub status: SettlementStatus,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

/// Outcome of a `consume` or `refund` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    /// This call settled the reservation and appended the given transaction.
    Applied(CreditTransaction),
    /// The reservation had already been settled; nothing changed.
    AlreadySettled(SettlementStatus),
}

impl Settlement {
    pub fn was_applied(&self) -> bool {
        matches!(self, Settlement::Applied(_))
    }
}

/// Result of replaying a user's transaction log against the maintained running total.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerAudit {
    pub user_id: UserId,
    pub running_balance: i64,
    pub replayed_balance: i64,
    pub transaction_count: usize,
    /// Transactions whose stored snapshot disagrees with the replay
    pub mismatched_snapshots: Vec<TransactionId>,
}

impl LedgerAudit {
    pub fn is_consistent(&self) -> bool {
        self.running_balance == self.replayed_balance && self.mismatched_snapshots.is_empty()
    }
}

/// Replay transactions (which must be in creation order) and compare every snapshot.
pub fn replay(user_id: UserId, running_balance: i64, transactions: &[CreditTransaction]) -> LedgerAudit {
    let mut balance = 0i64;
    let mut mismatched_snapshots = Vec::new();

    for tx in transactions {
        balance += tx.amount;
        if tx.balance_after != balance {
            mismatched_snapshots.push(tx.id);
        }
    }

    LedgerAudit {
        user_id,
        running_balance,
        replayed_balance: balance,
        transaction_count: transactions.len(),
        mismatched_snapshots,
    }
}
