//! PostgreSQL ledger.
//!
//! Every mutation runs in one database transaction that first takes the account row with
//! `SELECT ... FOR UPDATE`. Settlement additionally locks the reservation row, always before
//! the account row, so lock order is consistent with `reserve` (which only creates reservations).

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{PgConnection, Row};
use uuid::Uuid;

use super::models::replay;
use super::{
    CreditAccount, CreditTransaction, Ledger, LedgerAudit, LedgerError, Reservation, Result, Settlement,
    SettlementStatus, TransactionKind, ensure_grantable, ensure_positive,
};
use crate::types::{JobId, ReservationId, Tier, UserId};

const TRANSACTION_COLUMNS: &str =
    "id, seq, user_id, kind, amount, balance_after, job_id, reservation_id, description, created_at";

pub struct PostgresLedger {
    pool: PgPool,
}

impl PostgresLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Lock the account row for the rest of the surrounding transaction.
    async fn lock_account(conn: &mut PgConnection, user_id: UserId) -> Result<CreditAccount> {
        let row = sqlx::query("SELECT user_id, tier, balance, created_at FROM credit_accounts WHERE user_id = $1 FOR UPDATE")
            .bind(user_id)
            .fetch_optional(&mut *conn)
            .await?
            .ok_or(LedgerError::AccountNotFound(user_id))?;
        row_to_account(&row)
    }

    /// Apply `amount` to the locked account and append the log entry with its snapshot.
    async fn append(
        conn: &mut PgConnection,
        user_id: UserId,
        kind: TransactionKind,
        amount: i64,
        job_id: Option<JobId>,
        reservation_id: Option<ReservationId>,
        description: Option<String>,
    ) -> Result<CreditTransaction> {
        let balance_after: i64 =
            sqlx::query_scalar("UPDATE credit_accounts SET balance = balance + $2 WHERE user_id = $1 RETURNING balance")
                .bind(user_id)
                .bind(amount)
                .fetch_one(&mut *conn)
                .await?;

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO credit_transactions (id, user_id, kind, amount, balance_after, job_id, reservation_id, description)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {TRANSACTION_COLUMNS}
            "#
        ))
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(kind.as_str())
        .bind(amount)
        .bind(balance_after)
        .bind(job_id)
        .bind(reservation_id)
        .bind(description)
        .fetch_one(&mut *conn)
        .await?;

        row_to_transaction(&row)
    }

    async fn settle(&self, reservation_id: ReservationId, target: SettlementStatus) -> Result<Settlement> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT id, user_id, amount, job_id, status, created_at, settled_at FROM credit_reservations WHERE id = $1 FOR UPDATE",
        )
        .bind(reservation_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(LedgerError::UnknownReservation(reservation_id))?;
        let reservation = row_to_reservation(&row)?;

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

        Self::lock_account(&mut tx, reservation.user_id).await?;

        let (kind, amount) = if target == SettlementStatus::Refunded {
            (TransactionKind::Refund, reservation.amount)
        } else {
            (TransactionKind::Consume, 0)
        };
        let applied = Self::append(
            &mut tx,
            reservation.user_id,
            kind,
            amount,
            reservation.job_id,
            Some(reservation_id),
            None,
        )
        .await?;

        sqlx::query("UPDATE credit_reservations SET status = $2, settled_at = $3 WHERE id = $1")
            .bind(reservation_id)
            .bind(target.as_str())
            .bind(applied.created_at)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(Settlement::Applied(applied))
    }
}

#[async_trait]
impl Ledger for PostgresLedger {
    async fn open_account(&self, user_id: UserId, tier: Tier, initial_credits: i64) -> Result<CreditAccount> {
        if initial_credits < 0 {
            return Err(LedgerError::InvalidAmount {
                amount: initial_credits,
                reason: "initial credits cannot be negative",
            });
        }

        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            r#"
            INSERT INTO credit_accounts (user_id, tier, balance)
            VALUES ($1, $2, 0)
            ON CONFLICT (user_id) DO NOTHING
            RETURNING user_id, tier, balance, created_at
            "#,
        )
        .bind(user_id)
        .bind(tier.as_str())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(LedgerError::AccountExists(user_id))?;
        let mut account = row_to_account(&row)?;

        if initial_credits > 0 {
            let bonus = Self::append(
                &mut tx,
                user_id,
                TransactionKind::Bonus,
                initial_credits,
                None,
                None,
                Some("Initial credits".to_string()),
            )
            .await?;
            account.balance = bonus.balance_after;
        }

        tx.commit().await?;
        tracing::debug!(user_id = %user_id, tier = tier.as_str(), initial_credits, "Opened credit account");
        Ok(account)
    }

    async fn get_account(&self, user_id: UserId) -> Result<CreditAccount> {
        let row = sqlx::query("SELECT user_id, tier, balance, created_at FROM credit_accounts WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(LedgerError::AccountNotFound(user_id))?;
        row_to_account(&row)
    }

    async fn grant(
        &self,
        user_id: UserId,
        kind: TransactionKind,
        amount: i64,
        description: Option<String>,
    ) -> Result<CreditTransaction> {
        ensure_grantable(kind, amount)?;
        let mut tx = self.pool.begin().await?;
        Self::lock_account(&mut tx, user_id).await?;
        let granted = Self::append(&mut tx, user_id, kind, amount, None, None, description).await?;
        tx.commit().await?;
        Ok(granted)
    }

    #[tracing::instrument(skip(self), err(level = "debug"))]
    async fn reserve(&self, user_id: UserId, amount: i64, job_id: Option<JobId>) -> Result<ReservationId> {
        ensure_positive(amount)?;
        let mut tx = self.pool.begin().await?;

        let account = Self::lock_account(&mut tx, user_id).await?;
        if account.tier == Tier::Standard && account.balance < amount {
            // Dropping the transaction rolls back and releases the row lock
            return Err(LedgerError::InsufficientCredits {
                user_id,
                requested: amount,
                available: account.balance,
            });
        }

        let reserved = Self::append(&mut tx, user_id, TransactionKind::Reserve, -amount, job_id, None, None).await?;

        sqlx::query(
            "INSERT INTO credit_reservations (id, user_id, amount, job_id, status, created_at) VALUES ($1, $2, $3, $4, 'pending', $5)",
        )
        .bind(reserved.id)
        .bind(user_id)
        .bind(amount)
        .bind(job_id)
        .bind(reserved.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(reserved.id)
    }

    async fn consume(&self, reservation_id: ReservationId) -> Result<Settlement> {
        self.settle(reservation_id, SettlementStatus::Consumed).await
    }

    async fn refund(&self, reservation_id: ReservationId) -> Result<Settlement> {
        self.settle(reservation_id, SettlementStatus::Refunded).await
    }

    async fn get_reservation(&self, reservation_id: ReservationId) -> Result<Reservation> {
        let row = sqlx::query(
            "SELECT id, user_id, amount, job_id, status, created_at, settled_at FROM credit_reservations WHERE id = $1",
        )
        .bind(reservation_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(LedgerError::UnknownReservation(reservation_id))?;
        row_to_reservation(&row)
    }

    async fn list_pending_reservations(&self, created_before: DateTime<Utc>) -> Result<Vec<Reservation>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, amount, job_id, status, created_at, settled_at
            FROM credit_reservations
            WHERE status = 'pending' AND created_at < $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(created_before)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_reservation).collect()
    }

    async fn list_transactions(&self, user_id: UserId, skip: usize, limit: usize) -> Result<Vec<CreditTransaction>> {
        // Surface AccountNotFound rather than an empty page
        self.get_account(user_id).await?;

        let rows = sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM credit_transactions WHERE user_id = $1 ORDER BY seq DESC OFFSET $2 LIMIT $3"
        ))
        .bind(user_id)
        .bind(skip as i64)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_transaction).collect()
    }

    async fn verify(&self, user_id: UserId) -> Result<LedgerAudit> {
        let mut tx = self.pool.begin().await?;

        // FOR SHARE keeps writers out while the log is read, so balance and log agree
        let balance: i64 = sqlx::query_scalar("SELECT balance FROM credit_accounts WHERE user_id = $1 FOR SHARE")
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(LedgerError::AccountNotFound(user_id))?;

        let rows = sqlx::query(&format!(
            "SELECT {TRANSACTION_COLUMNS} FROM credit_transactions WHERE user_id = $1 ORDER BY seq ASC"
        ))
        .bind(user_id)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        let transactions = rows.iter().map(row_to_transaction).collect::<Result<Vec<_>>>()?;
        Ok(replay(user_id, balance, &transactions))
    }

    async fn verify_all(&self) -> Result<Vec<LedgerAudit>> {
        let users: Vec<UserId> = sqlx::query_scalar("SELECT user_id FROM credit_accounts ORDER BY created_at")
            .fetch_all(&self.pool)
            .await?;

        let mut audits = Vec::with_capacity(users.len());
        for user_id in users {
            audits.push(self.verify(user_id).await?);
        }
        Ok(audits)
    }
}

fn row_to_account(row: &PgRow) -> Result<CreditAccount> {
    let tier: String = row.try_get("tier")?;
    Ok(CreditAccount {
        user_id: row.try_get("user_id")?,
        tier: tier
            .parse()
            .map_err(|e: String| LedgerError::Other(anyhow!("Corrupt account row: {}", e)))?,
        balance: row.try_get("balance")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_transaction(row: &PgRow) -> Result<CreditTransaction> {
    let kind: String = row.try_get("kind")?;
    Ok(CreditTransaction {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        kind: kind
            .parse()
            .map_err(|e: String| LedgerError::Other(anyhow!("Corrupt transaction row: {}", e)))?,
        amount: row.try_get("amount")?,
        balance_after: row.try_get("balance_after")?,
        job_id: row.try_get("job_id")?,
        reservation_id: row.try_get("reservation_id")?,
        description: row.try_get("description")?,
        sequence: row.try_get("seq")?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_reservation(row: &PgRow) -> Result<Reservation> {
    let status: String = row.try_get("status")?;
    Ok(Reservation {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        amount: row.try_get("amount")?,
        job_id: row.try_get("job_id")?,
        status: status
            .parse()
            .map_err(|e: String| LedgerError::Other(anyhow!("Corrupt reservation row: {}", e)))?,
        created_at: row.try_get("created_at")?,
        settled_at: row.try_get("settled_at")?,
    })
}
