use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{debug, info};

use super::models::*;
use crate::error::{AppError, AppResult};
use crate::store::{lease_deadline, CommitOutcome};

/// User orders and the balance ledger as seen by the reconciliation worker.
#[async_trait]
pub trait UserOrderStore: Send + Sync {
    /// Atomically claim up to `limit` orders that are `NEW`, or `PROCESSING`
    /// with an expired or released lease, flipping them to `PROCESSING`.
    /// Concurrent claims never return the same order.
    async fn claim_for_processing(&self, limit: u32) -> AppResult<Vec<UserOrder>>;

    /// Single-order terminal write without a ledger entry (used for `INVALID`).
    async fn commit_terminal_result(
        &self,
        order_id: &str,
        status: OrderStatus,
        accrual: Decimal,
    ) -> AppResult<CommitOutcome>;

    /// Mark the order `PROCESSED` with `amount` and credit `user_id` by the
    /// same amount, all or nothing. Returns `AlreadyFinal` without crediting
    /// when the order is already terminal.
    async fn commit_credit_atomically(
        &self,
        order_id: &str,
        user_id: i64,
        amount: Decimal,
    ) -> AppResult<CommitOutcome>;

    /// Drop the lease held by this claim so the next tick may reclaim the
    /// order. A lease taken by a newer claim is left alone.
    async fn release_claim(&self, claimed: &UserOrder) -> AppResult<()>;
}

/// Ledger repository - THE source of truth for user orders and balances
pub struct LedgerRepository {
    pool: PgPool,
    claim_lease: Duration,
}

impl LedgerRepository {
    pub fn new(pool: PgPool, claim_lease: Duration) -> Self {
        Self { pool, claim_lease }
    }

    pub async fn begin_tx(&self) -> AppResult<Transaction<'_, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    /// Terminal write inside a caller-owned transaction.
    async fn set_order_result(
        tx: &mut Transaction<'_, Postgres>,
        order_id: &str,
        to_status: OrderStatus,
        accrual: Decimal,
    ) -> AppResult<CommitOutcome> {
        Self::validate_terminal_status(to_status)?;

        let result = sqlx::query(
            r#"
            UPDATE user_orders
            SET status = $2, accrual = $3, claimed_until = NULL
            WHERE order_id = $1 AND status IN ('NEW', 'PROCESSING')
            "#,
        )
        .bind(order_id)
        .bind(to_status)
        .bind(accrual)
        .execute(&mut **tx)
        .await?;

        Ok(CommitOutcome::from_rows_affected(result.rows_affected()))
    }

    async fn append_entry(
        tx: &mut Transaction<'_, Postgres>,
        user_id: i64,
        order_id: &str,
        amount: Decimal,
    ) -> AppResult<LedgerEntry> {
        let entry = sqlx::query_as::<_, LedgerEntry>(
            r#"
            INSERT INTO balance_entries (user_id, order_id, amount)
            VALUES ($1, $2, $3)
            RETURNING id, user_id, order_id, amount, created_at
            "#,
        )
        .bind(user_id)
        .bind(order_id)
        .bind(amount)
        .fetch_one(&mut **tx)
        .await?;

        Ok(entry)
    }

    /// Workers may only write terminal statuses through the commit paths
    fn validate_terminal_status(to: OrderStatus) -> AppResult<()> {
        if !to.is_terminal() {
            return Err(AppError::Invariant(format!(
                "{} is not a terminal order status",
                to
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl UserOrderStore for LedgerRepository {
    async fn claim_for_processing(&self, limit: u32) -> AppResult<Vec<UserOrder>> {
        let now = Utc::now();
        let orders = sqlx::query_as::<_, UserOrder>(
            r#"
            UPDATE user_orders
            SET status = 'PROCESSING', claimed_until = $2
            WHERE order_id IN (
                SELECT order_id
                FROM user_orders
                WHERE status = 'NEW'
                   OR (status = 'PROCESSING' AND (claimed_until IS NULL OR claimed_until < $3))
                ORDER BY uploaded_at
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING order_id, user_id, status, accrual, claimed_until, uploaded_at
            "#,
        )
        .bind(limit as i64)
        .bind(lease_deadline(now, self.claim_lease))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        debug!("Claimed {} user orders", orders.len());
        Ok(orders)
    }

    async fn commit_terminal_result(
        &self,
        order_id: &str,
        status: OrderStatus,
        accrual: Decimal,
    ) -> AppResult<CommitOutcome> {
        let mut tx = self.begin_tx().await?;
        let outcome = Self::set_order_result(&mut tx, order_id, status, accrual).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    async fn commit_credit_atomically(
        &self,
        order_id: &str,
        user_id: i64,
        amount: Decimal,
    ) -> AppResult<CommitOutcome> {
        let mut tx = self.begin_tx().await?;

        let outcome =
            Self::set_order_result(&mut tx, order_id, OrderStatus::Processed, amount).await?;

        if outcome == CommitOutcome::AlreadyFinal {
            // Dropping the transaction rolls it back; nothing was written.
            return Ok(outcome);
        }

        let entry = Self::append_entry(&mut tx, user_id, order_id, amount).await?;
        tx.commit().await?;

        info!(order_id, user_id, %amount, entry_id = %entry.id, "💰 Accrual credited");
        Ok(outcome)
    }

    async fn release_claim(&self, claimed: &UserOrder) -> AppResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE user_orders
            SET claimed_until = NULL
            WHERE order_id = $1 AND status = 'PROCESSING' AND claimed_until = $2
            "#,
        )
        .bind(&claimed.order_id)
        .bind(claimed.claimed_until)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            debug!(order_id = %claimed.order_id, "Claim already superseded, nothing released");
        }
        Ok(())
    }
}
