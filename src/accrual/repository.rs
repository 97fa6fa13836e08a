use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use sqlx::PgPool;
use tracing::{debug, info};

use super::models::*;
use crate::error::{AppError, AppResult};
use crate::store::{lease_deadline, CommitOutcome};

/// Orders registered for accrual calculation.
#[async_trait]
pub trait RegisteredOrderStore: Send + Sync {
    /// Store a new `REGISTERED` order with its goods, all or nothing.
    /// A known order id is a `Conflict`.
    async fn register_order(
        &self,
        order_id: &str,
        goods: &[OrderGood],
    ) -> AppResult<RegisteredOrder>;

    /// Atomically claim up to `limit` orders that are `REGISTERED`, or
    /// `PROCESSING` with an expired or released lease, flipping them to
    /// `PROCESSING` under a fresh lease. Concurrent claims never overlap.
    async fn claim_for_processing(&self, limit: u32) -> AppResult<Vec<RegisteredOrder>>;

    async fn order_goods(&self, order_id: &str) -> AppResult<Vec<OrderGood>>;

    /// Write-once terminal update. Ignored if the order is already terminal.
    async fn commit_terminal_result(
        &self,
        order_id: &str,
        status: RegisteredOrderStatus,
        accrual: Decimal,
    ) -> AppResult<CommitOutcome>;

    /// Drop the lease held by this claim so the next tick may reclaim the
    /// order. A lease taken by a newer claim is left alone.
    async fn release_claim(&self, claimed: &RegisteredOrder) -> AppResult<()>;

    async fn get_order(&self, order_id: &str) -> AppResult<Option<RegisteredOrder>>;
}

/// Reward rules keyed by match string.
#[async_trait]
pub trait RewardCatalog: Send + Sync {
    /// Add a rule. A known match string is a `Conflict`.
    async fn save_reward_rule(&self, rule: &RewardRule) -> AppResult<RewardRule>;

    /// Every rule whose match string is a substring of at least one description.
    async fn match_reward_rules(&self, descriptions: &[String]) -> AppResult<Vec<RewardRule>>;
}

/// Postgres-backed registered orders and reward catalog
pub struct AccrualRepository {
    pool: PgPool,
    claim_lease: Duration,
}

impl AccrualRepository {
    pub fn new(pool: PgPool, claim_lease: Duration) -> Self {
        Self { pool, claim_lease }
    }
}

#[async_trait]
impl RegisteredOrderStore for AccrualRepository {
    async fn register_order(
        &self,
        order_id: &str,
        goods: &[OrderGood],
    ) -> AppResult<RegisteredOrder> {
        let mut tx = self.pool.begin().await?;

        let order = sqlx::query_as::<_, RegisteredOrder>(
            r#"
            INSERT INTO registered_orders (order_id)
            VALUES ($1)
            ON CONFLICT (order_id) DO NOTHING
            RETURNING order_id, status, accrual, claimed_until, created_at
            "#,
        )
        .bind(order_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| {
            AppError::Conflict(format!("order {} is already registered for accrual", order_id))
        })?;

        for (position, good) in goods.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO order_goods (order_id, position, description, price)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(order_id)
            .bind(position as i32)
            .bind(&good.description)
            .bind(good.price)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        info!(order_id, goods = goods.len(), "📝 Order registered for accrual");
        Ok(order)
    }

    async fn claim_for_processing(&self, limit: u32) -> AppResult<Vec<RegisteredOrder>> {
        let now = Utc::now();
        let orders = sqlx::query_as::<_, RegisteredOrder>(
            r#"
            UPDATE registered_orders
            SET status = 'PROCESSING', claimed_until = $2
            WHERE order_id IN (
                SELECT order_id
                FROM registered_orders
                WHERE status = 'REGISTERED'
                   OR (status = 'PROCESSING' AND (claimed_until IS NULL OR claimed_until < $3))
                ORDER BY created_at
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING order_id, status, accrual, claimed_until, created_at
            "#,
        )
        .bind(limit as i64)
        .bind(lease_deadline(now, self.claim_lease))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        debug!("Claimed {} registered orders", orders.len());
        Ok(orders)
    }

    async fn order_goods(&self, order_id: &str) -> AppResult<Vec<OrderGood>> {
        let goods = sqlx::query_as::<_, OrderGood>(
            r#"
            SELECT description, price
            FROM order_goods
            WHERE order_id = $1
            ORDER BY position
            "#,
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(goods)
    }

    async fn commit_terminal_result(
        &self,
        order_id: &str,
        status: RegisteredOrderStatus,
        accrual: Decimal,
    ) -> AppResult<CommitOutcome> {
        let result = sqlx::query(
            r#"
            UPDATE registered_orders
            SET status = $2, accrual = $3, claimed_until = NULL
            WHERE order_id = $1 AND status IN ('REGISTERED', 'PROCESSING')
            "#,
        )
        .bind(order_id)
        .bind(status)
        .bind(accrual)
        .execute(&self.pool)
        .await?;

        Ok(CommitOutcome::from_rows_affected(result.rows_affected()))
    }

    async fn release_claim(&self, claimed: &RegisteredOrder) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE registered_orders
            SET claimed_until = NULL
            WHERE order_id = $1 AND status = 'PROCESSING' AND claimed_until = $2
            "#,
        )
        .bind(&claimed.order_id)
        .bind(claimed.claimed_until)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_order(&self, order_id: &str) -> AppResult<Option<RegisteredOrder>> {
        let order = sqlx::query_as::<_, RegisteredOrder>(
            r#"
            SELECT order_id, status, accrual, claimed_until, created_at
            FROM registered_orders
            WHERE order_id = $1
            "#,
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(order)
    }
}

#[async_trait]
impl RewardCatalog for AccrualRepository {
    async fn save_reward_rule(&self, rule: &RewardRule) -> AppResult<RewardRule> {
        let saved = sqlx::query_as::<_, RewardRule>(
            r#"
            INSERT INTO reward_rules (match, reward, reward_type)
            VALUES ($1, $2, $3)
            ON CONFLICT (match) DO NOTHING
            RETURNING match, reward, reward_type
            "#,
        )
        .bind(&rule.match_key)
        .bind(rule.reward)
        .bind(rule.reward_type)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| {
            AppError::Conflict(format!("reward rule {:?} already exists", rule.match_key))
        })?;

        info!(rule = %saved.match_key, "🏷️ Reward rule saved");
        Ok(saved)
    }

    async fn match_reward_rules(&self, descriptions: &[String]) -> AppResult<Vec<RewardRule>> {
        if descriptions.is_empty() {
            return Ok(Vec::new());
        }

        // strpos keeps LIKE wildcards in match strings literal.
        let rules = sqlx::query_as::<_, RewardRule>(
            r#"
            SELECT match, reward, reward_type
            FROM reward_rules
            WHERE EXISTS (
                SELECT 1
                FROM unnest($1::text[]) AS description
                WHERE strpos(description, reward_rules.match) > 0
            )
            "#,
        )
        .bind(descriptions)
        .fetch_all(&self.pool)
        .await?;

        Ok(rules)
    }
}
