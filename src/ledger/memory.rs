// In-memory user orders and ledger. Test-only.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::models::*;
use super::repository::UserOrderStore;
use crate::error::{AppError, AppResult};
use crate::store::{lease_deadline, CommitOutcome};

#[derive(Default)]
struct State {
    orders: HashMap<String, UserOrder>,
    ledger: Vec<LedgerEntry>,
}

pub struct MemoryLedgerStore {
    // Orders and ledger share one lock so a credit is all or nothing.
    state: RwLock<State>,
    claim_lease: Duration,
    /// Number of upcoming credits that fail before writing anything
    failing_credits: AtomicUsize,
}

impl MemoryLedgerStore {
    pub fn new(claim_lease: Duration) -> Self {
        Self {
            state: RwLock::new(State::default()),
            claim_lease,
            failing_credits: AtomicUsize::new(0),
        }
    }

    pub async fn add_order(&self, order_id: &str, user_id: i64) {
        let mut state = self.state.write().await;
        state.orders.insert(
            order_id.to_string(),
            UserOrder {
                order_id: order_id.to_string(),
                user_id,
                status: OrderStatus::New,
                accrual: None,
                claimed_until: None,
                uploaded_at: Utc::now(),
            },
        );
    }

    pub async fn get_order(&self, order_id: &str) -> Option<UserOrder> {
        let state = self.state.read().await;
        state.orders.get(order_id).cloned()
    }

    /// Sum of the user's ledger entries
    pub async fn balance(&self, user_id: i64) -> Decimal {
        let state = self.state.read().await;
        state
            .ledger
            .iter()
            .filter(|entry| entry.user_id == user_id)
            .map(|entry| entry.amount)
            .sum()
    }

    pub async fn entries_for(&self, order_id: &str) -> Vec<LedgerEntry> {
        let state = self.state.read().await;
        state
            .ledger
            .iter()
            .filter(|entry| entry.order_id == order_id)
            .cloned()
            .collect()
    }

    pub fn fail_next_credits(&self, count: usize) {
        self.failing_credits.store(count, Ordering::SeqCst);
    }
}

fn finalize(
    state: &mut State,
    order_id: &str,
    status: OrderStatus,
    accrual: Decimal,
) -> AppResult<CommitOutcome> {
    if !status.is_terminal() {
        return Err(AppError::Invariant(format!(
            "{} is not a terminal order status",
            status
        )));
    }

    let order = state
        .orders
        .get_mut(order_id)
        .ok_or_else(|| AppError::Invariant(format!("unknown order {}", order_id)))?;

    if order.status.is_terminal() {
        return Ok(CommitOutcome::AlreadyFinal);
    }

    order.status = status;
    order.accrual = Some(accrual);
    order.claimed_until = None;
    Ok(CommitOutcome::Applied)
}

#[async_trait]
impl UserOrderStore for MemoryLedgerStore {
    async fn claim_for_processing(&self, limit: u32) -> AppResult<Vec<UserOrder>> {
        let now = Utc::now();
        let mut state = self.state.write().await;

        let mut claimable: Vec<&mut UserOrder> = state
            .orders
            .values_mut()
            .filter(|order| match order.status {
                OrderStatus::New => true,
                OrderStatus::Processing => order.claimed_until.map_or(true, |until| until < now),
                _ => false,
            })
            .collect();
        claimable.sort_by_key(|order| order.uploaded_at);

        let mut claimed = Vec::new();
        for order in claimable.into_iter().take(limit as usize) {
            order.status = OrderStatus::Processing;
            order.claimed_until = Some(lease_deadline(now, self.claim_lease));
            claimed.push(order.clone());
        }

        Ok(claimed)
    }

    async fn commit_terminal_result(
        &self,
        order_id: &str,
        status: OrderStatus,
        accrual: Decimal,
    ) -> AppResult<CommitOutcome> {
        let mut state = self.state.write().await;
        finalize(&mut state, order_id, status, accrual)
    }

    async fn commit_credit_atomically(
        &self,
        order_id: &str,
        user_id: i64,
        amount: Decimal,
    ) -> AppResult<CommitOutcome> {
        let failing = self
            .failing_credits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(AppError::Database(sqlx::Error::PoolTimedOut));
        }

        let mut state = self.state.write().await;
        let outcome = finalize(&mut state, order_id, OrderStatus::Processed, amount)?;

        if outcome == CommitOutcome::Applied {
            state.ledger.push(LedgerEntry {
                id: Uuid::new_v4(),
                user_id,
                order_id: order_id.to_string(),
                amount,
                created_at: Utc::now(),
            });
        }

        Ok(outcome)
    }

    async fn release_claim(&self, claimed: &UserOrder) -> AppResult<()> {
        let mut state = self.state.write().await;
        if let Some(order) = state.orders.get_mut(&claimed.order_id) {
            if order.status == OrderStatus::Processing && order.claimed_until == claimed.claimed_until
            {
                order.claimed_until = None;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_duplicate_credits_apply_once() {
        let store = Arc::new(MemoryLedgerStore::new(Duration::from_secs(60)));
        store.add_order("1", 7).await;

        let (a, b) = tokio::join!(
            store.commit_credit_atomically("1", 7, dec!(100.00)),
            store.commit_credit_atomically("1", 7, dec!(100.00))
        );
        let mut outcomes = vec![a.unwrap(), b.unwrap()];
        outcomes.sort_by_key(|o| *o == CommitOutcome::AlreadyFinal);

        assert_eq!(
            outcomes,
            vec![CommitOutcome::Applied, CommitOutcome::AlreadyFinal]
        );
        assert_eq!(store.entries_for("1").await.len(), 1);
        assert_eq!(store.balance(7).await, dec!(100.00));
    }

    #[tokio::test]
    async fn test_failed_credit_writes_nothing() {
        let store = MemoryLedgerStore::new(Duration::from_secs(60));
        store.add_order("1", 7).await;
        store.fail_next_credits(1);

        assert!(store
            .commit_credit_atomically("1", 7, dec!(5))
            .await
            .is_err());

        let order = store.get_order("1").await.unwrap();
        assert_eq!(order.status, OrderStatus::New);
        assert_eq!(order.accrual, None);
        assert!(store.entries_for("1").await.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_claims_do_not_overlap() {
        let store = Arc::new(MemoryLedgerStore::new(Duration::from_secs(60)));
        for i in 0..10 {
            store.add_order(&i.to_string(), 1).await;
        }

        let (a, b) = tokio::join!(store.claim_for_processing(6), store.claim_for_processing(6));
        let a = a.unwrap();
        let b = b.unwrap();

        assert_eq!(a.len() + b.len(), 10);
        assert!(a.iter().all(|x| b.iter().all(|y| x.order_id != y.order_id)));
    }

    #[tokio::test]
    async fn test_stale_release_keeps_newer_lease() {
        let store = MemoryLedgerStore::new(Duration::from_secs(60));
        store.add_order("1", 3).await;

        let claimed = store.claim_for_processing(1).await.unwrap().remove(0);
        let mut stale = claimed.clone();
        stale.claimed_until = claimed.claimed_until.map(|t| t - chrono::Duration::seconds(5));

        store.release_claim(&stale).await.unwrap();
        assert!(store.claim_for_processing(1).await.unwrap().is_empty());

        store.release_claim(&claimed).await.unwrap();
        assert_eq!(store.claim_for_processing(1).await.unwrap().len(), 1);
    }
}
