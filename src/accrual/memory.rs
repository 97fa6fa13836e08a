// In-memory stores with the same claim and write-once semantics as the
// Postgres repository. Test-only.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::RwLock;

use super::models::*;
use super::repository::{RegisteredOrderStore, RewardCatalog};
use crate::error::{AppError, AppResult};
use crate::store::{lease_deadline, CommitOutcome};

struct Entry {
    order: RegisteredOrder,
    goods: Vec<OrderGood>,
}

pub struct MemoryAccrualStore {
    orders: RwLock<HashMap<String, Entry>>,
    rules: RwLock<Vec<RewardRule>>,
    claim_lease: Duration,
    /// Number of upcoming `order_goods` calls that fail
    failing_goods_reads: AtomicUsize,
}

impl MemoryAccrualStore {
    pub fn new(claim_lease: Duration) -> Self {
        Self {
            orders: RwLock::new(HashMap::new()),
            rules: RwLock::new(Vec::new()),
            claim_lease,
            failing_goods_reads: AtomicUsize::new(0),
        }
    }

    pub fn fail_next_goods_reads(&self, count: usize) {
        self.failing_goods_reads.store(count, Ordering::SeqCst);
    }
}

fn is_final(status: RegisteredOrderStatus) -> bool {
    matches!(
        status,
        RegisteredOrderStatus::Invalid | RegisteredOrderStatus::Processed
    )
}

#[async_trait]
impl RegisteredOrderStore for MemoryAccrualStore {
    async fn register_order(
        &self,
        order_id: &str,
        goods: &[OrderGood],
    ) -> AppResult<RegisteredOrder> {
        let mut orders = self.orders.write().await;
        if orders.contains_key(order_id) {
            return Err(AppError::Conflict(format!(
                "order {} is already registered for accrual",
                order_id
            )));
        }

        let order = RegisteredOrder {
            order_id: order_id.to_string(),
            status: RegisteredOrderStatus::Registered,
            accrual: None,
            claimed_until: None,
            created_at: Utc::now(),
        };
        orders.insert(
            order_id.to_string(),
            Entry {
                order: order.clone(),
                goods: goods.to_vec(),
            },
        );
        Ok(order)
    }

    async fn claim_for_processing(&self, limit: u32) -> AppResult<Vec<RegisteredOrder>> {
        let now = Utc::now();
        let mut orders = self.orders.write().await;

        let mut claimable: Vec<&mut Entry> = orders
            .values_mut()
            .filter(|entry| match entry.order.status {
                RegisteredOrderStatus::Registered => true,
                RegisteredOrderStatus::Processing => {
                    entry.order.claimed_until.map_or(true, |until| until < now)
                }
                _ => false,
            })
            .collect();
        claimable.sort_by_key(|entry| entry.order.created_at);

        let mut claimed = Vec::new();
        for entry in claimable.into_iter().take(limit as usize) {
            entry.order.status = RegisteredOrderStatus::Processing;
            entry.order.claimed_until = Some(lease_deadline(now, self.claim_lease));
            claimed.push(entry.order.clone());
        }

        Ok(claimed)
    }

    async fn order_goods(&self, order_id: &str) -> AppResult<Vec<OrderGood>> {
        let failing = self
            .failing_goods_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(AppError::Database(sqlx::Error::PoolTimedOut));
        }

        let orders = self.orders.read().await;
        Ok(orders
            .get(order_id)
            .map(|entry| entry.goods.clone())
            .unwrap_or_default())
    }

    async fn commit_terminal_result(
        &self,
        order_id: &str,
        status: RegisteredOrderStatus,
        accrual: Decimal,
    ) -> AppResult<CommitOutcome> {
        let mut orders = self.orders.write().await;
        let entry = orders
            .get_mut(order_id)
            .ok_or_else(|| AppError::Invariant(format!("unknown order {}", order_id)))?;

        if is_final(entry.order.status) {
            return Ok(CommitOutcome::AlreadyFinal);
        }

        entry.order.status = status;
        entry.order.accrual = Some(accrual);
        entry.order.claimed_until = None;
        Ok(CommitOutcome::Applied)
    }

    async fn release_claim(&self, claimed: &RegisteredOrder) -> AppResult<()> {
        let mut orders = self.orders.write().await;
        if let Some(entry) = orders.get_mut(&claimed.order_id) {
            if entry.order.status == RegisteredOrderStatus::Processing
                && entry.order.claimed_until == claimed.claimed_until
            {
                entry.order.claimed_until = None;
            }
        }
        Ok(())
    }

    async fn get_order(&self, order_id: &str) -> AppResult<Option<RegisteredOrder>> {
        let orders = self.orders.read().await;
        Ok(orders.get(order_id).map(|entry| entry.order.clone()))
    }
}

#[async_trait]
impl RewardCatalog for MemoryAccrualStore {
    async fn save_reward_rule(&self, rule: &RewardRule) -> AppResult<RewardRule> {
        let mut rules = self.rules.write().await;
        if rules.iter().any(|known| known.match_key == rule.match_key) {
            return Err(AppError::Conflict(format!(
                "reward rule {:?} already exists",
                rule.match_key
            )));
        }
        rules.push(rule.clone());
        Ok(rule.clone())
    }

    async fn match_reward_rules(&self, descriptions: &[String]) -> AppResult<Vec<RewardRule>> {
        let rules = self.rules.read().await;
        Ok(rules
            .iter()
            .filter(|rule| {
                descriptions
                    .iter()
                    .any(|description| description.contains(rule.match_key.as_str()))
            })
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_concurrent_claims_do_not_overlap() {
        let store = Arc::new(MemoryAccrualStore::new(Duration::from_secs(60)));
        for i in 0..20 {
            store
                .register_order(&format!("order-{}", i), &[])
                .await
                .unwrap();
        }

        let (a, b) = tokio::join!(
            store.claim_for_processing(15),
            store.claim_for_processing(15)
        );
        let a = a.unwrap();
        let b = b.unwrap();

        assert_eq!(a.len() + b.len(), 20);
        assert!(a.iter().all(|x| b.iter().all(|y| x.order_id != y.order_id)));
    }

    #[tokio::test]
    async fn test_released_claim_is_reclaimable() {
        let store = MemoryAccrualStore::new(Duration::from_secs(60));
        store.register_order("1", &[]).await.unwrap();

        let claimed = store.claim_for_processing(5).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert!(store.claim_for_processing(5).await.unwrap().is_empty());

        store.release_claim(&claimed[0]).await.unwrap();
        let reclaimed = store.claim_for_processing(5).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].status, RegisteredOrderStatus::Processing);
    }

    #[tokio::test]
    async fn test_stale_release_keeps_newer_lease() {
        let store = MemoryAccrualStore::new(Duration::from_secs(60));
        store.register_order("1", &[]).await.unwrap();

        let mut stale = store.claim_for_processing(5).await.unwrap().remove(0);
        let current = stale.claimed_until;
        stale.claimed_until = current.map(|t| t - chrono::Duration::seconds(1));

        store.release_claim(&stale).await.unwrap();
        assert!(store.claim_for_processing(5).await.unwrap().is_empty());
        assert_eq!(
            store.get_order("1").await.unwrap().unwrap().claimed_until,
            current
        );
    }

    #[tokio::test]
    async fn test_duplicate_registration_conflicts() {
        let store = MemoryAccrualStore::new(Duration::from_secs(60));
        store.register_order("1", &[]).await.unwrap();

        let err = store.register_order("1", &[]).await.unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_terminal_result_is_write_once() {
        let store = MemoryAccrualStore::new(Duration::from_secs(60));
        store.register_order("1", &[]).await.unwrap();

        let first = store
            .commit_terminal_result("1", RegisteredOrderStatus::Processed, dec!(10.00))
            .await
            .unwrap();
        let second = store
            .commit_terminal_result("1", RegisteredOrderStatus::Processed, dec!(99.00))
            .await
            .unwrap();

        assert_eq!(first, CommitOutcome::Applied);
        assert_eq!(second, CommitOutcome::AlreadyFinal);
        let order = store.get_order("1").await.unwrap().unwrap();
        assert_eq!(order.accrual, Some(dec!(10.00)));
    }
}
