// Accrual calculation worker
//
// Every tick:
// 1. Claim a small batch of REGISTERED (or abandoned PROCESSING) orders
// 2. Match each order's goods against the reward catalog
// 3. Write PROCESSED with the rounded accrual
//
// Orders are processed concurrently and independently. A failed order keeps
// its PROCESSING status and is released for the next tick.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::calculator::compute_accrual;
use super::models::{RegisteredOrder, RegisteredOrderStatus};
use super::repository::{RegisteredOrderStore, RewardCatalog};
use crate::error::{AppError, AppResult};
use crate::shutdown::ShutdownSignal;
use crate::store::CommitOutcome;
use crate::tasks::run_bounded;

#[derive(Debug, Clone)]
pub struct CalculationConfig {
    pub interval: Duration,
    pub batch_size: u32,
    pub concurrency: usize,
}

impl Default for CalculationConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            batch_size: 5,
            concurrency: 16,
        }
    }
}

/// Outcome counts of one tick
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CalculationReport {
    pub claimed: usize,
    pub processed: usize,
    pub failed: usize,
}

pub struct AccrualCalculationWorker {
    orders: Arc<dyn RegisteredOrderStore>,
    catalog: Arc<dyn RewardCatalog>,
    config: CalculationConfig,
}

impl AccrualCalculationWorker {
    pub fn new(
        orders: Arc<dyn RegisteredOrderStore>,
        catalog: Arc<dyn RewardCatalog>,
        config: CalculationConfig,
    ) -> Self {
        Self {
            orders,
            catalog,
            config,
        }
    }

    /// Start the worker loop (runs in background until shutdown)
    pub fn start(self: Arc<Self>, shutdown: ShutdownSignal) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    async fn run(&self, mut shutdown: ShutdownSignal) {
        info!(
            "🧮 Accrual calculation worker started (every {:?}, batch {})",
            self.config.interval, self.config.batch_size
        );

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.wait() => break,
                _ = ticker.tick() => {
                    match self.run_tick().await {
                        Ok(report) if report.claimed > 0 => debug!(
                            processed = report.processed,
                            failed = report.failed,
                            "Accrual calculation tick done"
                        ),
                        Ok(_) => {}
                        Err(e) => error!("❌ Accrual calculation tick failed: {:?}", e),
                    }
                }
            }
        }

        info!("✓ Accrual calculation worker stopped");
    }

    /// One claim-and-process cycle. Only a failed claim aborts the tick.
    pub async fn run_tick(&self) -> AppResult<CalculationReport> {
        let orders = self
            .orders
            .claim_for_processing(self.config.batch_size)
            .await?;

        let mut report = CalculationReport {
            claimed: orders.len(),
            ..Default::default()
        };

        if orders.is_empty() {
            return Ok(report);
        }

        debug!(batch = orders.len(), "📦 Claimed orders for accrual calculation");

        let keyed = orders.into_iter().map(|order| (order.clone(), order));
        let outcomes = run_bounded(keyed, self.config.concurrency, |order| {
            let orders = self.orders.clone();
            let catalog = self.catalog.clone();
            async move { Self::process_order(orders.as_ref(), catalog.as_ref(), &order).await }
        })
        .await;

        for (order, joined) in outcomes {
            let result = joined.unwrap_or_else(|e| {
                Err(AppError::Invariant(format!("calculation task aborted: {}", e)))
            });

            match result {
                Ok(accrual) => {
                    report.processed += 1;
                    info!(order_id = %order.order_id, %accrual, "✓ Accrual calculated");
                }
                Err(e) => {
                    report.failed += 1;
                    error!(order_id = %order.order_id, "❌ Accrual calculation failed: {:?}", e);

                    if let Err(e) = self.orders.release_claim(&order).await {
                        warn!(order_id = %order.order_id, "⚠️ Could not release claim: {:?}", e);
                    }
                }
            }
        }

        Ok(report)
    }

    async fn process_order(
        orders: &dyn RegisteredOrderStore,
        catalog: &dyn RewardCatalog,
        order: &RegisteredOrder,
    ) -> AppResult<Decimal> {
        if order.status != RegisteredOrderStatus::Processing {
            return Err(AppError::Invariant(format!(
                "order {} handed to calculation in status {}",
                order.order_id, order.status
            )));
        }

        let goods = orders.order_goods(&order.order_id).await?;
        let descriptions: Vec<String> = goods.iter().map(|g| g.description.clone()).collect();
        let rules = catalog.match_reward_rules(&descriptions).await?;

        let accrual = compute_accrual(&goods, &rules)?;

        let outcome = orders
            .commit_terminal_result(&order.order_id, RegisteredOrderStatus::Processed, accrual)
            .await?;

        if outcome == CommitOutcome::AlreadyFinal {
            debug!(order_id = %order.order_id, "Order already final, result discarded");
        }

        Ok(accrual)
    }
}
