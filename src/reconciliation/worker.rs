// Order reconciliation worker
//
// Every tick:
// 1. Skip entirely while the accrual authority has us backed off
// 2. Claim a batch of NEW (or abandoned PROCESSING) user orders
// 3. Ask the authority for each order's status
// 4. PROCESSED: set the accrual and credit the user in one transaction
//    INVALID: finalize with accrual 0, no ledger entry
//    anything else: release the claim and try again next tick
//
// A 429 from the authority pauses all polling for the advertised Retry-After,
// including orders of the same batch that have not been polled yet.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::backoff::Backoff;
use super::client::{AccrualAuthority, AuthorityReply};
use crate::error::{AppError, AppResult};
use crate::ledger::models::{OrderStatus, UserOrder};
use crate::ledger::repository::UserOrderStore;
use crate::shutdown::ShutdownSignal;
use crate::store::CommitOutcome;
use crate::tasks::run_bounded;

#[derive(Debug, Clone)]
pub struct ReconciliationConfig {
    pub interval: Duration,
    pub batch_size: u32,
    pub concurrency: usize,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            batch_size: 50,
            concurrency: 16,
        }
    }
}

/// Per-order result of a successful reconciliation attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Credited(Decimal),
    Invalidated,
    /// Another attempt already finalized the order
    AlreadyFinal,
    /// Authority has no final answer yet
    Pending,
    /// Skipped because polling is backed off
    Deferred,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconciliationReport {
    pub claimed: usize,
    pub credited: usize,
    pub invalidated: usize,
    pub pending: usize,
    pub failed: usize,
    /// Tick skipped because of an active backoff
    pub skipped: bool,
}

pub struct OrderReconciliationWorker {
    orders: Arc<dyn UserOrderStore>,
    authority: Arc<dyn AccrualAuthority>,
    backoff: Arc<Backoff>,
    config: ReconciliationConfig,
}

impl OrderReconciliationWorker {
    pub fn new(
        orders: Arc<dyn UserOrderStore>,
        authority: Arc<dyn AccrualAuthority>,
        config: ReconciliationConfig,
    ) -> Self {
        Self {
            orders,
            authority,
            backoff: Arc::new(Backoff::new()),
            config,
        }
    }

    #[cfg(test)]
    fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Start the worker loop (runs in background until shutdown)
    pub fn start(self: Arc<Self>, shutdown: ShutdownSignal) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(shutdown).await })
    }

    async fn run(&self, mut shutdown: ShutdownSignal) {
        info!(
            "🔄 Order reconciliation worker started (every {:?}, batch {})",
            self.config.interval, self.config.batch_size
        );

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            if let Some(wait) = self.backoff.remaining() {
                info!("⏸️ Polling paused for {:?}", wait);
                tokio::select! {
                    _ = shutdown.wait() => break,
                    _ = sleep(wait) => {}
                }
            }

            tokio::select! {
                _ = shutdown.wait() => break,
                _ = ticker.tick() => {
                    match self.run_tick().await {
                        Ok(report) if report.claimed > 0 => debug!(
                            credited = report.credited,
                            invalidated = report.invalidated,
                            pending = report.pending,
                            failed = report.failed,
                            "Reconciliation tick done"
                        ),
                        Ok(report) if report.skipped => debug!("Reconciliation tick skipped"),
                        Ok(_) => {}
                        Err(e) => error!("❌ Reconciliation tick failed: {:?}", e),
                    }
                }
            }
        }

        info!("✓ Order reconciliation worker stopped");
    }

    /// One claim-and-reconcile cycle. Only a failed claim aborts the tick.
    pub async fn run_tick(&self) -> AppResult<ReconciliationReport> {
        if !self.backoff.is_ready() {
            debug!("Reconciliation tick skipped, authority backoff active");
            return Ok(ReconciliationReport {
                skipped: true,
                ..Default::default()
            });
        }

        let orders = self
            .orders
            .claim_for_processing(self.config.batch_size)
            .await?;

        let mut report = ReconciliationReport {
            claimed: orders.len(),
            ..Default::default()
        };

        if orders.is_empty() {
            return Ok(report);
        }

        debug!(batch = orders.len(), "📦 Claimed user orders for reconciliation");

        let keyed = orders.into_iter().map(|order| (order.clone(), order));
        let outcomes = run_bounded(keyed, self.config.concurrency, |order| {
            let orders = self.orders.clone();
            let authority = self.authority.clone();
            let backoff = self.backoff.clone();
            async move {
                Self::process_order(orders.as_ref(), authority.as_ref(), &backoff, &order).await
            }
        })
        .await;

        for (order, joined) in outcomes {
            let order_id = &order.order_id;
            let result = joined.unwrap_or_else(|e| {
                Err(AppError::Invariant(format!("reconciliation task aborted: {}", e)))
            });

            let release = match result {
                Ok(Resolution::Credited(amount)) => {
                    report.credited += 1;
                    info!(order_id = %order_id, %amount, "✓ Order reconciled");
                    false
                }
                Ok(Resolution::Invalidated) => {
                    report.invalidated += 1;
                    info!(order_id = %order_id, "🚫 Order invalidated by authority");
                    false
                }
                Ok(Resolution::AlreadyFinal) => {
                    debug!(order_id = %order_id, "Order already final, result discarded");
                    false
                }
                Ok(Resolution::Pending) | Ok(Resolution::Deferred) => {
                    report.pending += 1;
                    true
                }
                Err(e) => {
                    report.failed += 1;
                    error!(order_id = %order_id, "❌ Reconciliation failed: {:?}", e);
                    true
                }
            };

            if release {
                if let Err(e) = self.orders.release_claim(&order).await {
                    warn!(order_id = %order_id, "⚠️ Could not release claim: {:?}", e);
                }
            }
        }

        Ok(report)
    }

    async fn process_order(
        orders: &dyn UserOrderStore,
        authority: &dyn AccrualAuthority,
        backoff: &Backoff,
        order: &UserOrder,
    ) -> AppResult<Resolution> {
        if order.status != OrderStatus::Processing {
            return Err(AppError::Invariant(format!(
                "order {} handed to reconciliation in status {}",
                order.order_id, order.status
            )));
        }

        if !backoff.is_ready() {
            return Ok(Resolution::Deferred);
        }

        let reply = match authority.order_status(&order.order_id).await {
            Ok(reply) => reply,
            Err(e) => match e.retry_after_secs() {
                // Siblings still waiting for a permit see the backoff at once.
                Some(secs) => {
                    backoff.defer(secs);
                    return Ok(Resolution::Deferred);
                }
                None => return Err(e.into()),
            },
        };

        let resolution = match reply {
            AuthorityReply::Processed { accrual } => {
                match orders
                    .commit_credit_atomically(&order.order_id, order.user_id, accrual)
                    .await?
                {
                    CommitOutcome::Applied => Resolution::Credited(accrual),
                    CommitOutcome::AlreadyFinal => Resolution::AlreadyFinal,
                }
            }
            AuthorityReply::Invalid => {
                match orders
                    .commit_terminal_result(&order.order_id, OrderStatus::Invalid, Decimal::ZERO)
                    .await?
                {
                    CommitOutcome::Applied => Resolution::Invalidated,
                    CommitOutcome::AlreadyFinal => Resolution::AlreadyFinal,
                }
            }
            AuthorityReply::NotRegistered | AuthorityReply::Pending(_) => Resolution::Pending,
        };

        Ok(resolution)
    }
}
