use std::{sync::Arc, time::Duration};

use sqlx::{postgres::PgPoolOptions, PgPool};
use tracing::info;

use crate::{
    accrual::{
        handler::AccrualApiState, AccrualCalculationWorker, AccrualRepository, CalculationConfig,
    },
    config::Config,
    error::AppResult,
    ledger::LedgerRepository,
    middleware::RateLimitLayer,
    reconciliation::{AccrualClient, OrderReconciliationWorker, ReconciliationConfig},
};

/// Everything `main` needs to run the process.
pub struct AppComponents {
    pub calculation_worker: Arc<AccrualCalculationWorker>,
    pub reconciliation_worker: Arc<OrderReconciliationWorker>,
    pub api_state: AccrualApiState,
    pub rate_limit: Arc<RateLimitLayer>,
}

pub async fn initialize_components(config: &Config) -> AppResult<AppComponents> {
    info!("Initializing application components ...");

    let pool = initialize_database(&config.database_url).await?;

    let accrual = Arc::new(AccrualRepository::new(pool.clone(), config.claim_lease()));
    let ledger = Arc::new(LedgerRepository::new(pool, config.claim_lease()));

    let concurrency = config.worker_concurrency as usize;

    let calculation_worker = Arc::new(AccrualCalculationWorker::new(
        accrual.clone(),
        accrual.clone(),
        CalculationConfig {
            interval: Duration::from_secs(config.calculation_interval_secs),
            batch_size: config.calculation_batch_size,
            concurrency,
        },
    ));
    info!("✓ Accrual calculation worker configured");

    let authority = Arc::new(AccrualClient::new(
        &config.accrual_system_address,
        config.authority_timeout(),
        config.rate_limit_fallback_secs,
    )?);
    info!(
        "✓ Accrual authority client configured: {}",
        config.accrual_system_address
    );

    let reconciliation_worker = Arc::new(OrderReconciliationWorker::new(
        ledger,
        authority,
        ReconciliationConfig {
            interval: Duration::from_secs(config.reconciliation_interval_secs),
            batch_size: config.reconciliation_batch_size,
            concurrency,
        },
    ));
    info!("✓ Order reconciliation worker configured");

    Ok(AppComponents {
        calculation_worker,
        reconciliation_worker,
        api_state: AccrualApiState {
            orders: accrual.clone(),
            catalog: accrual,
        },
        rate_limit: Arc::new(RateLimitLayer::per_minute(
            config.status_rate_limit_per_minute,
        )),
    })
}

async fn initialize_database(database_url: &str) -> AppResult<PgPool> {
    info!("📊 Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(50)
        .min_connections(5)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await?;

    info!("✓ Database pool configured: 50 max connections");

    info!("🔄 Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("✓ Migrations applied");

    Ok(pool)
}
