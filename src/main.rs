mod accrual;
mod bootstrap;
mod config;
mod error;
mod ledger;
mod middleware;
mod reconciliation;
mod server;
mod shutdown;
mod store;
mod tasks;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::shutdown::Shutdown;

// Initialize logging and tracing
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "info,tower_http=debug,loyalty_backend=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    info!("🚀 Starting loyalty accrual backend");

    let config = Config::from_env().context("invalid configuration")?;
    let components = bootstrap::initialize_components(&config).await?;

    let shutdown = Shutdown::new();

    let calculation = components
        .calculation_worker
        .start(shutdown.subscribe());
    let reconciliation = components
        .reconciliation_worker
        .start(shutdown.subscribe());

    let app = server::create_app(components.api_state, components.rate_limit);
    let mut server = tokio::spawn({
        let signal = shutdown.subscribe();
        let bind_address = config.bind_address.clone();
        async move { server::run_server(app, &bind_address, signal).await }
    });

    info!("🌐 Backend started successfully");

    let server_result = tokio::select! {
        _ = shutdown::os_signal() => None,
        result = &mut server => Some(result),
    };
    shutdown.trigger();

    let drain = async {
        let server_result = match server_result {
            Some(result) => result,
            None => server.await,
        };
        match server_result {
            Ok(Err(e)) => error!("❌ HTTP server failed: {:?}", e),
            Err(e) => error!("❌ HTTP server task failed: {:?}", e),
            Ok(Ok(())) => {}
        }

        let (calc, recon) = tokio::join!(calculation, reconciliation);
        for (name, result) in [("calculation worker", calc), ("reconciliation worker", recon)] {
            if let Err(e) = result {
                error!("❌ {} task failed: {:?}", name, e);
            }
        }
    };

    if tokio::time::timeout(config.shutdown_grace(), drain).await.is_err() {
        warn!(
            "⚠️ Shutdown grace period of {:?} elapsed, exiting with work in flight",
            config.shutdown_grace()
        );
    }

    info!("👋 Shutdown complete");
    Ok(())
}
