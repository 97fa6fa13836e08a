use std::sync::Arc;

use axum::{
    middleware::from_fn_with_state,
    routing::{get, post},
    Router,
};
use tower_http::{compression::CompressionLayer, trace::TraceLayer};
use tracing::info;

use crate::{
    accrual::handler::{
        get_order_info, health_check, register_order, save_reward_rule, AccrualApiState,
    },
    middleware::{rate_limit_middleware, RateLimitLayer},
    shutdown::ShutdownSignal,
};

pub fn create_app(state: AccrualApiState, rate_limit: Arc<RateLimitLayer>) -> Router {
    info!("⚙️ Setting up HTTP routes...");

    // Only the status lookup is limited; registration is the intake path.
    let status = Router::new()
        .route("/api/orders/:order_id", get(get_order_info))
        .route_layer(from_fn_with_state(rate_limit, rate_limit_middleware))
        .with_state(state.clone());

    let intake = Router::new()
        .route("/api/orders", post(register_order))
        .route("/api/goods", post(save_reward_rule))
        .with_state(state);

    let app = Router::new()
        .route("/health", get(health_check))
        .merge(status)
        .merge(intake)
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http());

    info!("✓ HTTP routes configured");
    app
}

/// Serve until `shutdown` fires, then drain in-flight requests.
pub async fn run_server(
    app: Router,
    bind_address: &str,
    mut shutdown: ShutdownSignal,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_address).await?;
    info!("🌐 Server listening on: {}", bind_address);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.wait().await })
        .await?;

    info!("✓ HTTP server stopped");
    Ok(())
}
