use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tracing::debug;
use validator::Validate;

use super::models::{AccrualOrderInfo, RegisterOrderRequest, RewardRule};
use super::repository::{RegisteredOrderStore, RewardCatalog};
use crate::error::{AppError, AppResult};

#[derive(Clone)]
pub struct AccrualApiState {
    pub orders: Arc<dyn RegisteredOrderStore>,
    pub catalog: Arc<dyn RewardCatalog>,
}

/// Malformed JSON, or a body of the wrong shape, is a client error like any
/// other validation failure.
fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> AppResult<T> {
    body.map(|Json(value)| value)
        .map_err(|e| AppError::Validation(e.body_text()))
}

/// GET /api/orders/:order_id
///
/// 200 with `{order, status, accrual?}`, or 204 when the order was never
/// registered for accrual.
pub async fn get_order_info(
    State(state): State<AccrualApiState>,
    Path(order_id): Path<String>,
) -> AppResult<Response> {
    match state.orders.get_order(&order_id).await? {
        Some(order) => Ok(Json(AccrualOrderInfo::from(order)).into_response()),
        None => {
            debug!(order_id = %order_id, "Status requested for unknown order");
            Ok(StatusCode::NO_CONTENT.into_response())
        }
    }
}

/// POST /api/orders
///
/// Registers an order and its goods for accrual calculation. 202 with the
/// stored order; 409 if the order id is already registered.
pub async fn register_order(
    State(state): State<AccrualApiState>,
    body: Result<Json<RegisterOrderRequest>, JsonRejection>,
) -> AppResult<Response> {
    let request = json_body(body)?;
    request.validate()?;

    let order = state
        .orders
        .register_order(&request.order, &request.goods)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(order)).into_response())
}

/// POST /api/goods
///
/// Adds a reward rule to the catalog. 200 with the stored rule; 409 if a
/// rule with the same match string exists.
pub async fn save_reward_rule(
    State(state): State<AccrualApiState>,
    body: Result<Json<RewardRule>, JsonRejection>,
) -> AppResult<Json<RewardRule>> {
    let rule = json_body(body)?;
    rule.validate()?;

    let saved = state.catalog.save_reward_rule(&rule).await?;
    Ok(Json(saved))
}

/// GET /health
pub async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}
