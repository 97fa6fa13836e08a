use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, Type};
use std::fmt;
use validator::{Validate, ValidationError};

/// Status of an order registered for accrual calculation.
///
/// `Registered` and `Processing` are claimable; the other two are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(type_name = "registered_order_status", rename_all = "UPPERCASE")]
pub enum RegisteredOrderStatus {
    Registered,
    Processing,
    Invalid,
    Processed,
}

impl RegisteredOrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegisteredOrderStatus::Registered => "REGISTERED",
            RegisteredOrderStatus::Processing => "PROCESSING",
            RegisteredOrderStatus::Invalid => "INVALID",
            RegisteredOrderStatus::Processed => "PROCESSED",
        }
    }
}

impl fmt::Display for RegisteredOrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Order registered for accrual. Line items live in `order_goods`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RegisteredOrder {
    pub order_id: String,
    pub status: RegisteredOrderStatus,
    #[serde(with = "rust_decimal::serde::float_option")]
    pub accrual: Option<Decimal>,
    /// Lease held by the claim that returned this row
    #[serde(skip)]
    pub claimed_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Body of `POST /api/orders`
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RegisterOrderRequest {
    #[validate(length(min = 1, message = "order id must not be empty"))]
    pub order: String,
    #[validate(
        length(min = 1, message = "order must contain at least one good"),
        custom = "validate_prices"
    )]
    pub goods: Vec<OrderGood>,
}

fn validate_prices(goods: &Vec<OrderGood>) -> Result<(), ValidationError> {
    if goods.iter().any(|good| good.price.is_sign_negative()) {
        let mut error = ValidationError::new("negative_price");
        error.message = Some("good price must not be negative".into());
        return Err(error);
    }
    Ok(())
}

/// Line item attached to a registered order. Immutable after registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct OrderGood {
    pub description: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub price: Decimal,
}

/// How a reward rule turns a matched item into points
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "reward_type")]
pub enum RewardType {
    /// Percentage of the item price
    #[serde(rename = "%")]
    #[sqlx(rename = "%")]
    Percent,
    /// Fixed number of points per matched item
    #[serde(rename = "pt")]
    #[sqlx(rename = "pt")]
    Points,
}

/// Catalog rule: any item whose description contains `match_key` earns `reward`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow, Validate)]
pub struct RewardRule {
    #[serde(rename = "match")]
    #[sqlx(rename = "match")]
    #[validate(length(min = 1, message = "match must not be empty"))]
    pub match_key: String,
    #[serde(with = "rust_decimal::serde::float")]
    #[validate(custom = "validate_reward")]
    pub reward: Decimal,
    pub reward_type: RewardType,
}

fn validate_reward(reward: &Decimal) -> Result<(), ValidationError> {
    if *reward <= Decimal::ZERO {
        let mut error = ValidationError::new("non_positive_reward");
        error.message = Some("reward must be positive".into());
        return Err(error);
    }
    Ok(())
}

/// Wire body of `GET /api/orders/{order_id}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccrualOrderInfo {
    pub order: String,
    pub status: RegisteredOrderStatus,
    #[serde(
        default,
        with = "rust_decimal::serde::float_option",
        skip_serializing_if = "Option::is_none"
    )]
    pub accrual: Option<Decimal>,
}

impl From<RegisteredOrder> for AccrualOrderInfo {
    fn from(order: RegisteredOrder) -> Self {
        Self {
            order: order.order_id,
            status: order.status,
            accrual: order.accrual,
        }
    }
}
