use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{prelude::FromRow, Type};
use std::fmt;
use uuid::Uuid;

/// User order status enum
///
/// Valid transitions:
/// - New → Processing
/// - Processing → Processing (reclaim), Processed, Invalid
/// - Terminal states (Processed, Invalid) → NO TRANSITIONS ALLOWED
///
/// The claim and commit queries encode these transitions in their `WHERE`
/// clauses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(type_name = "order_status", rename_all = "UPPERCASE")]
pub enum OrderStatus {
    New,
    Processing,
    Invalid,
    Processed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::New => "NEW",
            OrderStatus::Processing => "PROCESSING",
            OrderStatus::Invalid => "INVALID",
            OrderStatus::Processed => "PROCESSED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Invalid | OrderStatus::Processed)
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Order uploaded by a user, awaiting its accrual from the authority.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UserOrder {
    pub order_id: String,
    pub user_id: i64,
    pub status: OrderStatus,
    #[serde(with = "rust_decimal::serde::float_option")]
    pub accrual: Option<Decimal>,
    /// Lease held by the claim that returned this row
    #[serde(skip)]
    pub claimed_until: Option<DateTime<Utc>>,
    pub uploaded_at: DateTime<Utc>,
}

/// Ledger entry. Positive amounts are accrual credits, negative ones withdrawals.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub user_id: i64,
    pub order_id: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub amount: Decimal,
    pub created_at: DateTime<Utc>,
}
