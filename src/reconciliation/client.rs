use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header::RETRY_AFTER, Client, StatusCode, Url};
use rust_decimal::Decimal;
use tracing::{debug, warn};

use crate::accrual::models::{AccrualOrderInfo, RegisteredOrderStatus};
use crate::error::AuthorityError;

/// What the accrual authority currently says about an order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorityReply {
    /// 204: the authority has no record of the order (yet)
    NotRegistered,
    /// Known but still `REGISTERED` or `PROCESSING`
    Pending(RegisteredOrderStatus),
    Invalid,
    Processed { accrual: Decimal },
}

#[async_trait]
pub trait AccrualAuthority: Send + Sync {
    async fn order_status(&self, order_id: &str) -> Result<AuthorityReply, AuthorityError>;
}

/// HTTP client for `GET {base}/api/orders/{order_id}`
pub struct AccrualClient {
    client: Client,
    base_url: Url,
    fallback_retry_after: u64,
}

impl AccrualClient {
    pub fn new(
        base_url: &str,
        timeout: Duration,
        fallback_retry_after: u64,
    ) -> Result<Self, AuthorityError> {
        let parsed = Url::parse(base_url)
            .map_err(|e| AuthorityError::InvalidBaseUrl(format!("{}: {}", base_url, e)))?;
        if parsed.cannot_be_a_base() {
            return Err(AuthorityError::InvalidBaseUrl(base_url.to_string()));
        }

        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: parsed,
            fallback_retry_after,
        })
    }

    /// The order id is one path segment, percent-encoded.
    fn order_url(&self, order_id: &str) -> Result<Url, AuthorityError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| AuthorityError::InvalidBaseUrl(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(["api", "orders", order_id]);
        Ok(url)
    }
}

/// Seconds to wait from a `Retry-After` value. Missing, malformed or
/// non-positive values fall back to `fallback`.
pub fn parse_retry_after(value: Option<&str>, fallback: u64) -> u64 {
    value
        .and_then(|v| v.trim().parse::<i64>().ok())
        .filter(|secs| *secs > 0)
        .map(|secs| secs as u64)
        .unwrap_or(fallback)
}

pub fn reply_from_info(info: AccrualOrderInfo) -> Result<AuthorityReply, AuthorityError> {
    match info.status {
        RegisteredOrderStatus::Registered | RegisteredOrderStatus::Processing => {
            Ok(AuthorityReply::Pending(info.status))
        }
        RegisteredOrderStatus::Invalid => Ok(AuthorityReply::Invalid),
        RegisteredOrderStatus::Processed => match info.accrual {
            Some(accrual) if accrual < Decimal::ZERO => Err(AuthorityError::Decode(format!(
                "order {} processed with negative accrual {}",
                info.order, accrual
            ))),
            Some(accrual) => Ok(AuthorityReply::Processed { accrual }),
            None => Err(AuthorityError::MissingAccrual(info.order)),
        },
    }
}

#[async_trait]
impl AccrualAuthority for AccrualClient {
    async fn order_status(&self, order_id: &str) -> Result<AuthorityReply, AuthorityError> {
        let url = self.order_url(order_id)?;
        debug!("🌐 Polling accrual authority: {}", url);

        let response = self.client.get(url).send().await?;

        match response.status() {
            StatusCode::OK => {
                let body = response.text().await?;
                let info: AccrualOrderInfo = serde_json::from_str(&body)
                    .map_err(|e| AuthorityError::Decode(format!("{}: {}", e, body)))?;

                if info.order != order_id {
                    return Err(AuthorityError::Decode(format!(
                        "asked for order {}, got {}",
                        order_id, info.order
                    )));
                }

                reply_from_info(info)
            }
            StatusCode::NO_CONTENT => Ok(AuthorityReply::NotRegistered),
            StatusCode::TOO_MANY_REQUESTS => {
                let header = response
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok());
                let retry_after_secs = parse_retry_after(header, self.fallback_retry_after);

                warn!(order_id, retry_after_secs, "⏳ Accrual authority throttled us");
                Err(AuthorityError::RateLimited { retry_after_secs })
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(AuthorityError::Status {
                    status: status.as_u16(),
                    body,
                })
            }
        }
    }
}
