use axum::{
    extract::{Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use governor::{
    clock::{Clock, DefaultClock},
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use std::num::NonZeroU32;
use std::sync::Arc;

/// Process-wide request limiter. Throttled callers get `429` with a
/// `Retry-After` header in whole seconds.
pub struct RateLimitLayer {
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    clock: DefaultClock,
}

impl RateLimitLayer {
    pub fn per_minute(requests: u32) -> Self {
        let requests = NonZeroU32::new(requests).unwrap_or(NonZeroU32::MIN);
        Self {
            limiter: RateLimiter::direct(Quota::per_minute(requests)),
            clock: DefaultClock::default(),
        }
    }

    /// `None` when the request may pass, otherwise the seconds to wait.
    pub fn check(&self) -> Option<u64> {
        match self.limiter.check() {
            Ok(_) => None,
            Err(not_until) => {
                let wait = not_until.wait_time_from(self.clock.now());
                let secs = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
                Some(secs.max(1))
            }
        }
    }
}

pub async fn rate_limit_middleware(
    State(limit): State<Arc<RateLimitLayer>>,
    req: Request,
    next: Next,
) -> Response {
    match limit.check() {
        None => next.run(req).await,
        Some(retry_after) => {
            let mut response = (
                StatusCode::TOO_MANY_REQUESTS,
                "Rate limit exceeded. Please try again later.",
            )
                .into_response();
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
            response
        }
    }
}
