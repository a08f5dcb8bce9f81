//! Per-IP request throttling for credential endpoints.
//!
//! A cheap in-memory token bucket in front of the durable lockout counters.
//! It protects the service from floods; it does not replace the lockout.

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use governor::{
    Quota, RateLimiter,
    clock::{Clock, DefaultClock},
    state::keyed::DefaultKeyedStateStore,
};
use std::{num::NonZeroU32, sync::Arc};

use crate::api::{ApiError, extract_client_ip};
use crate::cli::IpExtractor;

/// Per-IP rate limiter.
pub type IpLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

const LOGIN_PER_SEC: NonZeroU32 = NonZeroU32::new(1).unwrap();
const LOGIN_BURST: NonZeroU32 = NonZeroU32::new(5).unwrap();
const SIGNUP_PER_MIN: NonZeroU32 = NonZeroU32::new(3).unwrap();
const RESET_PER_MIN: NonZeroU32 = NonZeroU32::new(3).unwrap();
const PERMISSIVE_PER_SEC: NonZeroU32 = NonZeroU32::new(10_000).unwrap();

/// Quotas for the throttled endpoint groups.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    /// Login: 5 requests burst, refilling one per second
    pub login: Quota,
    /// Registration and confirmation resend: 3 per minute
    pub signup: Quota,
    /// Password reset requests: 3 per minute
    pub password_reset: Quota,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            login: Quota::per_second(LOGIN_PER_SEC).allow_burst(LOGIN_BURST),
            signup: Quota::per_minute(SIGNUP_PER_MIN),
            password_reset: Quota::per_minute(RESET_PER_MIN),
        }
    }
}

impl RateLimitConfig {
    /// Effectively unlimited; for tests and deployments that throttle upstream.
    pub fn permissive() -> Self {
        let quota = Quota::per_second(PERMISSIVE_PER_SEC);
        Self {
            login: quota,
            signup: quota,
            password_reset: quota,
        }
    }
}

/// One limiter plus what it needs to key requests.
pub struct LimiterState {
    limiter: IpLimiter,
    ip_extractor: Option<IpExtractor>,
    message: &'static str,
}

impl LimiterState {
    pub fn new(
        quota: Quota,
        ip_extractor: Option<IpExtractor>,
        message: &'static str,
    ) -> Arc<Self> {
        Arc::new(Self {
            limiter: RateLimiter::keyed(quota),
            ip_extractor,
            message,
        })
    }
}

/// Middleware rejecting requests over the limiter's quota with 429 and `Retry-After`.
pub async fn rate_limit(
    State(state): State<Arc<LimiterState>>,
    request: Request,
    next: Next,
) -> Response {
    let ip = match extract_client_ip(&request, state.ip_extractor.as_ref()) {
        Ok(ip) => ip,
        Err(_) => {
            return ApiError::forbidden("Unable to determine client IP").into_response();
        }
    };

    match state.limiter.check_key(&ip) {
        Ok(_) => next.run(request).await,
        Err(not_until) => {
            let wait = not_until.wait_time_from(DefaultClock::default().now());
            let retry_after = wait.as_secs_f64().ceil().max(1.0) as i64;
            ApiError::too_many_requests(state.message, retry_after).into_response()
        }
    }
}
