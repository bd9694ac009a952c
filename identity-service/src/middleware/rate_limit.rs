use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::Response,
};
use service_core::{error::AppError, middleware::rate_limit::client_ip};
use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use crate::services::{RateLimitDecision, RateLimitScope, RateLimiter};

/// Key used when the caller address cannot be determined.
pub const UNKNOWN_CLIENT: &str = "unknown";

/// Middleware state: which scope a route group is limited in.
#[derive(Clone)]
pub struct ScopedRateLimit {
    pub limiter: RateLimiter,
    pub scope: RateLimitScope,
    pub trusted_proxies: Arc<[IpAddr]>,
}

impl ScopedRateLimit {
    pub fn new(limiter: RateLimiter, scope: RateLimitScope, trusted_proxies: Arc<[IpAddr]>) -> Self {
        Self {
            limiter,
            scope,
            trusted_proxies,
        }
    }
}

/// Caller IP as a rate-limit key. Forwarded headers count only behind a trusted proxy.
pub fn ip_key(req: &Request, trusted_proxies: &[IpAddr]) -> String {
    client_ip(
        req.headers(),
        req.extensions().get::<ConnectInfo<SocketAddr>>(),
        trusted_proxies,
    )
    .map(|ip| ip.to_string())
    .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

/// Turn a blocked decision into a 429.
pub fn enforce(decision: RateLimitDecision, scope: RateLimitScope) -> Result<(), AppError> {
    match decision {
        RateLimitDecision::Allowed { .. } => Ok(()),
        RateLimitDecision::Blocked { retry_after } => Err(AppError::TooManyRequests(
            format!("Too many {} requests. Please try again later.", scope.as_str().replace('_', " ")),
            Some(retry_after),
        )),
    }
}

/// Limit requests per caller IP within the configured scope.
pub async fn ip_rate_limit_middleware(
    State(limit): State<ScopedRateLimit>,
    req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let key = ip_key(&req, &limit.trusted_proxies);
    let decision = limit.limiter.check(limit.scope, &key).await;
    if !decision.is_allowed() {
        tracing::warn!(scope = %limit.scope, ip = %key, "Request rate limited");
    }
    enforce(decision, limit.scope)?;

    Ok(next.run(req).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::StatusCode, response::IntoResponse};

    #[test]
    fn test_blocked_maps_to_429_with_retry_after() {
        let err = enforce(RateLimitDecision::Blocked { retry_after: 42 }, RateLimitScope::Login).unwrap_err();
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers().get("retry-after").unwrap(), "42");
    }

    #[test]
    fn test_ip_key() {
        let req = Request::builder().uri("/").body(Body::empty()).unwrap();
        assert_eq!(ip_key(&req, &[]), UNKNOWN_CLIENT);

        let proxy: IpAddr = "10.0.0.1".parse().unwrap();
        let mut req = Request::builder()
            .uri("/")
            .header("x-forwarded-for", "198.51.100.9")
            .body(Body::empty())
            .unwrap();
        req.extensions_mut()
            .insert(ConnectInfo(SocketAddr::new(proxy, 443)));

        assert_eq!(ip_key(&req, &[]), "10.0.0.1");
        assert_eq!(ip_key(&req, &[proxy]), "198.51.100.9");
    }
}
