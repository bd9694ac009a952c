//! Fixed-window rate limiting over the shared counter store.

use chrono::{DateTime, Utc};
use service_core::middleware::rate_limit::{check_keyed, create_keyed_rate_limiter, KeyedRateLimiter};
use std::{collections::HashMap, fmt, sync::Arc, time::Duration};

use super::audit::{AuditEvent, AuditEventKind, AuditSink};
use crate::config::{RateLimitConfig, ScopeLimit, StoreFailureMode};
use crate::repository::{with_retry, CounterStore, RetryPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitScope {
    Registration,
    Login,
    PasswordReset,
    TokenRefresh,
    OAuthToken,
    ApiCalls,
}

impl RateLimitScope {
    pub const ALL: [RateLimitScope; 6] = [
        RateLimitScope::Registration,
        RateLimitScope::Login,
        RateLimitScope::PasswordReset,
        RateLimitScope::TokenRefresh,
        RateLimitScope::OAuthToken,
        RateLimitScope::ApiCalls,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitScope::Registration => "registration",
            RateLimitScope::Login => "login",
            RateLimitScope::PasswordReset => "password_reset",
            RateLimitScope::TokenRefresh => "token_refresh",
            RateLimitScope::OAuthToken => "oauth_token",
            RateLimitScope::ApiCalls => "api_calls",
        }
    }

    fn limit(&self, config: &RateLimitConfig) -> ScopeLimit {
        match self {
            RateLimitScope::Registration => config.registration,
            RateLimitScope::Login => config.login,
            RateLimitScope::PasswordReset => config.password_reset,
            RateLimitScope::TokenRefresh => config.token_refresh,
            RateLimitScope::OAuthToken => config.oauth_token,
            RateLimitScope::ApiCalls => config.api_calls,
        }
    }
}

impl fmt::Display for RateLimitScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    /// `remaining` is `None` when the shared count is unknown
    Allowed { remaining: Option<u32> },
    Blocked { retry_after: u64 },
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allowed { .. })
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    config: RateLimitConfig,
    local: HashMap<RateLimitScope, KeyedRateLimiter>,
    audit: Arc<dyn AuditSink>,
    timeout: Duration,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn CounterStore>,
        config: RateLimitConfig,
        audit: Arc<dyn AuditSink>,
        timeout: Duration,
    ) -> Self {
        let local = RateLimitScope::ALL
            .into_iter()
            .map(|scope| {
                let limit = scope.limit(&config);
                (scope, create_keyed_rate_limiter(limit.attempts, limit.window_seconds))
            })
            .collect();

        Self {
            store,
            config,
            local,
            audit,
            timeout,
        }
    }

    pub async fn check(&self, scope: RateLimitScope, key: &str) -> RateLimitDecision {
        self.check_at(scope, key, Utc::now()).await
    }

    /// Count one request for `key` in the window containing `now`.
    pub async fn check_at(&self, scope: RateLimitScope, key: &str, now: DateTime<Utc>) -> RateLimitDecision {
        let limit = scope.limit(&self.config);
        let window = limit.window_seconds.max(1) as i64;
        let window_index = now.timestamp().div_euclid(window);
        let retry_after = ((window_index + 1) * window - now.timestamp()).max(1) as u64;
        let counter_key = format!("rl:{}:{}:{}", scope, key, window_index);

        let ttl = Duration::from_secs(window as u64);
        let count = match with_retry(self.timeout, RetryPolicy::default(), || {
            self.store.increment(&counter_key, ttl)
        })
        .await
        {
            Ok(count) => count,
            Err(e) => {
                tracing::error!(
                    scope = %scope,
                    error = %e,
                    policy = ?self.config.store_failure_mode,
                    "Rate limit store unavailable"
                );
                return self.on_store_failure(scope, key, retry_after);
            }
        };

        if count > u64::from(limit.attempts) {
            tracing::warn!(scope = %scope, key = %key, count, "Rate limit exceeded");
            if count == u64::from(limit.attempts) + 1 {
                self.audit.record(AuditEvent::new(
                    AuditEventKind::RateLimited,
                    format!("{} limit reached", scope),
                ));
            }
            return RateLimitDecision::Blocked { retry_after };
        }

        RateLimitDecision::Allowed {
            remaining: Some(limit.attempts - count as u32),
        }
    }

    fn on_store_failure(&self, scope: RateLimitScope, key: &str, retry_after: u64) -> RateLimitDecision {
        match self.config.store_failure_mode {
            StoreFailureMode::Open => RateLimitDecision::Allowed { remaining: None },
            StoreFailureMode::Closed => RateLimitDecision::Blocked { retry_after },
            StoreFailureMode::Local => match self.local.get(&scope) {
                Some(limiter) => match check_keyed(limiter, key) {
                    Ok(()) => RateLimitDecision::Allowed { remaining: None },
                    Err(retry_after) => RateLimitDecision::Blocked { retry_after },
                },
                None => RateLimitDecision::Blocked { retry_after },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{MemoryStore, StoreError, StoreResult};
    use crate::services::audit::MemoryAuditSink;
    use async_trait::async_trait;

    struct FailingCounter;

    #[async_trait]
    impl CounterStore for FailingCounter {
        async fn increment(&self, _key: &str, _ttl: Duration) -> StoreResult<u64> {
            Err(StoreError::Backend(anyhow::anyhow!("connection refused")))
        }
    }

    struct StalledCounter;

    #[async_trait]
    impl CounterStore for StalledCounter {
        async fn increment(&self, _key: &str, _ttl: Duration) -> StoreResult<u64> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(1)
        }
    }

    /// Stalls past the timeout on its first call only.
    struct SlowOnceCounter {
        calls: std::sync::atomic::AtomicU32,
        inner: MemoryStore,
    }

    #[async_trait]
    impl CounterStore for SlowOnceCounter {
        async fn increment(&self, key: &str, ttl: Duration) -> StoreResult<u64> {
            if self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            self.inner.increment(key, ttl).await
        }
    }

    fn config(mode: StoreFailureMode) -> RateLimitConfig {
        RateLimitConfig {
            login: ScopeLimit {
                attempts: 3,
                window_seconds: 60,
            },
            store_failure_mode: mode,
            ..RateLimitConfig::default()
        }
    }

    fn limiter(store: Arc<dyn CounterStore>, mode: StoreFailureMode) -> (RateLimiter, Arc<MemoryAuditSink>) {
        let audit = Arc::new(MemoryAuditSink::new());
        let limiter = RateLimiter::new(store, config(mode), audit.clone(), Duration::from_millis(50));
        (limiter, audit)
    }

    fn window_start() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_040, 0).unwrap()
    }

    #[tokio::test]
    async fn test_blocks_after_limit_and_resets_next_window() {
        let (limiter, audit) = limiter(Arc::new(MemoryStore::new()), StoreFailureMode::Local);
        let t = window_start();

        for expected in [2, 1, 0] {
            assert_eq!(
                limiter.check_at(RateLimitScope::Login, "10.0.0.1", t).await,
                RateLimitDecision::Allowed {
                    remaining: Some(expected)
                }
            );
        }
        let blocked = limiter
            .check_at(RateLimitScope::Login, "10.0.0.1", t + chrono::Duration::seconds(15))
            .await;
        assert_eq!(blocked, RateLimitDecision::Blocked { retry_after: 45 });
        assert_eq!(audit.count(AuditEventKind::RateLimited), 1);

        let next = limiter
            .check_at(RateLimitScope::Login, "10.0.0.1", t + chrono::Duration::seconds(60))
            .await;
        assert!(next.is_allowed());
    }

    #[tokio::test]
    async fn test_scopes_and_keys_are_independent() {
        let (limiter, _) = limiter(Arc::new(MemoryStore::new()), StoreFailureMode::Local);
        let t = window_start();
        for _ in 0..3 {
            limiter.check_at(RateLimitScope::Login, "a", t).await;
        }
        assert!(!limiter.check_at(RateLimitScope::Login, "a", t).await.is_allowed());
        assert!(limiter.check_at(RateLimitScope::Login, "b", t).await.is_allowed());
        assert!(limiter.check_at(RateLimitScope::OAuthToken, "a", t).await.is_allowed());
    }

    #[tokio::test]
    async fn test_failure_policies() {
        let (open, _) = limiter(Arc::new(FailingCounter), StoreFailureMode::Open);
        let (closed, _) = limiter(Arc::new(FailingCounter), StoreFailureMode::Closed);
        let (local, _) = limiter(Arc::new(FailingCounter), StoreFailureMode::Local);

        for _ in 0..5 {
            assert!(open.check(RateLimitScope::Login, "k").await.is_allowed());
            assert!(!closed.check(RateLimitScope::Login, "k").await.is_allowed());
        }

        for _ in 0..3 {
            assert!(local.check(RateLimitScope::Login, "k").await.is_allowed());
        }
        assert!(!local.check(RateLimitScope::Login, "k").await.is_allowed());
    }

    #[tokio::test]
    async fn test_store_timeout_applies_policy() {
        let (closed, _) = limiter(Arc::new(StalledCounter), StoreFailureMode::Closed);
        assert!(matches!(
            closed.check(RateLimitScope::Login, "k").await,
            RateLimitDecision::Blocked { .. }
        ));
    }

    #[tokio::test]
    async fn test_transient_timeout_is_retried_against_shared_count() {
        let store = Arc::new(SlowOnceCounter {
            calls: std::sync::atomic::AtomicU32::new(0),
            inner: MemoryStore::new(),
        });
        let (closed, _) = limiter(store.clone(), StoreFailureMode::Closed);
        let t = window_start();

        assert_eq!(
            closed.check_at(RateLimitScope::Login, "k", t).await,
            RateLimitDecision::Allowed {
                remaining: Some(2)
            }
        );
        assert_eq!(store.calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }
}
