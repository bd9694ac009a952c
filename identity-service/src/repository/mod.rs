//! Persistence interfaces.
//!
//! Engines depend only on these traits. `PgStore` backs them with PostgreSQL,
//! `MemoryStore` with process memory for tests and local development. Fast
//! shared state (revocation watermarks, rate-limit counters) has its own traits
//! so it can live in Redis independently of the relational store.

pub mod memory;
pub mod postgres;

use std::{future::Future, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{
    ApiKey, AuthorizationCode, ClientApp, Membership, MembershipRemoval, Organization,
    Permission, RefreshToken, Role, User,
};

pub use memory::MemoryStore;
pub use postgres::PgStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Store backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    /// Timeouts may be retried by the caller; nothing else may.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Timeout(_))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Bound a store call by `limit`, failing with [`StoreError::Timeout`].
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> StoreResult<T>
where
    F: Future<Output = StoreResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(limit)),
    }
}

/// Attempts and initial backoff for [`with_retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(200),
        }
    }
}

/// [`with_timeout`] for idempotent calls, re-running `op` after a timeout with
/// doubling backoff until `policy.attempts` is spent.
///
/// Only reads and rate-limit counts go through here. Code redemption and
/// refresh rotation are state transitions and are never retried.
pub async fn with_retry<T, F, Fut>(limit: Duration, policy: RetryPolicy, mut op: F) -> StoreResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = StoreResult<T>>,
{
    let mut attempt = 1;
    let mut delay = policy.base_delay;
    loop {
        match with_timeout(limit, op()).await {
            Err(e) if e.is_retryable() && attempt < policy.attempts => {
                tracing::warn!(attempt, error = %e, "Retrying store call");
                tokio::time::sleep(delay).await;
                delay = delay.saturating_mul(2).min(policy.max_delay);
                attempt += 1;
            }
            result => return result,
        }
    }
}

/// Outcome of the compare-and-set that consumes a refresh token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotateOutcome {
    Rotated,
    /// Another caller consumed (or revoked) the predecessor first.
    AlreadyConsumed,
}

#[async_trait]
pub trait StoreHealth: Send + Sync {
    async fn health_check(&self) -> StoreResult<()>;
}

#[async_trait]
pub trait OrganizationRepository: Send + Sync {
    /// Insert the organization and its creator's admin membership atomically.
    async fn insert_with_admin(&self, org: &Organization, admin: &Membership) -> StoreResult<()>;
    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<Organization>>;
    async fn find_membership(&self, org_id: Uuid, user_id: Uuid) -> StoreResult<Option<Membership>>;
    async fn insert_membership(&self, membership: &Membership) -> StoreResult<()>;
    /// Delete a membership unless it is the organization's last active holder
    /// of `admin_role_id`.
    async fn remove_membership(
        &self,
        org_id: Uuid,
        user_id: Uuid,
        admin_role_id: Uuid,
    ) -> StoreResult<MembershipRemoval>;
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn insert(&self, user: &User) -> StoreResult<()>;
    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<User>>;
    async fn find_by_email(&self, email: &str) -> StoreResult<Option<User>>;
}

#[async_trait]
pub trait RoleRepository: Send + Sync {
    async fn insert(&self, role: &Role) -> StoreResult<()>;
    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<Role>>;
    async fn find_system_by_name(&self, name: &str) -> StoreResult<Option<Role>>;
    /// System templates plus the organization's own custom roles.
    async fn list_visible(&self, org_id: Uuid) -> StoreResult<Vec<Role>>;
    /// Every permission linked to the role, unfiltered.
    async fn permissions_for_role(&self, role_id: Uuid) -> StoreResult<Vec<Permission>>;
    /// Link permissions to a role. Existing links are kept. Callers validate
    /// organization scope first.
    async fn assign_permissions(&self, role_id: Uuid, permission_ids: &[Uuid]) -> StoreResult<()>;
}

#[async_trait]
pub trait PermissionRepository: Send + Sync {
    async fn insert(&self, permission: &Permission) -> StoreResult<()>;
    async fn find_by_ids(&self, ids: &[Uuid]) -> StoreResult<Vec<Permission>>;
    async fn list_system(&self) -> StoreResult<Vec<Permission>>;
}

#[async_trait]
pub trait ClientAppRepository: Send + Sync {
    async fn insert(&self, client: &ClientApp) -> StoreResult<()>;
    async fn find_by_client_id(&self, client_id: &str) -> StoreResult<Option<ClientApp>>;
}

#[async_trait]
pub trait AuthorizationCodeRepository: Send + Sync {
    async fn insert(&self, code: &AuthorizationCode) -> StoreResult<()>;
    async fn find_by_hash(&self, code_hash: &str) -> StoreResult<Option<AuthorizationCode>>;
    /// Flip `used` from false to true and record the family the code is about
    /// to create. Returns `false` when the code was already used.
    async fn redeem(&self, id: Uuid, family_id: Uuid) -> StoreResult<bool>;
}

#[async_trait]
pub trait RefreshTokenRepository: Send + Sync {
    /// Insert a token. A token joining an already revoked family is stored revoked.
    async fn insert(&self, token: &RefreshToken) -> StoreResult<()>;
    async fn find_by_hash(&self, token_hash: &str) -> StoreResult<Option<RefreshToken>>;
    /// Consume `predecessor_id` and insert `successor` in one transaction.
    async fn rotate(
        &self,
        predecessor_id: Uuid,
        successor: &RefreshToken,
        now: DateTime<Utc>,
    ) -> StoreResult<RotateOutcome>;
    /// Revoke every token of the family and remember the family as revoked.
    async fn revoke_family(&self, family_id: Uuid, reason: &str) -> StoreResult<u64>;
    async fn is_family_revoked(&self, family_id: Uuid) -> StoreResult<bool>;
    async fn revoke_all_for_user(&self, user_id: Uuid) -> StoreResult<u64>;
    async fn revoke_all_for_user_in_org(&self, user_id: Uuid, org_id: Uuid) -> StoreResult<u64>;
    async fn revoke_all_for_org(&self, org_id: Uuid) -> StoreResult<u64>;
}

#[async_trait]
pub trait ApiKeyRepository: Send + Sync {
    async fn insert(&self, key: &ApiKey) -> StoreResult<()>;
    async fn find_by_key_id(&self, key_id: &str) -> StoreResult<Option<ApiKey>>;
    async fn touch(&self, id: Uuid, at: DateTime<Utc>) -> StoreResult<()>;
    /// Returns `false` when no key with that id exists in the organization.
    async fn revoke(&self, org_id: Uuid, key_id: &str) -> StoreResult<bool>;
}

/// Granularity of a session watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatermarkScope {
    User(Uuid),
    Organization(Uuid),
    UserInOrganization { user_id: Uuid, org_id: Uuid },
}

impl WatermarkScope {
    pub fn key(&self) -> String {
        match self {
            WatermarkScope::User(user_id) => format!("revoked:user:{}", user_id),
            WatermarkScope::Organization(org_id) => format!("revoked:org:{}", org_id),
            WatermarkScope::UserInOrganization { user_id, org_id } => {
                format!("revoked:user:{}:org:{}", user_id, org_id)
            }
        }
    }
}

/// Watermarks applicable to one (user, organization) pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Watermarks {
    pub user: Option<DateTime<Utc>>,
    pub organization: Option<DateTime<Utc>>,
    pub user_in_organization: Option<DateTime<Utc>>,
}

impl Watermarks {
    pub fn latest(&self) -> Option<DateTime<Utc>> {
        [self.user, self.organization, self.user_in_organization]
            .into_iter()
            .flatten()
            .max()
    }
}

/// Fast shared store for session watermarks and the access-token deny list.
#[async_trait]
pub trait RevocationStore: Send + Sync {
    /// Raise the watermark for `scope` to `at`. Never lowers it.
    async fn raise_watermark(&self, scope: WatermarkScope, at: DateTime<Utc>) -> StoreResult<()>;
    async fn watermarks(&self, user_id: Uuid, org_id: Uuid) -> StoreResult<Watermarks>;
    async fn deny_token(&self, jti: &str, expires_at: DateTime<Utc>) -> StoreResult<()>;
    async fn is_token_denied(&self, jti: &str) -> StoreResult<bool>;
}

/// Atomic increment-with-expiry counters.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment `key`, setting its expiry to `ttl` on creation. Returns the new count.
    async fn increment(&self, key: &str, ttl: Duration) -> StoreResult<u64>;
}

/// Relational repositories handed to the engines.
#[derive(Clone)]
pub struct Repositories {
    pub organizations: Arc<dyn OrganizationRepository>,
    pub users: Arc<dyn UserRepository>,
    pub roles: Arc<dyn RoleRepository>,
    pub permissions: Arc<dyn PermissionRepository>,
    pub clients: Arc<dyn ClientAppRepository>,
    pub codes: Arc<dyn AuthorizationCodeRepository>,
    pub refresh_tokens: Arc<dyn RefreshTokenRepository>,
    pub api_keys: Arc<dyn ApiKeyRepository>,
    pub health: Arc<dyn StoreHealth>,
}

impl Repositories {
    /// Use one backend for every repository.
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: OrganizationRepository
            + UserRepository
            + RoleRepository
            + PermissionRepository
            + ClientAppRepository
            + AuthorizationCodeRepository
            + RefreshTokenRepository
            + ApiKeyRepository
            + StoreHealth
            + 'static,
    {
        Self {
            organizations: store.clone(),
            users: store.clone(),
            roles: store.clone(),
            permissions: store.clone(),
            clients: store.clone(),
            codes: store.clone(),
            refresh_tokens: store.clone(),
            api_keys: store.clone(),
            health: store,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_with_timeout_reports_retryable_error() {
        let result: StoreResult<()> = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(())
        })
        .await;

        let err = result.unwrap_err();
        assert!(matches!(err, StoreError::Timeout(_)));
        assert!(err.is_retryable());
        assert!(!StoreError::Conflict("x".to_string()).is_retryable());
    }

    #[tokio::test]
    async fn test_with_retry_recovers_after_one_timeout() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result = with_retry(Duration::from_millis(10), RetryPolicy::default(), move || async move {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            Ok(7)
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_with_retry_gives_up_and_skips_other_errors() {
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let result: StoreResult<()> = with_retry(Duration::from_millis(5), RetryPolicy::default(), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(StoreError::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let backend_calls = AtomicU32::new(0);
        let counter = &backend_calls;
        let result: StoreResult<()> = with_retry(Duration::from_millis(50), RetryPolicy::default(), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(StoreError::Backend(anyhow::anyhow!("connection refused")))
        })
        .await;
        assert!(matches!(result, Err(StoreError::Backend(_))));
        assert_eq!(backend_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_watermarks_latest() {
        let t1 = Utc::now();
        let t2 = t1 + chrono::Duration::seconds(5);
        let marks = Watermarks {
            user: Some(t1),
            organization: None,
            user_in_organization: Some(t2),
        };
        assert_eq!(marks.latest(), Some(t2));
        assert_eq!(Watermarks::default().latest(), None);
    }
}
