//! Refresh token rotation with reuse detection.
//!
//! Every refresh token is single-use. Presenting a token that was already
//! rotated away means two parties hold the same family, so the whole family is
//! revoked and both lose their session.

use chrono::{Duration, Utc};
use service_core::utils::random_token;
use std::{future::Future, sync::Arc};
use thiserror::Error;
use uuid::Uuid;

use super::audit::{AuditEvent, AuditEventKind, AuditSink};
use super::jwt::{AccessTokenClaims, AccessTokenRequest, JwtService, TokenError};
use super::rbac::{RbacError, RbacService};
use crate::models::{RefreshToken, RefreshTokenSubject, TokenBinding};
use crate::repository::{
    with_retry, with_timeout, RefreshTokenRepository, RetryPolicy, RotateOutcome, StoreError,
    StoreResult,
};

#[derive(Debug, Error)]
pub enum RotationError {
    #[error("Refresh token not found")]
    NotFound,

    #[error("Refresh token expired")]
    Expired,

    #[error("Refresh token revoked")]
    Revoked,

    #[error("Refresh token reuse detected")]
    ReuseDetected { family_id: Uuid },

    #[error("Refresh token was issued to another client")]
    ClientMismatch,

    #[error(transparent)]
    Rbac(#[from] RbacError),

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Parameters of a new grant.
#[derive(Debug, Clone)]
pub struct GrantRequest {
    pub client_id: String,
    pub user_id: Uuid,
    pub organization_id: Uuid,
    pub scope: String,
    pub binding: TokenBinding,
    /// Pre-allocated family id, e.g. one already recorded on an authorization code
    pub family_id: Option<Uuid>,
}

/// Access + refresh pair handed to a client.
#[derive(Debug, Clone)]
pub struct IssuedTokens {
    pub access_token: String,
    pub refresh_token: String,
    pub family_id: Uuid,
    pub claims: AccessTokenClaims,
    pub expires_in: i64,
}

#[derive(Clone)]
pub struct RotationService {
    refresh_tokens: Arc<dyn RefreshTokenRepository>,
    rbac: RbacService,
    jwt: JwtService,
    audit: Arc<dyn AuditSink>,
    refresh_ttl: Duration,
    timeout: std::time::Duration,
}

impl RotationService {
    pub fn new(
        refresh_tokens: Arc<dyn RefreshTokenRepository>,
        rbac: RbacService,
        jwt: JwtService,
        audit: Arc<dyn AuditSink>,
        refresh_ttl: Duration,
        timeout: std::time::Duration,
    ) -> Self {
        Self {
            refresh_tokens,
            rbac,
            jwt,
            audit,
            refresh_ttl,
            timeout,
        }
    }

    async fn timed<T, F>(&self, fut: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        with_timeout(self.timeout, fut).await
    }

    /// Start a new family. Returns the plaintext refresh token and the family id.
    pub async fn grant(&self, request: GrantRequest) -> Result<(String, Uuid), RotationError> {
        let family_id = request.family_id.unwrap_or_else(Uuid::new_v4);
        let raw = random_token(32);
        let token = RefreshToken::new_root(
            family_id,
            &raw,
            RefreshTokenSubject {
                client_id: request.client_id,
                user_id: request.user_id,
                organization_id: request.organization_id,
                scope: request.scope,
            },
            &request.binding,
            self.refresh_ttl,
        );

        self.timed(self.refresh_tokens.insert(&token)).await?;

        tracing::info!(
            family_id = %family_id,
            user_id = %token.user_id,
            organization_id = %token.organization_id,
            client_id = %token.client_id,
            "Refresh token family started"
        );

        Ok((raw, family_id))
    }

    /// Resolve permissions, start a family and mint the first access token.
    pub async fn start_session(&self, request: GrantRequest) -> Result<IssuedTokens, RotationError> {
        let effective = self
            .rbac
            .resolve_effective_permissions(request.user_id, request.organization_id)
            .await?;

        let user_id = request.user_id;
        let organization_id = request.organization_id;
        let client_id = request.client_id.clone();
        let scope = request.scope.clone();
        let (refresh_token, family_id) = self.grant(request).await?;

        let (access_token, claims) = self.jwt.issue(AccessTokenRequest {
            user_id,
            organization_id,
            session_id: family_id,
            role_id: effective.role_id,
            role_name: effective.role_name,
            permissions: effective.permissions,
            is_superadmin: effective.is_superadmin,
            client_id: Some(client_id),
            scope: Some(scope).filter(|s| !s.is_empty()),
        })?;

        Ok(IssuedTokens {
            access_token,
            refresh_token,
            family_id,
            claims,
            expires_in: self.jwt.access_token_expiry_seconds(),
        })
    }

    /// Exchange a refresh token for its successor and a fresh access token.
    pub async fn rotate(
        &self,
        presented: &str,
        client_id: Option<&str>,
        binding: &TokenBinding,
    ) -> Result<IssuedTokens, RotationError> {
        let token = self
            .timed(self.refresh_tokens.find_by_hash(&RefreshToken::hash_token(presented)))
            .await?
            .ok_or(RotationError::NotFound)?;

        if token.is_consumed() {
            return Err(self.reuse_detected(&token).await);
        }

        if token.revoked || self.timed(self.refresh_tokens.is_family_revoked(token.family_id)).await? {
            return Err(RotationError::Revoked);
        }

        let now = Utc::now();
        if token.is_expired_at(now) {
            return Err(RotationError::Expired);
        }

        if let Some(client_id) = client_id {
            if token.client_id != client_id {
                return Err(RotationError::ClientMismatch);
            }
        }

        let drift = binding.drift_from(&token);
        if !drift.is_empty() {
            tracing::warn!(
                family_id = %token.family_id,
                user_id = %token.user_id,
                changed = ?drift,
                "Refresh token presented with a different client fingerprint"
            );
            self.audit.record(
                AuditEvent::new(
                    AuditEventKind::BindingAnomaly,
                    format!("changed: {}", drift.join(",")),
                )
                .user(token.user_id)
                .organization(token.organization_id)
                .family(token.family_id)
                .client(token.client_id.clone()),
            );
        }

        let effective = self
            .rbac
            .resolve_effective_permissions(token.user_id, token.organization_id)
            .await?;

        let raw = random_token(32);
        let successor = token.successor(&raw, binding, self.refresh_ttl);

        match self
            .timed(self.refresh_tokens.rotate(token.id, &successor, now))
            .await?
        {
            RotateOutcome::Rotated => {}
            RotateOutcome::AlreadyConsumed => return Err(self.reuse_detected(&token).await),
        }

        let (access_token, claims) = self.jwt.issue(AccessTokenRequest {
            user_id: token.user_id,
            organization_id: token.organization_id,
            session_id: token.family_id,
            role_id: effective.role_id,
            role_name: effective.role_name,
            permissions: effective.permissions,
            is_superadmin: effective.is_superadmin,
            client_id: Some(token.client_id.clone()),
            scope: Some(token.scope.clone()).filter(|s| !s.is_empty()),
        })?;

        tracing::info!(
            family_id = %token.family_id,
            predecessor_id = %token.id,
            successor_id = %successor.id,
            "Refresh token rotated"
        );

        Ok(IssuedTokens {
            access_token,
            refresh_token: raw,
            family_id: token.family_id,
            claims,
            expires_in: self.jwt.access_token_expiry_seconds(),
        })
    }

    async fn reuse_detected(&self, token: &RefreshToken) -> RotationError {
        tracing::error!(
            family_id = %token.family_id,
            token_id = %token.id,
            user_id = %token.user_id,
            "Refresh token reuse detected, revoking family"
        );
        self.audit.record(
            AuditEvent::new(AuditEventKind::RefreshReuseDetected, "consumed refresh token presented again")
                .user(token.user_id)
                .organization(token.organization_id)
                .family(token.family_id)
                .client(token.client_id.clone()),
        );

        if let Err(e) = self.revoke_family(token.family_id, "refresh_token_reuse").await {
            tracing::error!(family_id = %token.family_id, error = %e, "Failed to revoke family after reuse");
            return e;
        }

        RotationError::ReuseDetected {
            family_id: token.family_id,
        }
    }

    pub async fn revoke_family(&self, family_id: Uuid, reason: &str) -> Result<u64, RotationError> {
        let revoked = self
            .timed(self.refresh_tokens.revoke_family(family_id, reason))
            .await?;
        self.audit.record(AuditEvent::new(AuditEventKind::FamilyRevoked, reason).family(family_id));
        tracing::info!(family_id = %family_id, revoked, reason, "Token family revoked");
        Ok(revoked)
    }

    pub async fn revoke_all_for_user(&self, user_id: Uuid, reason: &str) -> Result<u64, RotationError> {
        let revoked = self
            .timed(self.refresh_tokens.revoke_all_for_user(user_id))
            .await?;
        tracing::info!(user_id = %user_id, revoked, reason, "Refresh tokens revoked for user");
        Ok(revoked)
    }

    pub async fn revoke_all_for_user_in_org(
        &self,
        user_id: Uuid,
        org_id: Uuid,
        reason: &str,
    ) -> Result<u64, RotationError> {
        let revoked = self
            .timed(self.refresh_tokens.revoke_all_for_user_in_org(user_id, org_id))
            .await?;
        tracing::info!(
            user_id = %user_id,
            organization_id = %org_id,
            revoked,
            reason,
            "Refresh tokens revoked for user in organization"
        );
        Ok(revoked)
    }

    pub async fn revoke_all_for_org(&self, org_id: Uuid, reason: &str) -> Result<u64, RotationError> {
        let revoked = self
            .timed(self.refresh_tokens.revoke_all_for_org(org_id))
            .await?;
        tracing::info!(organization_id = %org_id, revoked, reason, "Refresh tokens revoked for organization");
        Ok(revoked)
    }

    /// Look up a refresh token by its plaintext, for revocation.
    pub async fn find(&self, presented: &str) -> Result<Option<RefreshToken>, RotationError> {
        Ok(self
            .timed(self.refresh_tokens.find_by_hash(&RefreshToken::hash_token(presented)))
            .await?)
    }

    pub async fn is_family_revoked(&self, family_id: Uuid) -> Result<bool, RotationError> {
        Ok(with_retry(self.timeout, RetryPolicy::default(), || {
            self.refresh_tokens.is_family_revoked(family_id)
        })
        .await?)
    }

    pub fn jwt(&self) -> &JwtService {
        &self.jwt
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::User;
    use crate::repository::{MemoryStore, Repositories, UserRepository};
    use crate::services::audit::MemoryAuditSink;

    struct Fixture {
        rotation: RotationService,
        store: Arc<MemoryStore>,
        audit: Arc<MemoryAuditSink>,
        user_id: Uuid,
        org_id: Uuid,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let audit = Arc::new(MemoryAuditSink::new());
        let timeout = std::time::Duration::from_secs(1);
        let rbac = RbacService::new(Repositories::from_store(store.clone()), audit.clone(), timeout);
        rbac.ensure_system_catalog().await.unwrap();

        let user = User::new("alice@example.com".to_string(), None);
        UserRepository::insert(store.as_ref(), &user).await.unwrap();
        let org = rbac.create_organization(user.id, "Acme", "acme").await.unwrap();

        let rotation = RotationService::new(
            store.clone(),
            rbac,
            JwtService::with_hmac_secret(b"rotation-test-secret-rotation-test", "identity-test", 15),
            audit.clone(),
            Duration::days(7),
            timeout,
        );
        Fixture {
            rotation,
            store,
            audit,
            user_id: user.id,
            org_id: org.id,
        }
    }

    fn grant(f: &Fixture) -> GrantRequest {
        GrantRequest {
            client_id: "spa".to_string(),
            user_id: f.user_id,
            organization_id: f.org_id,
            scope: "openid".to_string(),
            binding: TokenBinding::default(),
            family_id: None,
        }
    }

    #[tokio::test]
    async fn test_grant_root_id_is_family_id() {
        let f = fixture().await;
        let (raw, family) = f.rotation.grant(grant(&f)).await.unwrap();
        let stored = f.rotation.find(&raw).await.unwrap().unwrap();
        assert_eq!(stored.id, family);
        assert_eq!(stored.family_id, family);
    }

    #[tokio::test]
    async fn test_rotate_links_predecessor_and_successor() {
        let f = fixture().await;
        let issued = f.rotation.start_session(grant(&f)).await.unwrap();
        assert_eq!(issued.claims.session_id, issued.family_id);

        let rotated = f
            .rotation
            .rotate(&issued.refresh_token, Some("spa"), &TokenBinding::default())
            .await
            .unwrap();
        assert_eq!(rotated.family_id, issued.family_id);
        assert_ne!(rotated.refresh_token, issued.refresh_token);
        assert_eq!(rotated.claims.organization_id, f.org_id);

        let old = f.rotation.find(&issued.refresh_token).await.unwrap().unwrap();
        let new = f.rotation.find(&rotated.refresh_token).await.unwrap().unwrap();
        assert!(old.used_at.is_some());
        assert_eq!(old.replaced_by_id, Some(new.id));
        assert_eq!(new.family_id, old.family_id);
        assert!(new.used_at.is_none());
    }

    #[tokio::test]
    async fn test_reuse_revokes_family() {
        let f = fixture().await;
        let issued = f.rotation.start_session(grant(&f)).await.unwrap();
        let rotated = f
            .rotation
            .rotate(&issued.refresh_token, None, &TokenBinding::default())
            .await
            .unwrap();

        let replay = f
            .rotation
            .rotate(&issued.refresh_token, None, &TokenBinding::default())
            .await;
        assert!(matches!(replay, Err(RotationError::ReuseDetected { family_id }) if family_id == issued.family_id));

        let newest = f
            .rotation
            .rotate(&rotated.refresh_token, None, &TokenBinding::default())
            .await;
        assert!(matches!(newest, Err(RotationError::Revoked)));
        assert_eq!(f.audit.count(AuditEventKind::RefreshReuseDetected), 1);
        assert!(f.store.is_family_revoked(issued.family_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_client_mismatch_does_not_consume() {
        let f = fixture().await;
        let issued = f.rotation.start_session(grant(&f)).await.unwrap();
        assert!(matches!(
            f.rotation
                .rotate(&issued.refresh_token, Some("other"), &TokenBinding::default())
                .await,
            Err(RotationError::ClientMismatch)
        ));
        assert!(f
            .rotation
            .rotate(&issued.refresh_token, Some("spa"), &TokenBinding::default())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_binding_change_is_flagged_not_enforced() {
        let f = fixture().await;
        let mut request = grant(&f);
        request.binding = TokenBinding::from_raw(Some("Firefox"), Some("10.0.0.1"), None);
        let issued = f.rotation.start_session(request).await.unwrap();

        let moved = TokenBinding::from_raw(Some("Firefox"), Some("198.51.100.7"), None);
        assert!(f.rotation.rotate(&issued.refresh_token, None, &moved).await.is_ok());
        assert_eq!(f.audit.count(AuditEventKind::BindingAnomaly), 1);
    }

    #[tokio::test]
    async fn test_unknown_token() {
        let f = fixture().await;
        assert!(matches!(
            f.rotation.rotate("garbage", None, &TokenBinding::default()).await,
            Err(RotationError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_removed_member_cannot_rotate() {
        let f = fixture().await;
        let outsider = User::new("bob@example.com".to_string(), None);
        UserRepository::insert(f.store.as_ref(), &outsider).await.unwrap();
        let mut request = grant(&f);
        request.user_id = outsider.id;

        assert!(matches!(
            f.rotation.start_session(request).await,
            Err(RotationError::Rbac(RbacError::NotAMember))
        ));
    }
}
