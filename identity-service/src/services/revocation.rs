//! Token and session revocation.
//!
//! Single tokens are killed by deny-listing the access token id and revoking
//! the refresh family behind it. Whole sessions are killed by raising a
//! watermark: any access token issued at or before it is rejected.

use chrono::Utc;
use std::{future::Future, sync::Arc};
use thiserror::Error;
use uuid::Uuid;

use super::audit::{AuditEvent, AuditEventKind, AuditSink};
use super::jwt::{AccessTokenClaims, TokenError};
use super::rotation::{RotationError, RotationService};
use crate::models::permission::names;
use crate::repository::{with_retry, with_timeout, RetryPolicy, RevocationStore, StoreError, StoreResult, WatermarkScope};

#[derive(Debug, Error)]
pub enum RevocationError {
    #[error("Not allowed to revoke this token")]
    Forbidden,

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error(transparent)]
    Rotation(#[from] RotationError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Clone)]
pub struct RevocationService {
    store: Arc<dyn RevocationStore>,
    rotation: RotationService,
    audit: Arc<dyn AuditSink>,
    timeout: std::time::Duration,
}

impl RevocationService {
    pub fn new(
        store: Arc<dyn RevocationStore>,
        rotation: RotationService,
        audit: Arc<dyn AuditSink>,
        timeout: std::time::Duration,
    ) -> Self {
        Self {
            store,
            rotation,
            audit,
            timeout,
        }
    }

    async fn timed<T, F>(&self, fut: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        with_timeout(self.timeout, fut).await
    }

    /// Timed and retried; for lookups only.
    async fn read<T, F, Fut>(&self, op: F) -> StoreResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = StoreResult<T>>,
    {
        with_retry(self.timeout, RetryPolicy::default(), op).await
    }

    /// Revoke one access or refresh token on behalf of `caller`.
    ///
    /// Unknown and already-expired tokens are accepted silently. Returns
    /// whether anything was revoked.
    pub async fn revoke_token(
        &self,
        token: &str,
        caller: &AccessTokenClaims,
    ) -> Result<bool, RevocationError> {
        if let Ok(claims) = self.rotation.jwt().decode_ignoring_expiry(token) {
            authorize(caller, claims.user_id, claims.organization_id)?;

            let expires_at = match claims.expires_at() {
                Some(at) if at > Utc::now() => at,
                _ => return Ok(false),
            };

            self.timed(self.store.deny_token(&claims.jti, expires_at)).await?;
            self.rotation
                .revoke_family(claims.session_id, "access_token_revoked")
                .await?;

            self.audit.record(
                AuditEvent::new(AuditEventKind::TokenRevoked, "access token")
                    .user(claims.user_id)
                    .organization(claims.organization_id)
                    .family(claims.session_id),
            );
            tracing::info!(
                jti = %claims.jti,
                family_id = %claims.session_id,
                revoked_by = %caller.user_id,
                "Access token revoked"
            );
            return Ok(true);
        }

        let Some(refresh) = self.rotation.find(token).await? else {
            tracing::debug!("Revocation requested for unknown token");
            return Ok(false);
        };

        authorize(caller, refresh.user_id, refresh.organization_id)?;

        if refresh.revoked || refresh.is_expired_at(Utc::now()) {
            return Ok(false);
        }

        self.rotation
            .revoke_family(refresh.family_id, "refresh_token_revoked")
            .await?;

        self.audit.record(
            AuditEvent::new(AuditEventKind::TokenRevoked, "refresh token")
                .user(refresh.user_id)
                .organization(refresh.organization_id)
                .family(refresh.family_id)
                .client(refresh.client_id.clone()),
        );
        tracing::info!(
            family_id = %refresh.family_id,
            revoked_by = %caller.user_id,
            "Refresh token revoked"
        );
        Ok(true)
    }

    /// Kill every session of a user in every organization.
    pub async fn revoke_user_sessions(&self, user_id: Uuid, reason: &str) -> Result<u64, RevocationError> {
        self.timed(self.store.raise_watermark(WatermarkScope::User(user_id), Utc::now()))
            .await?;
        let revoked = self.rotation.revoke_all_for_user(user_id, reason).await?;

        self.audit.record(
            AuditEvent::new(AuditEventKind::SessionsRevoked, format!("user sessions: {}", reason))
                .user(user_id),
        );
        Ok(revoked)
    }

    /// Kill every session within an organization.
    pub async fn revoke_org_sessions(&self, org_id: Uuid, reason: &str) -> Result<u64, RevocationError> {
        self.timed(self.store.raise_watermark(WatermarkScope::Organization(org_id), Utc::now()))
            .await?;
        let revoked = self.rotation.revoke_all_for_org(org_id, reason).await?;

        self.audit.record(
            AuditEvent::new(AuditEventKind::SessionsRevoked, format!("organization sessions: {}", reason))
                .organization(org_id),
        );
        Ok(revoked)
    }

    /// Kill a user's sessions within one organization only.
    pub async fn revoke_user_in_org(
        &self,
        user_id: Uuid,
        org_id: Uuid,
        reason: &str,
    ) -> Result<u64, RevocationError> {
        self.timed(self.store.raise_watermark(
            WatermarkScope::UserInOrganization { user_id, org_id },
            Utc::now(),
        ))
        .await?;
        let revoked = self
            .rotation
            .revoke_all_for_user_in_org(user_id, org_id, reason)
            .await?;

        self.audit.record(
            AuditEvent::new(AuditEventKind::SessionsRevoked, format!("membership sessions: {}", reason))
                .user(user_id)
                .organization(org_id),
        );
        Ok(revoked)
    }

    /// Reject claims whose token was deny-listed, issued at or before a
    /// watermark, or minted from a revoked family.
    pub async fn check(&self, claims: &AccessTokenClaims) -> Result<(), RevocationError> {
        if self.read(|| self.store.is_token_denied(&claims.jti)).await? {
            return Err(TokenError::Revoked.into());
        }

        let marks = self
            .read(|| self.store.watermarks(claims.user_id, claims.organization_id))
            .await?;
        if let Some(watermark) = marks.latest() {
            if claims.issued_at_micros() <= watermark.timestamp_micros() {
                tracing::debug!(
                    user_id = %claims.user_id,
                    organization_id = %claims.organization_id,
                    iat_micros = claims.issued_at_micros(),
                    watermark = %watermark,
                    "Token issued before session revocation"
                );
                return Err(TokenError::Revoked.into());
            }
        }

        if self.rotation.is_family_revoked(claims.session_id).await? {
            return Err(TokenError::Revoked.into());
        }

        Ok(())
    }

    /// Validate a bearer token and cross-check it against revocation state.
    pub async fn validate(&self, token: &str) -> Result<AccessTokenClaims, RevocationError> {
        let claims = self.rotation.jwt().validate(token)?;
        self.check(&claims).await?;
        Ok(claims)
    }
}

/// The token's owner, a session manager of its organization or a superadmin.
fn authorize(caller: &AccessTokenClaims, owner: Uuid, org_id: Uuid) -> Result<(), RevocationError> {
    if caller.is_superadmin
        || caller.user_id == owner
        || (caller.organization_id == org_id && caller.has_permission(names::SESSIONS_REVOKE))
    {
        Ok(())
    } else {
        Err(RevocationError::Forbidden)
    }
}
