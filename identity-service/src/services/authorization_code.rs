//! Single-use authorization codes bound to a PKCE challenge.

use chrono::{Duration, Utc};
use service_core::utils::{random_token, sha256_hex};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use super::audit::{AuditEvent, AuditEventKind, AuditSink};
use super::pkce::{self, PkceError, METHOD_S256};
use crate::models::{AuthorizationCode, NewAuthorizationCode};
use crate::repository::{
    with_timeout, AuthorizationCodeRepository, RefreshTokenRepository, StoreError,
};

#[derive(Debug, Error)]
pub enum CodeError {
    #[error("Authorization code not found")]
    NotFound,

    #[error("Authorization code expired")]
    Expired,

    #[error("Authorization code already used")]
    AlreadyUsed,

    #[error("Authorization code was issued to another client")]
    ClientMismatch,

    #[error("Redirect URI does not match the authorization request")]
    RedirectMismatch,

    #[error("PKCE verification failed: {0}")]
    PkceFailure(#[from] PkceError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What a successfully redeemed code grants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedeemedCode {
    pub user_id: Uuid,
    pub organization_id: Uuid,
    pub client_id: String,
    pub scope: String,
    /// Family the caller must use for the refresh token it grants
    pub family_id: Uuid,
}

#[derive(Clone)]
pub struct AuthorizationCodeService {
    codes: Arc<dyn AuthorizationCodeRepository>,
    refresh_tokens: Arc<dyn RefreshTokenRepository>,
    audit: Arc<dyn AuditSink>,
    ttl: Duration,
    timeout: std::time::Duration,
}

impl AuthorizationCodeService {
    pub fn new(
        codes: Arc<dyn AuthorizationCodeRepository>,
        refresh_tokens: Arc<dyn RefreshTokenRepository>,
        audit: Arc<dyn AuditSink>,
        ttl: Duration,
        timeout: std::time::Duration,
    ) -> Self {
        Self {
            codes,
            refresh_tokens,
            audit,
            ttl,
            timeout,
        }
    }

    /// Persist a new code and return its plaintext. Only the hash is stored.
    pub async fn issue(&self, params: NewAuthorizationCode) -> Result<String, CodeError> {
        if params.code_challenge_method != METHOD_S256 {
            return Err(PkceError::UnsupportedMethod(params.code_challenge_method).into());
        }

        let code = random_token(32);
        let record = AuthorizationCode::new(sha256_hex(&code), params, self.ttl);

        with_timeout(self.timeout, self.codes.insert(&record)).await?;

        tracing::info!(
            code_id = %record.id,
            client_id = %record.client_id,
            user_id = %record.user_id,
            organization_id = %record.organization_id,
            "Authorization code issued"
        );

        Ok(code)
    }

    /// Redeem a code exactly once.
    ///
    /// A second presentation of a used code fails with `AlreadyUsed` and
    /// revokes the refresh-token family the first redemption created.
    pub async fn redeem(
        &self,
        code: &str,
        client_id: &str,
        redirect_uri: &str,
        verifier: &str,
    ) -> Result<RedeemedCode, CodeError> {
        let record = with_timeout(self.timeout, self.codes.find_by_hash(&sha256_hex(code)))
            .await?
            .ok_or(CodeError::NotFound)?;

        if record.used {
            self.handle_replay(&record).await?;
            return Err(CodeError::AlreadyUsed);
        }

        if record.is_expired_at(Utc::now()) {
            return Err(CodeError::Expired);
        }

        if record.client_id != client_id {
            return Err(CodeError::ClientMismatch);
        }

        if record.redirect_uri != redirect_uri {
            return Err(CodeError::RedirectMismatch);
        }

        pkce::verify(verifier, &record.code_challenge, &record.code_challenge_method)?;

        let family_id = Uuid::new_v4();
        let won = with_timeout(self.timeout, self.codes.redeem(record.id, family_id)).await?;
        if !won {
            // Lost the race to a concurrent redemption
            let code_hash = record.code_hash.clone();
            let current = with_timeout(self.timeout, self.codes.find_by_hash(&code_hash))
                .await?
                .unwrap_or(record);
            self.handle_replay(&current).await?;
            return Err(CodeError::AlreadyUsed);
        }

        tracing::info!(
            code_id = %record.id,
            client_id = %record.client_id,
            user_id = %record.user_id,
            family_id = %family_id,
            "Authorization code redeemed"
        );

        Ok(RedeemedCode {
            user_id: record.user_id,
            organization_id: record.organization_id,
            client_id: record.client_id,
            scope: record.scope,
            family_id,
        })
    }

    async fn handle_replay(&self, record: &AuthorizationCode) -> Result<(), CodeError> {
        tracing::warn!(
            code_id = %record.id,
            client_id = %record.client_id,
            user_id = %record.user_id,
            "Authorization code replay detected"
        );

        let mut event = AuditEvent::new(AuditEventKind::CodeReplayDetected, "used authorization code presented again")
            .user(record.user_id)
            .organization(record.organization_id)
            .client(record.client_id.clone());

        if let Some(family_id) = record.family_id {
            event = event.family(family_id);
            let revoked = with_timeout(
                self.timeout,
                self.refresh_tokens.revoke_family(family_id, "authorization_code_replay"),
            )
            .await?;
            self.audit.record(
                AuditEvent::new(AuditEventKind::FamilyRevoked, "authorization code replay")
                    .user(record.user_id)
                    .organization(record.organization_id)
                    .family(family_id),
            );
            tracing::warn!(family_id = %family_id, revoked, "Token family revoked after code replay");
        }

        self.audit.record(event);
        Ok(())
    }
}
