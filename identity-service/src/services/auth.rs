use std::{future::Future, sync::Arc};
use thiserror::Error;
use uuid::Uuid;

use super::audit::{AuditEvent, AuditEventKind, AuditSink};
use super::oauth::{OAuthError, OAuthService};
use super::rotation::{GrantRequest, IssuedTokens, RotationError, RotationService};
use crate::models::{normalize_email, TokenBinding, User};
use crate::repository::{with_timeout, StoreError, StoreResult, UserRepository};
use crate::utils::{hash_blocking, secret::timing_equalizer, verify_blocking, Secret, SecretHash};

#[derive(Debug, Error)]
pub enum AuthError {
    /// Uniform failure for every login problem
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Email already registered")]
    EmailAlreadyRegistered,

    #[error(transparent)]
    Client(#[from] OAuthError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Direct password login for first-party clients.
#[derive(Debug, Clone)]
pub struct LoginParams {
    pub email: String,
    pub password: String,
    pub organization_id: Uuid,
    pub client_id: String,
    pub client_secret: Option<String>,
}

#[derive(Clone)]
pub struct AuthService {
    users: Arc<dyn UserRepository>,
    oauth: OAuthService,
    rotation: RotationService,
    audit: Arc<dyn AuditSink>,
    timeout: std::time::Duration,
    /// Verified against when the email is unknown so both paths cost the same
    dummy_hash: Option<SecretHash>,
}

impl AuthService {
    pub fn new(
        users: Arc<dyn UserRepository>,
        oauth: OAuthService,
        rotation: RotationService,
        audit: Arc<dyn AuditSink>,
        timeout: std::time::Duration,
    ) -> Self {
        let dummy_hash = timing_equalizer();
        Self {
            users,
            oauth,
            rotation,
            audit,
            timeout,
            dummy_hash,
        }
    }

    async fn timed<T, F>(&self, fut: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        with_timeout(self.timeout, fut).await
    }

    pub async fn register(&self, email: &str, password: &str) -> Result<User, AuthError> {
        let hash = hash_blocking(Secret::new(password)).await?;

        let user = User::new(email.to_string(), Some(hash.into_string()));
        match self.timed(self.users.insert(&user)).await {
            Ok(()) => {}
            Err(StoreError::Conflict(_)) => return Err(AuthError::EmailAlreadyRegistered),
            Err(e) => return Err(e.into()),
        }

        tracing::info!(user_id = %user.id, "User registered");
        Ok(user)
    }

    pub async fn login(&self, params: LoginParams, binding: &TokenBinding) -> Result<IssuedTokens, AuthError> {
        let client = self
            .oauth
            .authenticate_client(&params.client_id, params.client_secret.as_deref())
            .await?;

        let email = normalize_email(&params.email);
        let user = self.timed(self.users.find_by_email(&email)).await?;

        let stored_hash = user
            .as_ref()
            .and_then(|u| u.password_hash.clone())
            .map(SecretHash::new)
            .or_else(|| self.dummy_hash.clone());

        let verified = match stored_hash {
            Some(hash) => verify_blocking(Secret::new(params.password), hash).await?,
            None => false,
        };

        let user = match user {
            Some(user) if verified && user.is_active && user.password_hash.is_some() => user,
            _ => return Err(self.login_failed(&email, None, params.organization_id)),
        };

        let issued = self
            .rotation
            .start_session(GrantRequest {
                client_id: client.client_id.clone(),
                user_id: user.id,
                organization_id: params.organization_id,
                scope: String::new(),
                binding: binding.clone(),
                family_id: None,
            })
            .await;

        match issued {
            Ok(issued) => {
                tracing::info!(
                    user_id = %user.id,
                    organization_id = %params.organization_id,
                    client_id = %client.client_id,
                    "User logged in"
                );
                Ok(issued)
            }
            Err(RotationError::Store(e)) => Err(e.into()),
            Err(RotationError::Rbac(super::rbac::RbacError::Store(e))) => Err(e.into()),
            Err(RotationError::Token(e)) => Err(anyhow::anyhow!("Failed to mint access token: {}", e).into()),
            Err(e) => {
                tracing::debug!(reason = %e, "Login refused");
                Err(self.login_failed(&email, Some(user.id), params.organization_id))
            }
        }
    }

    fn login_failed(&self, email: &str, user_id: Option<Uuid>, organization_id: Uuid) -> AuthError {
        tracing::warn!(organization_id = %organization_id, "Login failed");
        let mut event = AuditEvent::new(
            AuditEventKind::LoginFailed,
            format!("email_hash={}", service_core::utils::sha256_hex(email)),
        )
        .organization(organization_id);
        if let Some(user_id) = user_id {
            event = event.user(user_id);
        }
        self.audit.record(event);
        AuthError::InvalidCredentials
    }
}
