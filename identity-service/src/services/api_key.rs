use chrono::{DateTime, Utc};
use service_core::utils::{constant_time_eq, random_token, sha256_hex};
use std::{future::Future, sync::Arc};
use thiserror::Error;
use uuid::Uuid;

use super::audit::{AuditEvent, AuditEventKind, AuditSink};
use crate::models::{parse_presented_key, ApiKey, API_KEY_PREFIX};
use crate::repository::{with_timeout, ApiKeyRepository, StoreError, StoreResult};

#[derive(Debug, Error)]
pub enum ApiKeyError {
    #[error("Invalid API key")]
    Invalid,

    #[error("API key expired")]
    Expired,

    #[error("API key revoked")]
    Revoked,

    #[error("API key not found")]
    NotFound,

    #[error("Invalid API key name")]
    InvalidName,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A freshly issued key. `plaintext` is shown once and never stored.
#[derive(Debug, Clone)]
pub struct IssuedApiKey {
    pub key: ApiKey,
    pub plaintext: String,
}

#[derive(Clone)]
pub struct ApiKeyService {
    api_keys: Arc<dyn ApiKeyRepository>,
    audit: Arc<dyn AuditSink>,
    timeout: std::time::Duration,
}

impl ApiKeyService {
    pub fn new(
        api_keys: Arc<dyn ApiKeyRepository>,
        audit: Arc<dyn AuditSink>,
        timeout: std::time::Duration,
    ) -> Self {
        Self {
            api_keys,
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

    pub async fn issue(
        &self,
        organization_id: Uuid,
        created_by: Uuid,
        name: &str,
        scopes: Vec<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<IssuedApiKey, ApiKeyError> {
        let name = name.trim();
        if name.is_empty() || name.len() > 100 {
            return Err(ApiKeyError::InvalidName);
        }

        // Key ids must not contain the `_` separator
        let key_id = Uuid::new_v4().simple().to_string()[..16].to_string();
        let secret = random_token(32);

        let key = ApiKey {
            id: Uuid::new_v4(),
            key_id: key_id.clone(),
            organization_id,
            created_by,
            name: name.to_string(),
            hashed_secret: sha256_hex(&secret),
            scopes,
            expires_at,
            revoked: false,
            last_used_at: None,
            created_at: Utc::now(),
        };

        self.timed(self.api_keys.insert(&key)).await?;

        self.audit.record(
            AuditEvent::new(AuditEventKind::ApiKeyIssued, format!("key_id={}", key_id))
                .user(created_by)
                .organization(organization_id),
        );
        tracing::info!(
            key_id = %key_id,
            organization_id = %organization_id,
            created_by = %created_by,
            "API key issued"
        );

        Ok(IssuedApiKey {
            key,
            plaintext: format!("{}_{}_{}", API_KEY_PREFIX, key_id, secret),
        })
    }

    /// Validate a presented key and record its use.
    pub async fn validate(&self, presented: &str) -> Result<ApiKey, ApiKeyError> {
        let (key_id, secret) = parse_presented_key(presented).ok_or(ApiKeyError::Invalid)?;

        let key = self
            .timed(self.api_keys.find_by_key_id(key_id))
            .await?
            .ok_or(ApiKeyError::Invalid)?;

        if !constant_time_eq(sha256_hex(secret).as_bytes(), key.hashed_secret.as_bytes()) {
            tracing::warn!(key_id = %key_id, "API key secret mismatch");
            return Err(ApiKeyError::Invalid);
        }

        if key.revoked {
            return Err(ApiKeyError::Revoked);
        }

        let now = Utc::now();
        if key.is_expired_at(now) {
            return Err(ApiKeyError::Expired);
        }

        if let Err(e) = self.timed(self.api_keys.touch(key.id, now)).await {
            tracing::warn!(key_id = %key_id, error = %e, "Failed to record API key use");
        }

        Ok(key)
    }

    pub async fn revoke(&self, organization_id: Uuid, key_id: &str, revoked_by: Uuid) -> Result<(), ApiKeyError> {
        if !self.timed(self.api_keys.revoke(organization_id, key_id)).await? {
            return Err(ApiKeyError::NotFound);
        }

        self.audit.record(
            AuditEvent::new(AuditEventKind::ApiKeyRevoked, format!("key_id={}", key_id))
                .user(revoked_by)
                .organization(organization_id),
        );
        tracing::info!(key_id = %key_id, organization_id = %organization_id, "API key revoked");
        Ok(())
    }
}
