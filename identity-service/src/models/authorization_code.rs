use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A single-use authorization code bound to a PKCE challenge.
///
/// Only `code_hash` is persisted; the plaintext code leaves the service once,
/// in the authorize redirect.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AuthorizationCode {
    pub id: Uuid,
    pub code_hash: String,
    pub client_id: String,
    pub user_id: Uuid,
    pub organization_id: Uuid,
    pub redirect_uri: String,
    pub scope: String,
    pub code_challenge: String,
    pub code_challenge_method: String,
    pub expires_at: DateTime<Utc>,
    pub used: bool,
    /// Refresh-token family created from this code, set in the same write that
    /// flips `used`.
    pub family_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// Parameters captured at `/authorize` approval.
#[derive(Debug, Clone)]
pub struct NewAuthorizationCode {
    pub client_id: String,
    pub user_id: Uuid,
    pub organization_id: Uuid,
    pub redirect_uri: String,
    pub scope: String,
    pub code_challenge: String,
    pub code_challenge_method: String,
}

impl AuthorizationCode {
    pub fn new(code_hash: String, params: NewAuthorizationCode, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            code_hash,
            client_id: params.client_id,
            user_id: params.user_id,
            organization_id: params.organization_id,
            redirect_uri: params.redirect_uri,
            scope: params.scope,
            code_challenge: params.code_challenge,
            code_challenge_method: params.code_challenge_method,
            expires_at: now + ttl,
            used: false,
            family_id: None,
            created_at: now,
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}
