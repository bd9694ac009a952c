use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A registered OAuth client application.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ClientApp {
    pub id: Uuid,
    /// Public identifier presented in OAuth requests
    pub client_id: String,
    /// Argon2 hash of the secret; only confidential clients have one
    #[serde(skip_serializing)]
    pub client_secret_hash: Option<String>,
    pub name: String,
    /// Exact-match set; no prefix or wildcard matching
    pub redirect_uris: Vec<String>,
    pub allowed_scopes: Vec<String>,
    /// `false` means a public, PKCE-only client
    pub is_confidential: bool,
    pub organization_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl ClientApp {
    pub fn new_public(client_id: String, name: String, redirect_uris: Vec<String>, allowed_scopes: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            client_id,
            client_secret_hash: None,
            name,
            redirect_uris,
            allowed_scopes,
            is_confidential: false,
            organization_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn new_confidential(
        client_id: String,
        client_secret_hash: String,
        name: String,
        redirect_uris: Vec<String>,
        allowed_scopes: Vec<String>,
    ) -> Self {
        Self {
            client_secret_hash: Some(client_secret_hash),
            is_confidential: true,
            ..Self::new_public(client_id, name, redirect_uris, allowed_scopes)
        }
    }

    /// Byte-for-byte comparison against the registered set.
    pub fn has_redirect_uri(&self, redirect_uri: &str) -> bool {
        self.redirect_uris.iter().any(|uri| uri == redirect_uri)
    }

    /// Every space-separated scope in `scope` must be registered for this client.
    pub fn allows_scope(&self, scope: &str) -> bool {
        scope
            .split_whitespace()
            .all(|s| self.allowed_scopes.iter().any(|allowed| allowed == s))
    }
}

/// Collapse a scope string to its canonical form (sorted, deduplicated, single spaces).
pub fn normalize_scope(scope: &str) -> String {
    let mut parts: Vec<&str> = scope.split_whitespace().collect();
    parts.sort_unstable();
    parts.dedup();
    parts.join(" ")
}
