use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

/// Prefix of every presented API key: `idk_<key_id>_<secret>`.
pub const API_KEY_PREFIX: &str = "idk";

/// Long-lived machine credential. Validated per request, never rotated.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct ApiKey {
    pub id: Uuid,
    /// Public identifier embedded in the presented key
    pub key_id: String,
    pub organization_id: Uuid,
    /// User that created the key; requests act with the key's scopes, not the user's
    pub created_by: Uuid,
    pub name: String,
    #[serde(skip_serializing)]
    pub hashed_secret: String,
    pub scopes: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked: bool,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ApiKey {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(false, |exp| now >= exp)
    }
}

/// Split a presented key into `(key_id, secret)`.
pub fn parse_presented_key(presented: &str) -> Option<(&str, &str)> {
    let rest = presented.strip_prefix(API_KEY_PREFIX)?.strip_prefix('_')?;
    let (key_id, secret) = rest.split_once('_')?;
    if key_id.is_empty() || secret.is_empty() {
        return None;
    }
    Some((key_id, secret))
}
