use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

/// Well-known permission names checked by the service's own endpoints.
pub mod names {
    pub const SESSIONS_REVOKE: &str = "sessions:revoke";
    pub const ROLES_MANAGE: &str = "roles:manage";
    pub const PERMISSIONS_MANAGE: &str = "permissions:manage";
    pub const MEMBERS_MANAGE: &str = "members:manage";
    pub const API_KEYS_MANAGE: &str = "api_keys:manage";
    pub const USERS_READ: &str = "users:read";
}

/// A permission. Names are unique per `organization_id` scope (`None` = global).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct Permission {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub is_system: bool,
    pub organization_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Permission {
    pub fn system(name: String, description: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            description,
            is_system: true,
            organization_id: None,
            created_at: Utc::now(),
        }
    }

    pub fn custom(organization_id: Uuid, name: String, description: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            description,
            is_system: false,
            organization_id: Some(organization_id),
            created_at: Utc::now(),
        }
    }
}

/// Permission names are `resource:action` style tokens.
pub fn is_valid_permission_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 100
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, ':' | '_' | '.' | '-' | '*'))
}
