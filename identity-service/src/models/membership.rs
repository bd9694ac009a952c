//! Membership model - binds a user to an organization with exactly one role.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum MembershipStatus {
    Active,
    Invited,
    Suspended,
}

impl MembershipStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MembershipStatus::Active => "active",
            MembershipStatus::Invited => "invited",
            MembershipStatus::Suspended => "suspended",
        }
    }
}

impl TryFrom<String> for MembershipStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "active" => Ok(MembershipStatus::Active),
            "invited" => Ok(MembershipStatus::Invited),
            "suspended" => Ok(MembershipStatus::Suspended),
            other => Err(format!("Invalid membership status: {}", other)),
        }
    }
}

/// (organization_id, user_id) is unique.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct Membership {
    pub organization_id: Uuid,
    pub user_id: Uuid,
    pub role_id: Uuid,
    #[sqlx(try_from = "String")]
    pub status: MembershipStatus,
    pub created_at: DateTime<Utc>,
}

impl Membership {
    pub fn new(organization_id: Uuid, user_id: Uuid, role_id: Uuid, status: MembershipStatus) -> Self {
        Self {
            organization_id,
            user_id,
            role_id,
            status,
            created_at: Utc::now(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == MembershipStatus::Active
    }
}

/// Result of a guarded membership removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipRemoval {
    Removed,
    NotFound,
    /// The member is the only remaining admin and was kept.
    LastAdmin,
}
