//! Organization model - the isolation boundary for roles, permissions and sessions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum OrganizationStatus {
    Active,
    Suspended,
}

impl OrganizationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrganizationStatus::Active => "active",
            OrganizationStatus::Suspended => "suspended",
        }
    }
}

impl TryFrom<String> for OrganizationStatus {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "active" => Ok(OrganizationStatus::Active),
            "suspended" => Ok(OrganizationStatus::Suspended),
            other => Err(format!("Invalid organization status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    /// Unique, URL-safe handle
    pub slug: String,
    #[sqlx(try_from = "String")]
    pub status: OrganizationStatus,
    pub created_at: DateTime<Utc>,
}

impl Organization {
    pub fn new(name: String, slug: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            name,
            slug,
            status: OrganizationStatus::Active,
            created_at: Utc::now(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == OrganizationStatus::Active
    }
}

/// Normalize and validate an organization slug.
///
/// Slugs are lowercase ASCII alphanumerics separated by single hyphens.
pub fn normalize_slug(raw: &str) -> Option<String> {
    let slug = raw.trim().to_ascii_lowercase();
    let valid = !slug.is_empty()
        && slug.len() <= 63
        && !slug.starts_with('-')
        && !slug.ends_with('-')
        && !slug.contains("--")
        && slug
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    valid.then_some(slug)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_organization_is_active() {
        let org = Organization::new("Acme".to_string(), "acme".to_string());
        assert!(org.is_active());
    }

    #[test]
    fn test_normalize_slug() {
        assert_eq!(normalize_slug(" Acme-Corp "), Some("acme-corp".to_string()));
        assert_eq!(normalize_slug("acme--corp"), None);
        assert_eq!(normalize_slug("-acme"), None);
        assert_eq!(normalize_slug("acme_corp"), None);
        assert_eq!(normalize_slug(""), None);
    }

    #[test]
    fn test_status_round_trips_through_text() {
        let status = OrganizationStatus::try_from("suspended".to_string()).unwrap();
        assert_eq!(status, OrganizationStatus::Suspended);
        assert!(OrganizationStatus::try_from("deleted".to_string()).is_err());
    }
}
