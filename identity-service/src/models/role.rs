//! Role model - system templates and organization-private custom roles.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use uuid::Uuid;

use super::Permission;

/// Name of the system role granted to an organization's creator.
pub const ADMIN_ROLE: &str = "admin";

/// A role.
///
/// `is_system` holds exactly when `organization_id` is `None`: system roles are
/// global templates, custom roles belong to one organization. Construct through
/// [`Role::system`] or [`Role::custom`] so the pairing cannot drift.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct Role {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub is_system: bool,
    pub organization_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl Role {
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

    /// Whether the row satisfies the system ⇔ global pairing.
    pub fn is_well_formed(&self) -> bool {
        self.is_system == self.organization_id.is_none()
    }

    /// A role may be used inside `organization_id` if it is a system template or
    /// that organization's own custom role.
    pub fn usable_in(&self, organization_id: Uuid) -> bool {
        self.organization_id.map_or(true, |owner| owner == organization_id)
    }

    /// A permission may be attached to this role only when it is global or owned
    /// by the same organization. System roles therefore only take system
    /// permissions.
    pub fn accepts(&self, permission: &Permission) -> bool {
        match permission.organization_id {
            None => true,
            Some(owner) => self.organization_id == Some(owner),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors_respect_scope_pairing() {
        let system = Role::system("viewer".to_string(), None);
        let custom = Role::custom(Uuid::new_v4(), "auditor".to_string(), None);
        assert!(system.is_well_formed());
        assert!(custom.is_well_formed());
        assert!(system.is_system && system.organization_id.is_none());
        assert!(!custom.is_system && custom.organization_id.is_some());
    }

    #[test]
    fn test_usable_in() {
        let org_a = Uuid::new_v4();
        let org_b = Uuid::new_v4();
        let system = Role::system("viewer".to_string(), None);
        let custom = Role::custom(org_a, "auditor".to_string(), None);

        assert!(system.usable_in(org_a));
        assert!(system.usable_in(org_b));
        assert!(custom.usable_in(org_a));
        assert!(!custom.usable_in(org_b));
    }

    #[test]
    fn test_accepts_permissions() {
        let org_a = Uuid::new_v4();
        let org_b = Uuid::new_v4();
        let system_role = Role::system("viewer".to_string(), None);
        let custom_role = Role::custom(org_a, "auditor".to_string(), None);

        let global = Permission::system("users:read".to_string(), None);
        let own = Permission::custom(org_a, "reports:export".to_string(), None);
        let foreign = Permission::custom(org_b, "reports:export".to_string(), None);

        assert!(system_role.accepts(&global));
        assert!(!system_role.accepts(&own));
        assert!(custom_role.accepts(&global));
        assert!(custom_role.accepts(&own));
        assert!(!custom_role.accepts(&foreign));
    }
}
