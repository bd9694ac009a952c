//! Role-based access control with organization isolation.
//!
//! System roles and permissions are global templates. Custom roles and
//! permissions belong to exactly one organization and never leak into another
//! organization's resolution, even if a cross-organization link exists in
//! storage.

use std::{future::Future, sync::Arc, time::Duration};
use thiserror::Error;
use uuid::Uuid;

use super::audit::{AuditEvent, AuditEventKind, AuditSink};
use crate::models::{
    is_valid_permission_name, normalize_slug, permission::names, Membership, MembershipRemoval,
    MembershipStatus, Organization, Permission, Role, User, ADMIN_ROLE,
};
use crate::repository::{with_timeout, Repositories, StoreError, StoreResult};

/// Role name reported for superadmin access, which bypasses memberships.
pub const SUPERADMIN_ROLE_NAME: &str = "superadmin";
pub const MEMBER_ROLE: &str = "member";

/// Permissions every deployment has, with their descriptions.
pub const SYSTEM_PERMISSIONS: &[(&str, &str)] = &[
    (names::SESSIONS_REVOKE, "Revoke sessions of organization members"),
    (names::ROLES_MANAGE, "Create roles and change their permissions"),
    (names::PERMISSIONS_MANAGE, "Create organization permissions"),
    (names::MEMBERS_MANAGE, "Add and remove organization members"),
    (names::API_KEYS_MANAGE, "Issue and revoke API keys"),
    (names::USERS_READ, "Read member profiles and permissions"),
];

#[derive(Debug, Error)]
pub enum RbacError {
    #[error("User not found")]
    UserNotFound,

    #[error("Organization not found")]
    OrganizationNotFound,

    #[error("Organization is suspended")]
    OrganizationSuspended,

    #[error("User is not a member of the organization")]
    NotAMember,

    #[error("Membership is not active")]
    MembershipInactive,

    #[error("User is already a member of the organization")]
    AlreadyMember,

    #[error("Role not found")]
    RoleNotFound,

    #[error("Role cannot be used in this organization")]
    RoleNotUsableInOrganization,

    #[error("Permission {0} not found")]
    PermissionNotFound(Uuid),

    #[error("Permission {permission_id} belongs to another organization")]
    CrossOrganizationPermission { permission_id: Uuid },

    #[error("Name already exists: {0}")]
    DuplicateName(String),

    #[error("Invalid name: {0}")]
    InvalidName(String),

    #[error("Cannot remove the last admin of an organization")]
    LastAdmin,

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of permission resolution for one (user, organization) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectivePermissions {
    pub role_id: Option<Uuid>,
    pub role_name: String,
    pub permissions: Vec<String>,
    pub is_superadmin: bool,
}

/// The single superadmin predicate.
fn is_superadmin(user: &User) -> bool {
    user.is_superadmin && user.is_active
}

#[derive(Clone)]
pub struct RbacService {
    repos: Repositories,
    audit: Arc<dyn AuditSink>,
    timeout: Duration,
}

impl RbacService {
    pub fn new(repos: Repositories, audit: Arc<dyn AuditSink>, timeout: Duration) -> Self {
        Self {
            repos,
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

    /// Resolve what `user_id` may do inside `org_id`.
    pub async fn resolve_effective_permissions(
        &self,
        user_id: Uuid,
        org_id: Uuid,
    ) -> Result<EffectivePermissions, RbacError> {
        let user = self
            .timed(self.repos.users.find_by_id(user_id))
            .await?
            .filter(|u| u.is_active)
            .ok_or(RbacError::UserNotFound)?;

        let org = self
            .timed(self.repos.organizations.find_by_id(org_id))
            .await?
            .ok_or(RbacError::OrganizationNotFound)?;

        if is_superadmin(&user) {
            let permissions = self
                .timed(self.repos.permissions.list_system())
                .await?
                .into_iter()
                .map(|p| p.name)
                .collect();
            return Ok(EffectivePermissions {
                role_id: None,
                role_name: SUPERADMIN_ROLE_NAME.to_string(),
                permissions,
                is_superadmin: true,
            });
        }

        if !org.is_active() {
            return Err(RbacError::OrganizationSuspended);
        }

        let membership = self
            .timed(self.repos.organizations.find_membership(org_id, user_id))
            .await?
            .ok_or(RbacError::NotAMember)?;
        if !membership.is_active() {
            return Err(RbacError::MembershipInactive);
        }

        let role = self
            .timed(self.repos.roles.find_by_id(membership.role_id))
            .await?
            .ok_or(RbacError::RoleNotFound)?;
        if !role.usable_in(org_id) {
            tracing::error!(
                user_id = %user_id,
                organization_id = %org_id,
                role_id = %role.id,
                "Membership references another organization's role"
            );
            return Err(RbacError::RoleNotUsableInOrganization);
        }

        let linked = self.timed(self.repos.roles.permissions_for_role(role.id)).await?;
        let linked_count = linked.len();
        let mut permissions: Vec<String> = linked
            .into_iter()
            .filter(|p| role.accepts(p))
            .map(|p| p.name)
            .collect();
        permissions.sort();
        permissions.dedup();

        if permissions.len() < linked_count {
            tracing::warn!(
                role_id = %role.id,
                organization_id = %org_id,
                dropped = linked_count - permissions.len(),
                "Ignored permissions outside the role's organization"
            );
        }

        Ok(EffectivePermissions {
            role_id: Some(role.id),
            role_name: role.name,
            permissions,
            is_superadmin: false,
        })
    }

    /// Attach permissions to a role after checking every one of them.
    /// Nothing is assigned if any permission is rejected.
    pub async fn assign_permissions_to_role(
        &self,
        role_id: Uuid,
        permission_ids: &[Uuid],
    ) -> Result<(), RbacError> {
        let role = self
            .timed(self.repos.roles.find_by_id(role_id))
            .await?
            .ok_or(RbacError::RoleNotFound)?;

        let found = self.timed(self.repos.permissions.find_by_ids(permission_ids)).await?;

        for id in permission_ids {
            let Some(permission) = found.iter().find(|p| p.id == *id) else {
                return Err(RbacError::PermissionNotFound(*id));
            };
            if !role.accepts(permission) {
                tracing::warn!(
                    role_id = %role.id,
                    permission_id = %permission.id,
                    "Rejected cross-organization permission assignment"
                );
                let mut event = AuditEvent::new(
                    AuditEventKind::CrossOrganizationAssignmentRejected,
                    format!("permission {} offered to role {}", permission.id, role.id),
                );
                if let Some(org_id) = role.organization_id {
                    event = event.organization(org_id);
                }
                self.audit.record(event);
                return Err(RbacError::CrossOrganizationPermission {
                    permission_id: permission.id,
                });
            }
        }

        self.timed(self.repos.roles.assign_permissions(role.id, permission_ids))
            .await?;

        tracing::info!(role_id = %role.id, count = permission_ids.len(), "Permissions assigned to role");
        Ok(())
    }

    pub async fn create_custom_permission(
        &self,
        org_id: Uuid,
        name: &str,
        description: Option<String>,
    ) -> Result<Permission, RbacError> {
        if !is_valid_permission_name(name) {
            return Err(RbacError::InvalidName(name.to_string()));
        }
        self.require_organization(org_id).await?;

        let permission = Permission::custom(org_id, name.to_string(), description);
        self.timed(self.repos.permissions.insert(&permission))
            .await
            .map_err(|e| match e {
                StoreError::Conflict(_) => RbacError::DuplicateName(name.to_string()),
                other => other.into(),
            })?;

        tracing::info!(organization_id = %org_id, permission = %name, "Custom permission created");
        Ok(permission)
    }

    pub async fn create_custom_role(
        &self,
        org_id: Uuid,
        name: &str,
        description: Option<String>,
    ) -> Result<Role, RbacError> {
        let name = name.trim();
        if name.is_empty() || name.len() > 100 {
            return Err(RbacError::InvalidName(name.to_string()));
        }
        self.require_organization(org_id).await?;

        let role = Role::custom(org_id, name.to_string(), description);
        self.timed(self.repos.roles.insert(&role))
            .await
            .map_err(|e| match e {
                StoreError::Conflict(_) => RbacError::DuplicateName(name.to_string()),
                other => other.into(),
            })?;

        tracing::info!(organization_id = %org_id, role_id = %role.id, "Custom role created");
        Ok(role)
    }

    /// Create an organization whose creator becomes its admin.
    pub async fn create_organization(
        &self,
        creator_id: Uuid,
        name: &str,
        slug: &str,
    ) -> Result<Organization, RbacError> {
        let slug = normalize_slug(slug).ok_or_else(|| RbacError::InvalidName(slug.to_string()))?;

        self.timed(self.repos.users.find_by_id(creator_id))
            .await?
            .ok_or(RbacError::UserNotFound)?;

        let admin_role = self
            .timed(self.repos.roles.find_system_by_name(ADMIN_ROLE))
            .await?
            .ok_or(RbacError::RoleNotFound)?;

        let org = Organization::new(name.trim().to_string(), slug.clone());
        let admin = Membership::new(org.id, creator_id, admin_role.id, MembershipStatus::Active);

        self.timed(self.repos.organizations.insert_with_admin(&org, &admin))
            .await
            .map_err(|e| match e {
                StoreError::Conflict(_) => RbacError::DuplicateName(slug.clone()),
                other => other.into(),
            })?;

        tracing::info!(organization_id = %org.id, creator_id = %creator_id, "Organization created");
        Ok(org)
    }

    pub async fn add_member(
        &self,
        org_id: Uuid,
        user_id: Uuid,
        role_id: Uuid,
    ) -> Result<Membership, RbacError> {
        self.require_organization(org_id).await?;

        self.timed(self.repos.users.find_by_id(user_id))
            .await?
            .ok_or(RbacError::UserNotFound)?;

        let role = self
            .timed(self.repos.roles.find_by_id(role_id))
            .await?
            .ok_or(RbacError::RoleNotFound)?;
        if !role.usable_in(org_id) {
            return Err(RbacError::RoleNotUsableInOrganization);
        }

        let membership = Membership::new(org_id, user_id, role.id, MembershipStatus::Active);
        self.timed(self.repos.organizations.insert_membership(&membership))
            .await
            .map_err(|e| match e {
                StoreError::Conflict(_) => RbacError::AlreadyMember,
                other => other.into(),
            })?;

        tracing::info!(organization_id = %org_id, user_id = %user_id, role = %role.name, "Member added");
        Ok(membership)
    }

    pub async fn remove_member(&self, org_id: Uuid, user_id: Uuid) -> Result<(), RbacError> {
        let admin_role = self
            .timed(self.repos.roles.find_system_by_name(ADMIN_ROLE))
            .await?
            .ok_or(RbacError::RoleNotFound)?;

        match self
            .timed(
                self.repos
                    .organizations
                    .remove_membership(org_id, user_id, admin_role.id),
            )
            .await?
        {
            MembershipRemoval::Removed => {
                tracing::info!(organization_id = %org_id, user_id = %user_id, "Member removed");
                Ok(())
            }
            MembershipRemoval::NotFound => Err(RbacError::NotAMember),
            MembershipRemoval::LastAdmin => Err(RbacError::LastAdmin),
        }
    }

    /// System templates plus the organization's own custom roles.
    pub async fn roles_visible_to(&self, org_id: Uuid) -> Result<Vec<Role>, RbacError> {
        Ok(self.timed(self.repos.roles.list_visible(org_id)).await?)
    }

    pub async fn find_role(&self, role_id: Uuid) -> Result<Role, RbacError> {
        self.timed(self.repos.roles.find_by_id(role_id))
            .await?
            .ok_or(RbacError::RoleNotFound)
    }

    /// Seed system permissions and the `admin`/`member` system roles.
    /// Safe to run on every start.
    pub async fn ensure_system_catalog(&self) -> Result<(), RbacError> {
        let existing = self.timed(self.repos.permissions.list_system()).await?;
        let mut all = existing.clone();

        for (name, description) in SYSTEM_PERMISSIONS {
            if existing.iter().any(|p| p.name == *name) {
                continue;
            }
            let permission = Permission::system(name.to_string(), Some(description.to_string()));
            match self.timed(self.repos.permissions.insert(&permission)).await {
                Ok(()) => all.push(permission),
                Err(StoreError::Conflict(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        // Another instance may have won an insert race
        if all.len() < SYSTEM_PERMISSIONS.len() {
            all = self.timed(self.repos.permissions.list_system()).await?;
        }

        let admin_permissions: Vec<Uuid> = all.iter().map(|p| p.id).collect();
        let member_permissions: Vec<Uuid> = all
            .iter()
            .filter(|p| p.name == names::USERS_READ)
            .map(|p| p.id)
            .collect();

        self.ensure_system_role(ADMIN_ROLE, "Full control of the organization", &admin_permissions)
            .await?;
        self.ensure_system_role(MEMBER_ROLE, "Default organization member", &member_permissions)
            .await?;

        tracing::info!("System roles and permissions are in place");
        Ok(())
    }

    async fn ensure_system_role(
        &self,
        name: &str,
        description: &str,
        permission_ids: &[Uuid],
    ) -> Result<(), RbacError> {
        let role = match self.timed(self.repos.roles.find_system_by_name(name)).await? {
            Some(role) => role,
            None => {
                let role = Role::system(name.to_string(), Some(description.to_string()));
                match self.timed(self.repos.roles.insert(&role)).await {
                    Ok(()) => role,
                    Err(StoreError::Conflict(_)) => self
                        .timed(self.repos.roles.find_system_by_name(name))
                        .await?
                        .ok_or(RbacError::RoleNotFound)?,
                    Err(e) => return Err(e.into()),
                }
            }
        };
        self.timed(self.repos.roles.assign_permissions(role.id, permission_ids))
            .await?;
        Ok(())
    }

    async fn require_organization(&self, org_id: Uuid) -> Result<Organization, RbacError> {
        self.timed(self.repos.organizations.find_by_id(org_id))
            .await?
            .ok_or(RbacError::OrganizationNotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{MemoryStore, PermissionRepository, RoleRepository, UserRepository};
    use crate::services::audit::MemoryAuditSink;

    struct Fixture {
        rbac: RbacService,
        store: Arc<MemoryStore>,
        audit: Arc<MemoryAuditSink>,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let audit = Arc::new(MemoryAuditSink::new());
        let rbac = RbacService::new(
            Repositories::from_store(store.clone()),
            audit.clone(),
            Duration::from_secs(1),
        );
        rbac.ensure_system_catalog().await.unwrap();
        Fixture { rbac, store, audit }
    }

    async fn user(store: &MemoryStore, email: &str) -> User {
        let user = User::new(email.to_string(), None);
        UserRepository::insert(store, &user).await.unwrap();
        user
    }

    #[tokio::test]
    async fn test_catalog_seeding_is_idempotent() {
        let f = fixture().await;
        f.rbac.ensure_system_catalog().await.unwrap();
        let perms = f.store.list_system().await.unwrap();
        assert_eq!(perms.len(), SYSTEM_PERMISSIONS.len());
        assert!(f.store.find_system_by_name(ADMIN_ROLE).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_creator_becomes_admin() {
        let f = fixture().await;
        let alice = user(&f.store, "alice@example.com").await;
        let org = f.rbac.create_organization(alice.id, "Acme", "acme").await.unwrap();

        let resolved = f.rbac.resolve_effective_permissions(alice.id, org.id).await.unwrap();
        assert_eq!(resolved.role_name, ADMIN_ROLE);
        assert!(!resolved.is_superadmin);
        assert!(resolved.permissions.contains(&names::SESSIONS_REVOKE.to_string()));
    }

    #[tokio::test]
    async fn test_superadmin_bypass() {
        let f = fixture().await;
        let mut root = User::new("root@example.com".to_string(), None);
        root.is_superadmin = true;
        UserRepository::insert(f.store.as_ref(), &root).await.unwrap();
        let alice = user(&f.store, "alice@example.com").await;
        let org = f.rbac.create_organization(alice.id, "Acme", "acme").await.unwrap();

        let resolved = f.rbac.resolve_effective_permissions(root.id, org.id).await.unwrap();
        assert!(resolved.is_superadmin);
        assert_eq!(resolved.role_id, None);
        assert_eq!(resolved.role_name, SUPERADMIN_ROLE_NAME);
        assert_eq!(resolved.permissions.len(), SYSTEM_PERMISSIONS.len());
    }

    #[tokio::test]
    async fn test_non_member_is_rejected() {
        let f = fixture().await;
        let alice = user(&f.store, "alice@example.com").await;
        let bob = user(&f.store, "bob@example.com").await;
        let org = f.rbac.create_organization(alice.id, "Acme", "acme").await.unwrap();

        assert!(matches!(
            f.rbac.resolve_effective_permissions(bob.id, org.id).await,
            Err(RbacError::NotAMember)
        ));
    }

    #[tokio::test]
    async fn test_cross_organization_assignment_rejected() {
        let f = fixture().await;
        let alice = user(&f.store, "alice@example.com").await;
        let org_a = f.rbac.create_organization(alice.id, "A", "org-a").await.unwrap();
        let org_b = f.rbac.create_organization(alice.id, "B", "org-b").await.unwrap();

        let role_a = f.rbac.create_custom_role(org_a.id, "auditor", None).await.unwrap();
        let own = f
            .rbac
            .create_custom_permission(org_a.id, "reports:export", None)
            .await
            .unwrap();
        let foreign = f
            .rbac
            .create_custom_permission(org_b.id, "reports:export", None)
            .await
            .unwrap();

        let result = f
            .rbac
            .assign_permissions_to_role(role_a.id, &[own.id, foreign.id])
            .await;
        assert!(matches!(
            result,
            Err(RbacError::CrossOrganizationPermission { permission_id }) if permission_id == foreign.id
        ));
        // All-or-nothing
        assert!(f.store.permissions_for_role(role_a.id).await.unwrap().is_empty());
        assert_eq!(f.audit.count(AuditEventKind::CrossOrganizationAssignmentRejected), 1);

        f.rbac.assign_permissions_to_role(role_a.id, &[own.id]).await.unwrap();
        assert_eq!(f.store.permissions_for_role(role_a.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_system_role_takes_only_system_permissions() {
        let f = fixture().await;
        let alice = user(&f.store, "alice@example.com").await;
        let org = f.rbac.create_organization(alice.id, "Acme", "acme").await.unwrap();
        let custom = f
            .rbac
            .create_custom_permission(org.id, "reports:export", None)
            .await
            .unwrap();
        let admin = f.store.find_system_by_name(ADMIN_ROLE).await.unwrap().unwrap();

        assert!(matches!(
            f.rbac.assign_permissions_to_role(admin.id, &[custom.id]).await,
            Err(RbacError::CrossOrganizationPermission { .. })
        ));
    }

    #[tokio::test]
    async fn test_duplicate_permission_names_scoped_per_organization() {
        let f = fixture().await;
        let alice = user(&f.store, "alice@example.com").await;
        let org = f.rbac.create_organization(alice.id, "Acme", "acme").await.unwrap();

        f.rbac.create_custom_permission(org.id, "reports:export", None).await.unwrap();
        assert!(matches!(
            f.rbac.create_custom_permission(org.id, "reports:export", None).await,
            Err(RbacError::DuplicateName(_))
        ));
        // Same name as a system permission is fine inside an organization
        assert!(f
            .rbac
            .create_custom_permission(org.id, "users:read", None)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_last_admin_cannot_be_removed() {
        let f = fixture().await;
        let alice = user(&f.store, "alice@example.com").await;
        let bob = user(&f.store, "bob@example.com").await;
        let org = f.rbac.create_organization(alice.id, "Acme", "acme").await.unwrap();

        assert!(matches!(
            f.rbac.remove_member(org.id, alice.id).await,
            Err(RbacError::LastAdmin)
        ));

        let admin = f.store.find_system_by_name(ADMIN_ROLE).await.unwrap().unwrap();
        f.rbac.add_member(org.id, bob.id, admin.id).await.unwrap();
        f.rbac.remove_member(org.id, alice.id).await.unwrap();
        assert!(matches!(
            f.rbac.resolve_effective_permissions(alice.id, org.id).await,
            Err(RbacError::NotAMember)
        ));
    }

    #[tokio::test]
    async fn test_foreign_custom_role_cannot_be_granted() {
        let f = fixture().await;
        let alice = user(&f.store, "alice@example.com").await;
        let bob = user(&f.store, "bob@example.com").await;
        let org_a = f.rbac.create_organization(alice.id, "A", "org-a").await.unwrap();
        let org_b = f.rbac.create_organization(alice.id, "B", "org-b").await.unwrap();
        let role_b = f.rbac.create_custom_role(org_b.id, "auditor", None).await.unwrap();

        assert!(matches!(
            f.rbac.add_member(org_a.id, bob.id, role_b.id).await,
            Err(RbacError::RoleNotUsableInOrganization)
        ));
    }

    #[tokio::test]
    async fn test_roles_visible_to_organization() {
        let f = fixture().await;
        let alice = user(&f.store, "alice@example.com").await;
        let org_a = f.rbac.create_organization(alice.id, "A", "org-a").await.unwrap();
        let org_b = f.rbac.create_organization(alice.id, "B", "org-b").await.unwrap();
        f.rbac.create_custom_role(org_a.id, "auditor", None).await.unwrap();
        f.rbac.create_custom_role(org_b.id, "billing", None).await.unwrap();

        let names: Vec<String> = f
            .rbac
            .roles_visible_to(org_a.id)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.name)
            .collect();
        assert!(names.contains(&"auditor".to_string()));
        assert!(names.contains(&ADMIN_ROLE.to_string()));
        assert!(!names.contains(&"billing".to_string()));
    }
}
