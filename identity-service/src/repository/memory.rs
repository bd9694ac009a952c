//! In-memory store used by tests and local development.
//!
//! Every operation takes one lock over the whole state, which makes the
//! compare-and-set operations trivially atomic.

use std::{
    collections::{HashMap, HashSet},
    sync::{Mutex, MutexGuard},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::{
    ApiKeyRepository, AuthorizationCodeRepository, ClientAppRepository, CounterStore,
    OrganizationRepository, PermissionRepository, RefreshTokenRepository, RevocationStore,
    RoleRepository, RotateOutcome, StoreError, StoreHealth, StoreResult, UserRepository,
    WatermarkScope, Watermarks,
};
use crate::models::{
    ApiKey, AuthorizationCode, ClientApp, Membership, MembershipRemoval, Organization,
    Permission, RefreshToken, Role, User,
};

#[derive(Default)]
struct State {
    organizations: HashMap<Uuid, Organization>,
    memberships: HashMap<(Uuid, Uuid), Membership>,
    users: HashMap<Uuid, User>,
    roles: HashMap<Uuid, Role>,
    role_permissions: HashMap<Uuid, HashSet<Uuid>>,
    permissions: HashMap<Uuid, Permission>,
    clients: HashMap<String, ClientApp>,
    codes: HashMap<Uuid, AuthorizationCode>,
    refresh_tokens: HashMap<Uuid, RefreshToken>,
    revoked_families: HashSet<Uuid>,
    api_keys: HashMap<String, ApiKey>,
    watermarks: HashMap<WatermarkScope, DateTime<Utc>>,
    denied_tokens: HashMap<String, DateTime<Utc>>,
    counters: HashMap<String, (u64, Instant)>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|e| StoreError::Backend(anyhow::anyhow!("Memory store mutex poisoned: {}", e)))
    }
}

fn revoke_where(state: &mut State, predicate: impl Fn(&RefreshToken) -> bool) -> u64 {
    let mut count = 0;
    for token in state.refresh_tokens.values_mut() {
        if !token.revoked && predicate(token) {
            token.revoked = true;
            count += 1;
        }
    }
    count
}

#[async_trait]
impl StoreHealth for MemoryStore {
    async fn health_check(&self) -> StoreResult<()> {
        self.lock().map(|_| ())
    }
}

#[async_trait]
impl OrganizationRepository for MemoryStore {
    async fn insert_with_admin(&self, org: &Organization, admin: &Membership) -> StoreResult<()> {
        let mut state = self.lock()?;
        if state.organizations.values().any(|o| o.slug == org.slug) {
            return Err(StoreError::Conflict(format!("slug {} already taken", org.slug)));
        }
        state.organizations.insert(org.id, org.clone());
        state
            .memberships
            .insert((admin.organization_id, admin.user_id), admin.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<Organization>> {
        Ok(self.lock()?.organizations.get(&id).cloned())
    }

    async fn find_membership(&self, org_id: Uuid, user_id: Uuid) -> StoreResult<Option<Membership>> {
        Ok(self.lock()?.memberships.get(&(org_id, user_id)).cloned())
    }

    async fn insert_membership(&self, membership: &Membership) -> StoreResult<()> {
        let mut state = self.lock()?;
        let key = (membership.organization_id, membership.user_id);
        if state.memberships.contains_key(&key) {
            return Err(StoreError::Conflict("membership already exists".to_string()));
        }
        state.memberships.insert(key, membership.clone());
        Ok(())
    }

    async fn remove_membership(
        &self,
        org_id: Uuid,
        user_id: Uuid,
        admin_role_id: Uuid,
    ) -> StoreResult<MembershipRemoval> {
        let mut state = self.lock()?;
        let Some(member) = state.memberships.get(&(org_id, user_id)) else {
            return Ok(MembershipRemoval::NotFound);
        };
        if member.role_id == admin_role_id && member.is_active() {
            let admins = state
                .memberships
                .values()
                .filter(|m| m.organization_id == org_id && m.role_id == admin_role_id && m.is_active())
                .count();
            if admins <= 1 {
                return Ok(MembershipRemoval::LastAdmin);
            }
        }
        state.memberships.remove(&(org_id, user_id));
        Ok(MembershipRemoval::Removed)
    }
}

#[async_trait]
impl UserRepository for MemoryStore {
    async fn insert(&self, user: &User) -> StoreResult<()> {
        let mut state = self.lock()?;
        if state.users.values().any(|u| u.email == user.email) {
            return Err(StoreError::Conflict("email already registered".to_string()));
        }
        state.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<User>> {
        Ok(self.lock()?.users.get(&id).cloned())
    }

    async fn find_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        Ok(self.lock()?.users.values().find(|u| u.email == email).cloned())
    }
}

#[async_trait]
impl RoleRepository for MemoryStore {
    async fn insert(&self, role: &Role) -> StoreResult<()> {
        let mut state = self.lock()?;
        if state
            .roles
            .values()
            .any(|r| r.name == role.name && r.organization_id == role.organization_id)
        {
            return Err(StoreError::Conflict(format!("role {} already exists", role.name)));
        }
        state.roles.insert(role.id, role.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<Role>> {
        Ok(self.lock()?.roles.get(&id).cloned())
    }

    async fn find_system_by_name(&self, name: &str) -> StoreResult<Option<Role>> {
        Ok(self
            .lock()?
            .roles
            .values()
            .find(|r| r.is_system && r.name == name)
            .cloned())
    }

    async fn list_visible(&self, org_id: Uuid) -> StoreResult<Vec<Role>> {
        let state = self.lock()?;
        let mut roles: Vec<Role> = state
            .roles
            .values()
            .filter(|r| r.usable_in(org_id))
            .cloned()
            .collect();
        roles.sort_by(|a, b| (!a.is_system, &a.name).cmp(&(!b.is_system, &b.name)));
        Ok(roles)
    }

    async fn permissions_for_role(&self, role_id: Uuid) -> StoreResult<Vec<Permission>> {
        let state = self.lock()?;
        let Some(ids) = state.role_permissions.get(&role_id) else {
            return Ok(Vec::new());
        };
        let mut permissions: Vec<Permission> = ids
            .iter()
            .filter_map(|id| state.permissions.get(id).cloned())
            .collect();
        permissions.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(permissions)
    }

    async fn assign_permissions(&self, role_id: Uuid, permission_ids: &[Uuid]) -> StoreResult<()> {
        let mut state = self.lock()?;
        state
            .role_permissions
            .entry(role_id)
            .or_default()
            .extend(permission_ids.iter().copied());
        Ok(())
    }
}

#[async_trait]
impl PermissionRepository for MemoryStore {
    async fn insert(&self, permission: &Permission) -> StoreResult<()> {
        let mut state = self.lock()?;
        if state
            .permissions
            .values()
            .any(|p| p.name == permission.name && p.organization_id == permission.organization_id)
        {
            return Err(StoreError::Conflict(format!(
                "permission {} already exists",
                permission.name
            )));
        }
        state.permissions.insert(permission.id, permission.clone());
        Ok(())
    }

    async fn find_by_ids(&self, ids: &[Uuid]) -> StoreResult<Vec<Permission>> {
        let state = self.lock()?;
        Ok(ids
            .iter()
            .filter_map(|id| state.permissions.get(id).cloned())
            .collect())
    }

    async fn list_system(&self) -> StoreResult<Vec<Permission>> {
        let state = self.lock()?;
        let mut permissions: Vec<Permission> = state
            .permissions
            .values()
            .filter(|p| p.is_system)
            .cloned()
            .collect();
        permissions.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(permissions)
    }
}

#[async_trait]
impl ClientAppRepository for MemoryStore {
    async fn insert(&self, client: &ClientApp) -> StoreResult<()> {
        let mut state = self.lock()?;
        if state.clients.contains_key(&client.client_id) {
            return Err(StoreError::Conflict(format!(
                "client {} already registered",
                client.client_id
            )));
        }
        state.clients.insert(client.client_id.clone(), client.clone());
        Ok(())
    }

    async fn find_by_client_id(&self, client_id: &str) -> StoreResult<Option<ClientApp>> {
        Ok(self.lock()?.clients.get(client_id).cloned())
    }
}

#[async_trait]
impl AuthorizationCodeRepository for MemoryStore {
    async fn insert(&self, code: &AuthorizationCode) -> StoreResult<()> {
        self.lock()?.codes.insert(code.id, code.clone());
        Ok(())
    }

    async fn find_by_hash(&self, code_hash: &str) -> StoreResult<Option<AuthorizationCode>> {
        Ok(self
            .lock()?
            .codes
            .values()
            .find(|c| c.code_hash == code_hash)
            .cloned())
    }

    async fn redeem(&self, id: Uuid, family_id: Uuid) -> StoreResult<bool> {
        let mut state = self.lock()?;
        match state.codes.get_mut(&id) {
            Some(code) if !code.used => {
                code.used = true;
                code.family_id = Some(family_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl RefreshTokenRepository for MemoryStore {
    async fn insert(&self, token: &RefreshToken) -> StoreResult<()> {
        let mut state = self.lock()?;
        let mut token = token.clone();
        if state.revoked_families.contains(&token.family_id) {
            token.revoked = true;
        }
        state.refresh_tokens.insert(token.id, token);
        Ok(())
    }

    async fn find_by_hash(&self, token_hash: &str) -> StoreResult<Option<RefreshToken>> {
        Ok(self
            .lock()?
            .refresh_tokens
            .values()
            .find(|t| t.token_hash == token_hash)
            .cloned())
    }

    async fn rotate(
        &self,
        predecessor_id: Uuid,
        successor: &RefreshToken,
        now: DateTime<Utc>,
    ) -> StoreResult<RotateOutcome> {
        let mut state = self.lock()?;
        match state.refresh_tokens.get_mut(&predecessor_id) {
            Some(token) if token.used_at.is_none() && !token.revoked => {
                token.used_at = Some(now);
                token.replaced_by_id = Some(successor.id);
            }
            _ => return Ok(RotateOutcome::AlreadyConsumed),
        }
        let mut successor = successor.clone();
        if state.revoked_families.contains(&successor.family_id) {
            successor.revoked = true;
        }
        state.refresh_tokens.insert(successor.id, successor);
        Ok(RotateOutcome::Rotated)
    }

    async fn revoke_family(&self, family_id: Uuid, _reason: &str) -> StoreResult<u64> {
        let mut state = self.lock()?;
        state.revoked_families.insert(family_id);
        Ok(revoke_where(&mut state, |t| t.family_id == family_id))
    }

    async fn is_family_revoked(&self, family_id: Uuid) -> StoreResult<bool> {
        Ok(self.lock()?.revoked_families.contains(&family_id))
    }

    async fn revoke_all_for_user(&self, user_id: Uuid) -> StoreResult<u64> {
        let mut state = self.lock()?;
        Ok(revoke_where(&mut state, |t| t.user_id == user_id))
    }

    async fn revoke_all_for_user_in_org(&self, user_id: Uuid, org_id: Uuid) -> StoreResult<u64> {
        let mut state = self.lock()?;
        Ok(revoke_where(&mut state, |t| {
            t.user_id == user_id && t.organization_id == org_id
        }))
    }

    async fn revoke_all_for_org(&self, org_id: Uuid) -> StoreResult<u64> {
        let mut state = self.lock()?;
        Ok(revoke_where(&mut state, |t| t.organization_id == org_id))
    }
}

#[async_trait]
impl ApiKeyRepository for MemoryStore {
    async fn insert(&self, key: &ApiKey) -> StoreResult<()> {
        let mut state = self.lock()?;
        if state.api_keys.contains_key(&key.key_id) {
            return Err(StoreError::Conflict("api key id collision".to_string()));
        }
        state.api_keys.insert(key.key_id.clone(), key.clone());
        Ok(())
    }

    async fn find_by_key_id(&self, key_id: &str) -> StoreResult<Option<ApiKey>> {
        Ok(self.lock()?.api_keys.get(key_id).cloned())
    }

    async fn touch(&self, id: Uuid, at: DateTime<Utc>) -> StoreResult<()> {
        let mut state = self.lock()?;
        if let Some(key) = state.api_keys.values_mut().find(|k| k.id == id) {
            key.last_used_at = Some(at);
        }
        Ok(())
    }

    async fn revoke(&self, org_id: Uuid, key_id: &str) -> StoreResult<bool> {
        let mut state = self.lock()?;
        match state.api_keys.get_mut(key_id) {
            Some(key) if key.organization_id == org_id => {
                key.revoked = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl RevocationStore for MemoryStore {
    async fn raise_watermark(&self, scope: WatermarkScope, at: DateTime<Utc>) -> StoreResult<()> {
        let mut state = self.lock()?;
        let entry = state.watermarks.entry(scope).or_insert(at);
        if at > *entry {
            *entry = at;
        }
        Ok(())
    }

    async fn watermarks(&self, user_id: Uuid, org_id: Uuid) -> StoreResult<Watermarks> {
        let state = self.lock()?;
        Ok(Watermarks {
            user: state.watermarks.get(&WatermarkScope::User(user_id)).copied(),
            organization: state
                .watermarks
                .get(&WatermarkScope::Organization(org_id))
                .copied(),
            user_in_organization: state
                .watermarks
                .get(&WatermarkScope::UserInOrganization { user_id, org_id })
                .copied(),
        })
    }

    async fn deny_token(&self, jti: &str, expires_at: DateTime<Utc>) -> StoreResult<()> {
        self.lock()?.denied_tokens.insert(jti.to_string(), expires_at);
        Ok(())
    }

    async fn is_token_denied(&self, jti: &str) -> StoreResult<bool> {
        let state = self.lock()?;
        Ok(state
            .denied_tokens
            .get(jti)
            .map_or(false, |expires_at| *expires_at > Utc::now()))
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increment(&self, key: &str, ttl: Duration) -> StoreResult<u64> {
        let mut state = self.lock()?;
        let now = Instant::now();
        let entry = state
            .counters
            .entry(key.to_string())
            .or_insert((0, now + ttl));
        if entry.1 <= now {
            *entry = (0, now + ttl);
        }
        entry.0 += 1;
        Ok(entry.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MembershipStatus, RefreshTokenSubject, TokenBinding};

    fn token(family: Uuid, user: Uuid, org: Uuid, raw: &str) -> RefreshToken {
        RefreshToken::new_root(
            family,
            raw,
            RefreshTokenSubject {
                client_id: "spa".to_string(),
                user_id: user,
                organization_id: org,
                scope: "openid".to_string(),
            },
            &TokenBinding::default(),
            chrono::Duration::days(1),
        )
    }

    #[tokio::test]
    async fn test_rotate_is_compare_and_set() {
        let store = MemoryStore::new();
        let root = token(Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), "a");
        RefreshTokenRepository::insert(&store, &root).await.unwrap();

        let first = root.successor("b", &TokenBinding::default(), chrono::Duration::days(1));
        let second = root.successor("c", &TokenBinding::default(), chrono::Duration::days(1));

        assert_eq!(
            store.rotate(root.id, &first, Utc::now()).await.unwrap(),
            RotateOutcome::Rotated
        );
        assert_eq!(
            store.rotate(root.id, &second, Utc::now()).await.unwrap(),
            RotateOutcome::AlreadyConsumed
        );
        assert!(RefreshTokenRepository::find_by_hash(&store, &second.token_hash)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_tokens_joining_revoked_family_arrive_revoked() {
        let store = MemoryStore::new();
        let family = Uuid::new_v4();
        store.revoke_family(family, "replay").await.unwrap();

        let late = token(family, Uuid::new_v4(), Uuid::new_v4(), "late");
        RefreshTokenRepository::insert(&store, &late).await.unwrap();

        let stored = RefreshTokenRepository::find_by_hash(&store, &late.token_hash)
            .await
            .unwrap()
            .unwrap();
        assert!(stored.revoked);
    }

    #[tokio::test]
    async fn test_last_admin_is_kept() {
        let store = MemoryStore::new();
        let admin_role = Uuid::new_v4();
        let org = Organization::new("Acme".to_string(), "acme".to_string());
        let creator = Uuid::new_v4();
        let admin = Membership::new(org.id, creator, admin_role, MembershipStatus::Active);
        store.insert_with_admin(&org, &admin).await.unwrap();

        assert_eq!(
            store.remove_membership(org.id, creator, admin_role).await.unwrap(),
            MembershipRemoval::LastAdmin
        );

        let second = Uuid::new_v4();
        store
            .insert_membership(&Membership::new(org.id, second, admin_role, MembershipStatus::Active))
            .await
            .unwrap();
        assert_eq!(
            store.remove_membership(org.id, creator, admin_role).await.unwrap(),
            MembershipRemoval::Removed
        );
        assert_eq!(
            store.remove_membership(org.id, creator, admin_role).await.unwrap(),
            MembershipRemoval::NotFound
        );
    }

    #[tokio::test]
    async fn test_watermark_never_decreases() {
        let store = MemoryStore::new();
        let user = Uuid::new_v4();
        let org = Uuid::new_v4();
        let later = Utc::now();
        let earlier = later - chrono::Duration::minutes(5);

        store.raise_watermark(WatermarkScope::User(user), later).await.unwrap();
        store.raise_watermark(WatermarkScope::User(user), earlier).await.unwrap();

        let marks = store.watermarks(user, org).await.unwrap();
        assert_eq!(marks.user, Some(later));
        assert_eq!(marks.organization, None);
    }

    #[tokio::test]
    async fn test_counter_resets_after_ttl() {
        let store = MemoryStore::new();
        let ttl = Duration::from_millis(30);
        assert_eq!(store.increment("k", ttl).await.unwrap(), 1);
        assert_eq!(store.increment("k", ttl).await.unwrap(), 2);
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(store.increment("k", ttl).await.unwrap(), 1);
    }
}
