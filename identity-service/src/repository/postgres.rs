//! PostgreSQL-backed repositories.
//!
//! Queries are checked at runtime. Single-use transitions are conditional
//! updates whose affected-row count decides the winner.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use uuid::Uuid;

use super::{
    ApiKeyRepository, AuthorizationCodeRepository, ClientAppRepository, OrganizationRepository,
    PermissionRepository, RefreshTokenRepository, RoleRepository, RotateOutcome, StoreError,
    StoreHealth, StoreResult, UserRepository,
};
use crate::models::{
    ApiKey, AuthorizationCode, ClientApp, Membership, MembershipRemoval, MembershipStatus,
    Organization, Permission, RefreshToken, Role, User,
};

/// PostgreSQL database wrapper.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn db_error(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return StoreError::Conflict(db.message().to_string());
        }
    }
    StoreError::Backend(anyhow::Error::new(err))
}

const INSERT_REFRESH_TOKEN: &str = r#"
    INSERT INTO refresh_tokens (
        id, token_hash, client_id, user_id, organization_id, scope, family_id,
        expires_at, revoked, used_at, replaced_by_id,
        user_agent_hash, ip_hash, device_hash, created_at
    )
    VALUES (
        $1, $2, $3, $4, $5, $6, $7, $8,
        $9 OR EXISTS (SELECT 1 FROM revoked_token_families WHERE family_id = $7),
        $10, $11, $12, $13, $14, $15
    )
"#;

fn bind_refresh_token<'q>(
    query: sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments>,
    token: &'q RefreshToken,
) -> sqlx::query::Query<'q, sqlx::Postgres, sqlx::postgres::PgArguments> {
    query
        .bind(token.id)
        .bind(&token.token_hash)
        .bind(&token.client_id)
        .bind(token.user_id)
        .bind(token.organization_id)
        .bind(&token.scope)
        .bind(token.family_id)
        .bind(token.expires_at)
        .bind(token.revoked)
        .bind(token.used_at)
        .bind(token.replaced_by_id)
        .bind(&token.user_agent_hash)
        .bind(&token.ip_hash)
        .bind(&token.device_hash)
        .bind(token.created_at)
}

#[async_trait]
impl StoreHealth for PgStore {
    async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| {
                tracing::error!("Database health check failed: {}", e);
                db_error(e)
            })?;
        Ok(())
    }
}

// ==================== Organizations & memberships ====================

#[async_trait]
impl OrganizationRepository for PgStore {
    async fn insert_with_admin(&self, org: &Organization, admin: &Membership) -> StoreResult<()> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        sqlx::query(
            "INSERT INTO organizations (id, name, slug, status, created_at) VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(org.id)
        .bind(&org.name)
        .bind(&org.slug)
        .bind(org.status.as_str())
        .bind(org.created_at)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        sqlx::query(
            r#"
            INSERT INTO memberships (organization_id, user_id, role_id, status, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(admin.organization_id)
        .bind(admin.user_id)
        .bind(admin.role_id)
        .bind(admin.status.as_str())
        .bind(admin.created_at)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        tx.commit().await.map_err(db_error)
    }

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<Organization>> {
        sqlx::query_as::<_, Organization>("SELECT * FROM organizations WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)
    }

    async fn find_membership(&self, org_id: Uuid, user_id: Uuid) -> StoreResult<Option<Membership>> {
        sqlx::query_as::<_, Membership>(
            "SELECT * FROM memberships WHERE organization_id = $1 AND user_id = $2",
        )
        .bind(org_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)
    }

    async fn insert_membership(&self, membership: &Membership) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO memberships (organization_id, user_id, role_id, status, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(membership.organization_id)
        .bind(membership.user_id)
        .bind(membership.role_id)
        .bind(membership.status.as_str())
        .bind(membership.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn remove_membership(
        &self,
        org_id: Uuid,
        user_id: Uuid,
        admin_role_id: Uuid,
    ) -> StoreResult<MembershipRemoval> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        // Serializes concurrent removals within one organization
        sqlx::query("SELECT id FROM organizations WHERE id = $1 FOR UPDATE")
            .bind(org_id)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;

        let member = sqlx::query_as::<_, Membership>(
            "SELECT * FROM memberships WHERE organization_id = $1 AND user_id = $2",
        )
        .bind(org_id)
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(db_error)?;

        let Some(member) = member else {
            return Ok(MembershipRemoval::NotFound);
        };

        if member.role_id == admin_role_id && member.is_active() {
            let (admins,): (i64,) = sqlx::query_as(
                r#"
                SELECT COUNT(*) FROM memberships
                WHERE organization_id = $1 AND role_id = $2 AND status = $3
                "#,
            )
            .bind(org_id)
            .bind(admin_role_id)
            .bind(MembershipStatus::Active.as_str())
            .fetch_one(&mut *tx)
            .await
            .map_err(db_error)?;

            if admins <= 1 {
                return Ok(MembershipRemoval::LastAdmin);
            }
        }

        sqlx::query("DELETE FROM memberships WHERE organization_id = $1 AND user_id = $2")
            .bind(org_id)
            .bind(user_id)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;

        tx.commit().await.map_err(db_error)?;
        Ok(MembershipRemoval::Removed)
    }
}

// ==================== Users ====================

#[async_trait]
impl UserRepository for PgStore {
    async fn insert(&self, user: &User) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO users (id, email, password_hash, is_superadmin, is_active, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(user.id)
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(user.is_superadmin)
        .bind(user.is_active)
        .bind(user.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<User>> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)
    }

    async fn find_by_email(&self, email: &str) -> StoreResult<Option<User>> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE email = $1")
            .bind(email)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)
    }
}

// ==================== Roles & permissions ====================

#[async_trait]
impl RoleRepository for PgStore {
    async fn insert(&self, role: &Role) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO roles (id, name, description, is_system, organization_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(role.id)
        .bind(&role.name)
        .bind(&role.description)
        .bind(role.is_system)
        .bind(role.organization_id)
        .bind(role.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn find_by_id(&self, id: Uuid) -> StoreResult<Option<Role>> {
        sqlx::query_as::<_, Role>("SELECT * FROM roles WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)
    }

    async fn find_system_by_name(&self, name: &str) -> StoreResult<Option<Role>> {
        sqlx::query_as::<_, Role>("SELECT * FROM roles WHERE is_system = TRUE AND name = $1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)
    }

    async fn list_visible(&self, org_id: Uuid) -> StoreResult<Vec<Role>> {
        sqlx::query_as::<_, Role>(
            r#"
            SELECT * FROM roles
            WHERE organization_id IS NULL OR organization_id = $1
            ORDER BY is_system DESC, name
            "#,
        )
        .bind(org_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)
    }

    async fn permissions_for_role(&self, role_id: Uuid) -> StoreResult<Vec<Permission>> {
        sqlx::query_as::<_, Permission>(
            r#"
            SELECT p.* FROM permissions p
            JOIN role_permissions rp ON rp.permission_id = p.id
            WHERE rp.role_id = $1
            ORDER BY p.name
            "#,
        )
        .bind(role_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)
    }

    async fn assign_permissions(&self, role_id: Uuid, permission_ids: &[Uuid]) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO role_permissions (role_id, permission_id)
            SELECT $1, UNNEST($2::uuid[])
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(role_id)
        .bind(permission_ids)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }
}

#[async_trait]
impl PermissionRepository for PgStore {
    async fn insert(&self, permission: &Permission) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO permissions (id, name, description, is_system, organization_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(permission.id)
        .bind(&permission.name)
        .bind(&permission.description)
        .bind(permission.is_system)
        .bind(permission.organization_id)
        .bind(permission.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn find_by_ids(&self, ids: &[Uuid]) -> StoreResult<Vec<Permission>> {
        sqlx::query_as::<_, Permission>("SELECT * FROM permissions WHERE id = ANY($1)")
            .bind(ids)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)
    }

    async fn list_system(&self) -> StoreResult<Vec<Permission>> {
        sqlx::query_as::<_, Permission>(
            "SELECT * FROM permissions WHERE is_system = TRUE ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)
    }
}

// ==================== Clients & codes ====================

#[async_trait]
impl ClientAppRepository for PgStore {
    async fn insert(&self, client: &ClientApp) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO client_apps (
                id, client_id, client_secret_hash, name, redirect_uris,
                allowed_scopes, is_confidential, organization_id, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(client.id)
        .bind(&client.client_id)
        .bind(&client.client_secret_hash)
        .bind(&client.name)
        .bind(&client.redirect_uris)
        .bind(&client.allowed_scopes)
        .bind(client.is_confidential)
        .bind(client.organization_id)
        .bind(client.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn find_by_client_id(&self, client_id: &str) -> StoreResult<Option<ClientApp>> {
        sqlx::query_as::<_, ClientApp>("SELECT * FROM client_apps WHERE client_id = $1")
            .bind(client_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)
    }
}

#[async_trait]
impl AuthorizationCodeRepository for PgStore {
    async fn insert(&self, code: &AuthorizationCode) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO authorization_codes (
                id, code_hash, client_id, user_id, organization_id, redirect_uri, scope,
                code_challenge, code_challenge_method, expires_at, used, family_id, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(code.id)
        .bind(&code.code_hash)
        .bind(&code.client_id)
        .bind(code.user_id)
        .bind(code.organization_id)
        .bind(&code.redirect_uri)
        .bind(&code.scope)
        .bind(&code.code_challenge)
        .bind(&code.code_challenge_method)
        .bind(code.expires_at)
        .bind(code.used)
        .bind(code.family_id)
        .bind(code.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn find_by_hash(&self, code_hash: &str) -> StoreResult<Option<AuthorizationCode>> {
        sqlx::query_as::<_, AuthorizationCode>(
            "SELECT * FROM authorization_codes WHERE code_hash = $1",
        )
        .bind(code_hash)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)
    }

    async fn redeem(&self, id: Uuid, family_id: Uuid) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE authorization_codes SET used = TRUE, family_id = $2 WHERE id = $1 AND used = FALSE",
        )
        .bind(id)
        .bind(family_id)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(result.rows_affected() == 1)
    }
}

// ==================== Refresh tokens ====================

#[async_trait]
impl RefreshTokenRepository for PgStore {
    async fn insert(&self, token: &RefreshToken) -> StoreResult<()> {
        bind_refresh_token(sqlx::query(INSERT_REFRESH_TOKEN), token)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(())
    }

    async fn find_by_hash(&self, token_hash: &str) -> StoreResult<Option<RefreshToken>> {
        sqlx::query_as::<_, RefreshToken>("SELECT * FROM refresh_tokens WHERE token_hash = $1")
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)
    }

    async fn rotate(
        &self,
        predecessor_id: Uuid,
        successor: &RefreshToken,
        now: DateTime<Utc>,
    ) -> StoreResult<RotateOutcome> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        bind_refresh_token(sqlx::query(INSERT_REFRESH_TOKEN), successor)
            .execute(&mut *tx)
            .await
            .map_err(db_error)?;

        let consumed = sqlx::query(
            r#"
            UPDATE refresh_tokens SET used_at = $2, replaced_by_id = $3
            WHERE id = $1 AND used_at IS NULL AND revoked = FALSE
            "#,
        )
        .bind(predecessor_id)
        .bind(now)
        .bind(successor.id)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?
        .rows_affected();

        if consumed == 0 {
            tx.rollback().await.map_err(db_error)?;
            return Ok(RotateOutcome::AlreadyConsumed);
        }

        tx.commit().await.map_err(db_error)?;
        Ok(RotateOutcome::Rotated)
    }

    async fn revoke_family(&self, family_id: Uuid, reason: &str) -> StoreResult<u64> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        sqlx::query(
            r#"
            INSERT INTO revoked_token_families (family_id, reason, revoked_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (family_id) DO NOTHING
            "#,
        )
        .bind(family_id)
        .bind(reason)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        let revoked = sqlx::query(
            "UPDATE refresh_tokens SET revoked = TRUE WHERE family_id = $1 AND revoked = FALSE",
        )
        .bind(family_id)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?
        .rows_affected();

        tx.commit().await.map_err(db_error)?;
        Ok(revoked)
    }

    async fn is_family_revoked(&self, family_id: Uuid) -> StoreResult<bool> {
        let (revoked,): (bool,) = sqlx::query_as(
            "SELECT EXISTS (SELECT 1 FROM revoked_token_families WHERE family_id = $1)",
        )
        .bind(family_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(revoked)
    }

    async fn revoke_all_for_user(&self, user_id: Uuid) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE refresh_tokens SET revoked = TRUE WHERE user_id = $1 AND revoked = FALSE",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(result.rows_affected())
    }

    async fn revoke_all_for_user_in_org(&self, user_id: Uuid, org_id: Uuid) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE refresh_tokens SET revoked = TRUE
            WHERE user_id = $1 AND organization_id = $2 AND revoked = FALSE
            "#,
        )
        .bind(user_id)
        .bind(org_id)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(result.rows_affected())
    }

    async fn revoke_all_for_org(&self, org_id: Uuid) -> StoreResult<u64> {
        let result = sqlx::query(
            "UPDATE refresh_tokens SET revoked = TRUE WHERE organization_id = $1 AND revoked = FALSE",
        )
        .bind(org_id)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(result.rows_affected())
    }
}

// ==================== API keys ====================

#[async_trait]
impl ApiKeyRepository for PgStore {
    async fn insert(&self, key: &ApiKey) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO api_keys (
                id, key_id, organization_id, created_by, name, hashed_secret,
                scopes, expires_at, revoked, last_used_at, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(key.id)
        .bind(&key.key_id)
        .bind(key.organization_id)
        .bind(key.created_by)
        .bind(&key.name)
        .bind(&key.hashed_secret)
        .bind(&key.scopes)
        .bind(key.expires_at)
        .bind(key.revoked)
        .bind(key.last_used_at)
        .bind(key.created_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(())
    }

    async fn find_by_key_id(&self, key_id: &str) -> StoreResult<Option<ApiKey>> {
        sqlx::query_as::<_, ApiKey>("SELECT * FROM api_keys WHERE key_id = $1")
            .bind(key_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)
    }

    async fn touch(&self, id: Uuid, at: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query("UPDATE api_keys SET last_used_at = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(())
    }

    async fn revoke(&self, org_id: Uuid, key_id: &str) -> StoreResult<bool> {
        let result = sqlx::query(
            "UPDATE api_keys SET revoked = TRUE WHERE organization_id = $1 AND key_id = $2",
        )
        .bind(org_id)
        .bind(key_id)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;
        Ok(result.rows_affected() == 1)
    }
}
