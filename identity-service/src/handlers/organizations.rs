//! Organizations, memberships, roles and permissions.
//!
//! Every route checks the caller's permissions against the organization in
//! the path, using only what the caller's credential carries.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;

use crate::dtos::rbac::{
    AddMemberRequest, AssignPermissionsRequest, CreateOrganizationRequest, CreatePermissionRequest,
    CreateRoleRequest, EffectivePermissionsResponse,
};
use crate::dtos::ErrorResponse;
use crate::middleware::{AuthPrincipal, Principal};
use crate::models::{permission::names, Membership, Organization, Permission, Role};
use crate::utils::ValidatedJson;
use crate::AppState;

fn require_member_of(principal: &Principal, org_id: Uuid) -> Result<(), AppError> {
    if principal.is_superadmin() || principal.organization_id() == org_id {
        Ok(())
    } else {
        Err(AppError::Forbidden(anyhow::anyhow!("Insufficient permissions")))
    }
}

/// Create an organization
///
/// The caller becomes its first admin.
#[utoipa::path(
    post,
    path = "/orgs",
    request_body = CreateOrganizationRequest,
    responses(
        (status = 201, description = "Organization created", body = Organization),
        (status = 409, description = "Slug already taken", body = ErrorResponse)
    ),
    tag = "Organizations",
    security(("bearer_auth" = []))
)]
pub async fn create_organization(
    State(state): State<AppState>,
    AuthPrincipal(principal): AuthPrincipal,
    ValidatedJson(req): ValidatedJson<CreateOrganizationRequest>,
) -> Result<impl IntoResponse, AppError> {
    let caller = principal.claims()?;
    let org = state
        .rbac
        .create_organization(caller.user_id, &req.name, &req.slug)
        .await?;

    Ok((StatusCode::CREATED, Json(org)))
}

#[utoipa::path(
    post,
    path = "/orgs/{org_id}/members",
    params(("org_id" = Uuid, Path, description = "Organization")),
    request_body = AddMemberRequest,
    responses(
        (status = 201, description = "Member added", body = Membership),
        (status = 400, description = "Role belongs to another organization", body = ErrorResponse),
        (status = 403, description = "Insufficient permissions", body = ErrorResponse),
        (status = 409, description = "Already a member", body = ErrorResponse)
    ),
    tag = "Organizations",
    security(("bearer_auth" = []))
)]
pub async fn add_member(
    State(state): State<AppState>,
    AuthPrincipal(principal): AuthPrincipal,
    Path(org_id): Path<Uuid>,
    Json(req): Json<AddMemberRequest>,
) -> Result<impl IntoResponse, AppError> {
    principal.require(org_id, names::MEMBERS_MANAGE)?;

    let membership = state.rbac.add_member(org_id, req.user_id, req.role_id).await?;
    Ok((StatusCode::CREATED, Json(membership)))
}

/// Remove a member
///
/// The member's sessions in this organization are revoked with it.
#[utoipa::path(
    delete,
    path = "/orgs/{org_id}/members/{user_id}",
    params(
        ("org_id" = Uuid, Path, description = "Organization"),
        ("user_id" = Uuid, Path, description = "Member")
    ),
    responses(
        (status = 204, description = "Member removed"),
        (status = 403, description = "Insufficient permissions", body = ErrorResponse),
        (status = 409, description = "Cannot remove the last admin", body = ErrorResponse)
    ),
    tag = "Organizations",
    security(("bearer_auth" = []))
)]
pub async fn remove_member(
    State(state): State<AppState>,
    AuthPrincipal(principal): AuthPrincipal,
    Path((org_id, user_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, AppError> {
    principal.require(org_id, names::MEMBERS_MANAGE)?;

    state.rbac.remove_member(org_id, user_id).await?;
    state
        .revocation
        .revoke_user_in_org(user_id, org_id, "membership_removed")
        .await?;

    Ok(StatusCode::NO_CONTENT)
}

/// Roles usable in an organization
#[utoipa::path(
    get,
    path = "/orgs/{org_id}/roles",
    params(("org_id" = Uuid, Path, description = "Organization")),
    responses(
        (status = 200, description = "System roles and the organization's custom roles", body = [Role]),
        (status = 403, description = "Not a member", body = ErrorResponse)
    ),
    tag = "RBAC",
    security(("bearer_auth" = []))
)]
pub async fn list_roles(
    State(state): State<AppState>,
    AuthPrincipal(principal): AuthPrincipal,
    Path(org_id): Path<Uuid>,
) -> Result<Json<Vec<Role>>, AppError> {
    require_member_of(&principal, org_id)?;
    Ok(Json(state.rbac.roles_visible_to(org_id).await?))
}

#[utoipa::path(
    post,
    path = "/orgs/{org_id}/roles",
    params(("org_id" = Uuid, Path, description = "Organization")),
    request_body = CreateRoleRequest,
    responses(
        (status = 201, description = "Role created", body = Role),
        (status = 403, description = "Insufficient permissions", body = ErrorResponse),
        (status = 409, description = "Duplicate name", body = ErrorResponse)
    ),
    tag = "RBAC",
    security(("bearer_auth" = []))
)]
pub async fn create_role(
    State(state): State<AppState>,
    AuthPrincipal(principal): AuthPrincipal,
    Path(org_id): Path<Uuid>,
    ValidatedJson(req): ValidatedJson<CreateRoleRequest>,
) -> Result<impl IntoResponse, AppError> {
    principal.require(org_id, names::ROLES_MANAGE)?;

    let role = state
        .rbac
        .create_custom_role(org_id, &req.name, req.description)
        .await?;
    Ok((StatusCode::CREATED, Json(role)))
}

/// Attach permissions to a role
///
/// Custom roles are managed by their own organization. System roles are
/// shared templates and only superadmins may change them.
#[utoipa::path(
    post,
    path = "/orgs/{org_id}/roles/{role_id}/permissions",
    params(
        ("org_id" = Uuid, Path, description = "Organization"),
        ("role_id" = Uuid, Path, description = "Role")
    ),
    request_body = AssignPermissionsRequest,
    responses(
        (status = 204, description = "Permissions assigned"),
        (status = 400, description = "Permission belongs to another organization", body = ErrorResponse),
        (status = 403, description = "Insufficient permissions", body = ErrorResponse),
        (status = 404, description = "Role or permission not found", body = ErrorResponse)
    ),
    tag = "RBAC",
    security(("bearer_auth" = []))
)]
pub async fn assign_permissions(
    State(state): State<AppState>,
    AuthPrincipal(principal): AuthPrincipal,
    Path((org_id, role_id)): Path<(Uuid, Uuid)>,
    ValidatedJson(req): ValidatedJson<AssignPermissionsRequest>,
) -> Result<StatusCode, AppError> {
    principal.require(org_id, names::ROLES_MANAGE)?;

    let role = state.rbac.find_role(role_id).await?;
    match role.organization_id {
        Some(owner) if owner == org_id => {}
        Some(_) => return Err(AppError::NotFound(anyhow::anyhow!("Role not found"))),
        None if principal.is_superadmin() => {}
        None => {
            return Err(AppError::Forbidden(anyhow::anyhow!(
                "System roles can only be changed by a superadmin"
            )))
        }
    }

    state
        .rbac
        .assign_permissions_to_role(role.id, &req.permission_ids)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    post,
    path = "/orgs/{org_id}/permissions",
    params(("org_id" = Uuid, Path, description = "Organization")),
    request_body = CreatePermissionRequest,
    responses(
        (status = 201, description = "Permission created", body = Permission),
        (status = 400, description = "Invalid permission name", body = ErrorResponse),
        (status = 403, description = "Insufficient permissions", body = ErrorResponse),
        (status = 409, description = "Duplicate name", body = ErrorResponse)
    ),
    tag = "RBAC",
    security(("bearer_auth" = []))
)]
pub async fn create_permission(
    State(state): State<AppState>,
    AuthPrincipal(principal): AuthPrincipal,
    Path(org_id): Path<Uuid>,
    ValidatedJson(req): ValidatedJson<CreatePermissionRequest>,
) -> Result<impl IntoResponse, AppError> {
    principal.require(org_id, names::PERMISSIONS_MANAGE)?;

    let permission = state
        .rbac
        .create_custom_permission(org_id, &req.name, req.description)
        .await?;
    Ok((StatusCode::CREATED, Json(permission)))
}

/// Effective permissions of a member
#[utoipa::path(
    get,
    path = "/orgs/{org_id}/members/{user_id}/permissions",
    params(
        ("org_id" = Uuid, Path, description = "Organization"),
        ("user_id" = Uuid, Path, description = "Member")
    ),
    responses(
        (status = 200, description = "Resolved permissions", body = EffectivePermissionsResponse),
        (status = 403, description = "Insufficient permissions", body = ErrorResponse)
    ),
    tag = "RBAC",
    security(("bearer_auth" = []), ("api_key" = []))
)]
pub async fn effective_permissions(
    State(state): State<AppState>,
    AuthPrincipal(principal): AuthPrincipal,
    Path((org_id, user_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<EffectivePermissionsResponse>, AppError> {
    let is_self = principal.user_id() == Some(user_id) && principal.organization_id() == org_id;
    if !is_self {
        principal.require(org_id, names::USERS_READ)?;
    }

    let resolved = state
        .rbac
        .resolve_effective_permissions(user_id, org_id)
        .await?;

    Ok(Json(EffectivePermissionsResponse {
        user_id,
        organization_id: org_id,
        role_id: resolved.role_id,
        role_name: resolved.role_name,
        permissions: resolved.permissions,
        is_superadmin: resolved.is_superadmin,
    }))
}
