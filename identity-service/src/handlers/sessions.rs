//! Bulk session revocation.

use axum::{
    extract::{Path, State},
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;

use crate::dtos::rbac::SessionsRevokedResponse;
use crate::dtos::ErrorResponse;
use crate::middleware::AuthPrincipal;
use crate::models::permission::names;
use crate::AppState;

/// Revoke every session of a user, in every organization
///
/// Allowed for the user themself and for superadmins.
#[utoipa::path(
    post,
    path = "/users/{user_id}/sessions/revoke",
    params(("user_id" = Uuid, Path, description = "User whose sessions are revoked")),
    responses(
        (status = 200, description = "Sessions revoked", body = SessionsRevokedResponse),
        (status = 403, description = "Insufficient permissions", body = ErrorResponse)
    ),
    tag = "Sessions",
    security(("bearer_auth" = []))
)]
pub async fn revoke_user_sessions(
    State(state): State<AppState>,
    AuthPrincipal(principal): AuthPrincipal,
    Path(user_id): Path<Uuid>,
) -> Result<Json<SessionsRevokedResponse>, AppError> {
    if !principal.is_superadmin() && principal.user_id() != Some(user_id) {
        return Err(AppError::Forbidden(anyhow::anyhow!("Insufficient permissions")));
    }

    let revoked = state
        .revocation
        .revoke_user_sessions(user_id, "user_sessions_revoked")
        .await?;
    Ok(Json(SessionsRevokedResponse { revoked }))
}

/// Revoke every session opened in an organization
#[utoipa::path(
    post,
    path = "/orgs/{org_id}/sessions/revoke",
    params(("org_id" = Uuid, Path, description = "Organization")),
    responses(
        (status = 200, description = "Sessions revoked", body = SessionsRevokedResponse),
        (status = 403, description = "Insufficient permissions", body = ErrorResponse)
    ),
    tag = "Sessions",
    security(("bearer_auth" = []))
)]
pub async fn revoke_org_sessions(
    State(state): State<AppState>,
    AuthPrincipal(principal): AuthPrincipal,
    Path(org_id): Path<Uuid>,
) -> Result<Json<SessionsRevokedResponse>, AppError> {
    principal.require(org_id, names::SESSIONS_REVOKE)?;

    let revoked = state
        .revocation
        .revoke_org_sessions(org_id, "organization_sessions_revoked")
        .await?;
    Ok(Json(SessionsRevokedResponse { revoked }))
}

/// Revoke a member's sessions within one organization
#[utoipa::path(
    post,
    path = "/orgs/{org_id}/members/{user_id}/sessions/revoke",
    params(
        ("org_id" = Uuid, Path, description = "Organization"),
        ("user_id" = Uuid, Path, description = "Member")
    ),
    responses(
        (status = 200, description = "Sessions revoked", body = SessionsRevokedResponse),
        (status = 403, description = "Insufficient permissions", body = ErrorResponse)
    ),
    tag = "Sessions",
    security(("bearer_auth" = []))
)]
pub async fn revoke_member_sessions(
    State(state): State<AppState>,
    AuthPrincipal(principal): AuthPrincipal,
    Path((org_id, user_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<SessionsRevokedResponse>, AppError> {
    if principal.user_id() != Some(user_id) || principal.organization_id() != org_id {
        principal.require(org_id, names::SESSIONS_REVOKE)?;
    }

    let revoked = state
        .revocation
        .revoke_user_in_org(user_id, org_id, "member_sessions_revoked")
        .await?;
    Ok(Json(SessionsRevokedResponse { revoked }))
}
