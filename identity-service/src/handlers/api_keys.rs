use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use service_core::error::AppError;
use uuid::Uuid;

use crate::dtos::rbac::{CreateApiKeyRequest, CreateApiKeyResponse};
use crate::dtos::ErrorResponse;
use crate::middleware::AuthPrincipal;
use crate::models::permission::names;
use crate::utils::ValidatedJson;
use crate::AppState;

/// Issue an API key for an organization
///
/// The plaintext key is returned once. A key may only carry permissions its
/// creator holds.
#[utoipa::path(
    post,
    path = "/orgs/{org_id}/api-keys",
    params(("org_id" = Uuid, Path, description = "Organization")),
    request_body = CreateApiKeyRequest,
    responses(
        (status = 201, description = "API key issued", body = CreateApiKeyResponse),
        (status = 403, description = "Insufficient permissions", body = ErrorResponse)
    ),
    tag = "API Keys",
    security(("bearer_auth" = []))
)]
pub async fn create_api_key(
    State(state): State<AppState>,
    AuthPrincipal(principal): AuthPrincipal,
    Path(org_id): Path<Uuid>,
    ValidatedJson(req): ValidatedJson<CreateApiKeyRequest>,
) -> Result<impl IntoResponse, AppError> {
    principal.require(org_id, names::API_KEYS_MANAGE)?;
    let caller = principal.claims()?;

    if let Some(scope) = req.scopes.iter().find(|s| !principal.has_permission(s)) {
        tracing::warn!(user_id = %caller.user_id, scope = %scope, "API key scope exceeds caller permissions");
        return Err(AppError::Forbidden(anyhow::anyhow!(
            "Cannot grant a permission you do not hold"
        )));
    }

    let issued = state
        .api_keys
        .issue(org_id, caller.user_id, &req.name, req.scopes, req.expires_at)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateApiKeyResponse {
            key_id: issued.key.key_id,
            api_key: issued.plaintext,
            name: issued.key.name,
            scopes: issued.key.scopes,
            expires_at: issued.key.expires_at,
        }),
    ))
}

#[utoipa::path(
    delete,
    path = "/orgs/{org_id}/api-keys/{key_id}",
    params(
        ("org_id" = Uuid, Path, description = "Organization"),
        ("key_id" = String, Path, description = "Public key id")
    ),
    responses(
        (status = 204, description = "API key revoked"),
        (status = 403, description = "Insufficient permissions", body = ErrorResponse),
        (status = 404, description = "No such key in this organization", body = ErrorResponse)
    ),
    tag = "API Keys",
    security(("bearer_auth" = []))
)]
pub async fn revoke_api_key(
    State(state): State<AppState>,
    AuthPrincipal(principal): AuthPrincipal,
    Path((org_id, key_id)): Path<(Uuid, String)>,
) -> Result<StatusCode, AppError> {
    principal.require(org_id, names::API_KEYS_MANAGE)?;
    let caller = principal.claims()?;

    state.api_keys.revoke(org_id, &key_id, caller.user_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
