use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use service_core::error::AppError;

use crate::dtos::oauth::{CreateClientRequest, CreateClientResponse};
use crate::dtos::ErrorResponse;
use crate::middleware::AuthPrincipal;
use crate::utils::ValidatedJson;
use crate::AppState;

/// Register an OAuth client
///
/// Superadmin only. Confidential clients receive their secret once.
#[utoipa::path(
    post,
    path = "/admin/clients",
    request_body = CreateClientRequest,
    responses(
        (status = 201, description = "Client registered", body = CreateClientResponse),
        (status = 400, description = "Invalid redirect URI", body = ErrorResponse),
        (status = 403, description = "Superadmin required", body = ErrorResponse)
    ),
    tag = "Admin",
    security(("bearer_auth" = []))
)]
pub async fn create_client(
    State(state): State<AppState>,
    AuthPrincipal(principal): AuthPrincipal,
    ValidatedJson(req): ValidatedJson<CreateClientRequest>,
) -> Result<impl IntoResponse, AppError> {
    if !principal.is_superadmin() {
        return Err(AppError::Forbidden(anyhow::anyhow!("Superadmin required")));
    }

    let registered = state
        .oauth
        .register_client(
            &req.name,
            req.redirect_uris,
            req.allowed_scopes,
            req.confidential,
            req.organization_id,
        )
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(CreateClientResponse {
            client_id: registered.client.client_id,
            name: registered.client.name,
            redirect_uris: registered.client.redirect_uris,
            allowed_scopes: registered.client.allowed_scopes,
            is_confidential: registered.client.is_confidential,
            client_secret: registered.client_secret,
        }),
    ))
}
