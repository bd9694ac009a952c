use axum::{
    extract::{ConnectInfo, State},
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use service_core::{error::AppError, utils::sha256_hex};
use std::net::SocketAddr;

use super::oauth::request_binding;
use crate::dtos::auth::{LoginRequest, MeResponse, PrincipalKind, RegisterRequest, RegisterResponse};
use crate::dtos::ErrorResponse;
use crate::middleware::{rate_limit::enforce, AuthPrincipal, Principal};
use crate::models::normalize_email;
use crate::services::{oauth::token_response, LoginParams, RateLimitScope, TokenResponse};
use crate::utils::ValidatedJson;
use crate::AppState;

/// Register a new user
#[utoipa::path(
    post,
    path = "/auth/register",
    request_body = RegisterRequest,
    responses(
        (status = 201, description = "User registered", body = RegisterResponse),
        (status = 409, description = "Email already registered", body = ErrorResponse),
        (status = 422, description = "Validation error", body = ErrorResponse),
        (status = 429, description = "Too many requests", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
pub async fn register(
    State(state): State<AppState>,
    ValidatedJson(req): ValidatedJson<RegisterRequest>,
) -> Result<impl IntoResponse, AppError> {
    let user = state.auth.register(&req.email, &req.password).await?;

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            user_id: user.id,
            email: user.email,
        }),
    ))
}

/// Login with email and password
///
/// Opens a session in the requested organization. Limited per IP by the
/// route layer and per email here.
#[utoipa::path(
    post,
    path = "/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Login successful", body = TokenResponse),
        (status = 401, description = "Invalid credentials", body = ErrorResponse),
        (status = 422, description = "Validation error", body = ErrorResponse),
        (status = 429, description = "Too many requests", body = ErrorResponse)
    ),
    tag = "Authentication"
)]
pub async fn login(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    ValidatedJson(req): ValidatedJson<LoginRequest>,
) -> Result<impl IntoResponse, AppError> {
    let email_key = format!("email:{}", sha256_hex(&normalize_email(&req.email)));
    let decision = state.rate_limiter.check(RateLimitScope::Login, &email_key).await;
    enforce(decision, RateLimitScope::Login)?;

    let binding = request_binding(
        &headers,
        connect_info.as_ref(),
        &state.config.security.trusted_proxies,
    );
    let issued = state
        .auth
        .login(
            LoginParams {
                email: req.email,
                password: req.password,
                organization_id: req.organization_id,
                client_id: req.client_id,
                client_secret: req.client_secret,
            },
            &binding,
        )
        .await?;

    Ok((
        StatusCode::OK,
        [(header::CACHE_CONTROL, "no-store")],
        Json(token_response(issued)),
    ))
}

/// The authenticated caller
#[utoipa::path(
    get,
    path = "/auth/me",
    responses(
        (status = 200, description = "Resolved principal", body = MeResponse),
        (status = 401, description = "Not authenticated", body = ErrorResponse)
    ),
    tag = "Authentication",
    security(("bearer_auth" = []), ("api_key" = []))
)]
pub async fn me(AuthPrincipal(principal): AuthPrincipal) -> Json<MeResponse> {
    Json(me_response(&principal))
}

fn me_response(principal: &Principal) -> MeResponse {
    match principal {
        Principal::User(claims) => MeResponse {
            kind: PrincipalKind::AccessToken,
            user_id: Some(claims.user_id),
            organization_id: claims.organization_id,
            session_id: Some(claims.session_id),
            role_name: Some(claims.role_name.clone()),
            permissions: claims.permissions.clone(),
            is_superadmin: claims.is_superadmin,
        },
        Principal::ApiKey(key) => MeResponse {
            kind: PrincipalKind::ApiKey,
            user_id: None,
            organization_id: key.organization_id,
            session_id: None,
            role_name: None,
            permissions: key.scopes.clone(),
            is_superadmin: false,
        },
    }
}
