use axum::{
    body::Bytes,
    extract::{ConnectInfo, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Redirect, Response},
    Json,
};
use serde::de::DeserializeOwned;
use service_core::{error::AppError, middleware::rate_limit::client_ip};
use std::net::{IpAddr, SocketAddr};

use crate::dtos::oauth::{AuthorizeRequest, RevokeTokenRequest, TokenRequest};
use crate::dtos::ErrorResponse;
use crate::middleware::{
    rate_limit::{enforce, UNKNOWN_CLIENT},
    AuthPrincipal,
};
use crate::models::TokenBinding;
use crate::services::{oauth::GRANT_REFRESH_TOKEN, OAuthError, RateLimitScope, TokenResponse};
use crate::AppState;

/// Optional header carrying a stable client device identifier.
pub const DEVICE_ID_HEADER: &str = "x-device-id";

/// Fingerprint of the calling client, stored hashed on refresh tokens.
pub fn request_binding(
    headers: &HeaderMap,
    connect_info: Option<&ConnectInfo<SocketAddr>>,
    trusted_proxies: &[IpAddr],
) -> TokenBinding {
    let user_agent = headers.get(header::USER_AGENT).and_then(|v| v.to_str().ok());
    let device_id = headers.get(DEVICE_ID_HEADER).and_then(|v| v.to_str().ok());
    let ip = client_ip(headers, connect_info, trusted_proxies).map(|ip| ip.to_string());

    TokenBinding::from_raw(user_agent, ip.as_deref(), device_id)
}

/// Decode a form-encoded body, reporting failures as `invalid_request`.
fn parse_form<T: DeserializeOwned>(body: &Bytes) -> Result<T, OAuthError> {
    serde_urlencoded::from_bytes(body)
        .map_err(|_| OAuthError::invalid_request("Malformed form body"))
}

/// Authorization endpoint
///
/// The signed-in user approves the request for the organization of their
/// current session.
#[utoipa::path(
    get,
    path = "/oauth/authorize",
    params(AuthorizeRequest),
    responses(
        (status = 303, description = "Redirect to the client with a code or an error"),
        (status = 400, description = "Unregistered redirect URI"),
        (status = 401, description = "Unknown client")
    ),
    tag = "OAuth",
    security(("bearer_auth" = []))
)]
pub async fn authorize(
    State(state): State<AppState>,
    AuthPrincipal(principal): AuthPrincipal,
    Query(req): Query<AuthorizeRequest>,
) -> Result<Response, AppError> {
    let claims = principal.claims()?;

    match state
        .oauth
        .authorize(&req, claims.user_id, claims.organization_id)
        .await
    {
        Ok(location) => Ok(Redirect::to(&location).into_response()),
        Err(e) => Ok(e.into_response()),
    }
}

/// Token endpoint
#[utoipa::path(
    post,
    path = "/oauth/token",
    request_body(content = TokenRequest, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 200, description = "Tokens issued", body = TokenResponse),
        (status = 400, description = "OAuth error"),
        (status = 401, description = "Client authentication failed"),
        (status = 429, description = "Too many requests", body = ErrorResponse)
    ),
    tag = "OAuth"
)]
pub async fn token(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let req: TokenRequest = match parse_form(&body) {
        Ok(req) => req,
        Err(e) => return e.into_response(),
    };

    if req.grant_type == GRANT_REFRESH_TOKEN {
        let key = req.client_id.as_deref().unwrap_or(UNKNOWN_CLIENT);
        let decision = state.rate_limiter.check(RateLimitScope::TokenRefresh, key).await;
        if let Err(e) = enforce(decision, RateLimitScope::TokenRefresh) {
            tracing::warn!(client_id = %key, "Refresh grant rate limited");
            return e.into_response();
        }
    }

    let binding = request_binding(
        &headers,
        connect_info.as_ref(),
        &state.config.security.trusted_proxies,
    );
    match state.oauth.token(&req, &binding).await {
        Ok(tokens) => (
            StatusCode::OK,
            [(header::CACHE_CONTROL, "no-store"), (header::PRAGMA, "no-cache")],
            Json(tokens),
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}

/// Revoke an access or refresh token
///
/// Succeeds for unknown and expired tokens; the response never reveals
/// whether a token was valid.
#[utoipa::path(
    post,
    path = "/oauth/revoke",
    request_body(content = RevokeTokenRequest, content_type = "application/x-www-form-urlencoded"),
    responses(
        (status = 200, description = "Token revoked or already unusable"),
        (status = 401, description = "Not authenticated", body = ErrorResponse),
        (status = 403, description = "Not allowed to revoke this token", body = ErrorResponse)
    ),
    tag = "OAuth",
    security(("bearer_auth" = []))
)]
pub async fn revoke(
    State(state): State<AppState>,
    AuthPrincipal(principal): AuthPrincipal,
    body: Bytes,
) -> Result<Response, AppError> {
    let req: RevokeTokenRequest = match parse_form(&body) {
        Ok(req) => req,
        Err(e) => return Ok(e.into_response()),
    };
    if req.token.is_empty() {
        return Ok(OAuthError::invalid_request("token is required").into_response());
    }

    let caller = principal.claims()?;
    let revoked = state.revocation.revoke_token(&req.token, caller).await?;
    tracing::debug!(revoked, hint = ?req.token_type_hint, "Revocation request handled");

    Ok(StatusCode::OK.into_response())
}
