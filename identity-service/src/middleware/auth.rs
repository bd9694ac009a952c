use axum::{
    async_trait,
    extract::{FromRequestParts, Request, State},
    http::{header, request::Parts},
    middleware::Next,
    response::Response,
};
use service_core::error::AppError;
use uuid::Uuid;

use crate::models::ApiKey;
use crate::services::{
    AccessTokenClaims, ApiKeyError, RateLimitDecision, RateLimitScope, RevocationError,
};
use crate::AppState;

pub const API_KEY_HEADER: &str = "x-api-key";

/// The authenticated caller of a request.
#[derive(Debug, Clone)]
pub enum Principal {
    User(AccessTokenClaims),
    ApiKey(ApiKey),
}

impl Principal {
    /// Organization context, taken from the credential and never from the request.
    pub fn organization_id(&self) -> Uuid {
        match self {
            Principal::User(claims) => claims.organization_id,
            Principal::ApiKey(key) => key.organization_id,
        }
    }

    pub fn user_id(&self) -> Option<Uuid> {
        match self {
            Principal::User(claims) => Some(claims.user_id),
            Principal::ApiKey(_) => None,
        }
    }

    pub fn is_superadmin(&self) -> bool {
        matches!(self, Principal::User(claims) if claims.is_superadmin)
    }

    pub fn has_permission(&self, permission: &str) -> bool {
        match self {
            Principal::User(claims) => claims.has_permission(permission),
            Principal::ApiKey(key) => key.scopes.iter().any(|s| s == permission),
        }
    }

    /// Require `permission` within `org_id`. Superadmins pass everywhere.
    pub fn require(&self, org_id: Uuid, permission: &str) -> Result<(), AppError> {
        if self.is_superadmin() || (self.organization_id() == org_id && self.has_permission(permission)) {
            return Ok(());
        }
        tracing::warn!(
            organization_id = %org_id,
            caller_organization_id = %self.organization_id(),
            permission,
            "Permission denied"
        );
        Err(AppError::Forbidden(anyhow::anyhow!("Insufficient permissions")))
    }

    /// Session-bound user claims; API keys cannot act as users.
    pub fn claims(&self) -> Result<&AccessTokenClaims, AppError> {
        match self {
            Principal::User(claims) => Ok(claims),
            Principal::ApiKey(_) => Err(AppError::Forbidden(anyhow::anyhow!(
                "This operation requires a user session"
            ))),
        }
    }
}

/// Authenticate a bearer access token or an API key.
pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, AppError> {
    let api_key = req
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let principal = match api_key {
        Some(presented) => authenticate_api_key(&state, &presented).await?,
        None => {
            let token = req
                .headers()
                .get(header::AUTHORIZATION)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.strip_prefix("Bearer "))
                .ok_or_else(|| {
                    AppError::Unauthorized(anyhow::anyhow!("Missing or invalid Authorization header"))
                })?;

            let claims = state.revocation.validate(token).await.map_err(|e| match e {
                RevocationError::Token(reason) => {
                    tracing::debug!(reason = %reason, "Rejected access token");
                    AppError::Unauthorized(anyhow::anyhow!("Invalid or expired token"))
                }
                other => other.into(),
            })?;
            Principal::User(claims)
        }
    };

    // Store the principal in request extensions so handlers can access it
    req.extensions_mut().insert(principal);

    Ok(next.run(req).await)
}

async fn authenticate_api_key(state: &AppState, presented: &str) -> Result<Principal, AppError> {
    let key = state.api_keys.validate(presented).await.map_err(|e| match e {
        ApiKeyError::Store(e) => AppError::from(e),
        other => {
            tracing::debug!(reason = %other, "Rejected API key");
            AppError::Unauthorized(anyhow::anyhow!("Invalid API key"))
        }
    })?;

    if let RateLimitDecision::Blocked { retry_after } = state
        .rate_limiter
        .check(RateLimitScope::ApiCalls, &key.key_id)
        .await
    {
        return Err(AppError::TooManyRequests(
            "API key request limit exceeded".to_string(),
            Some(retry_after),
        ));
    }

    Ok(Principal::ApiKey(key))
}

/// Extractor for the principal stored by [`auth_middleware`].
pub struct AuthPrincipal(pub Principal);

#[async_trait]
impl<S> FromRequestParts<S> for AuthPrincipal
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let principal = parts.extensions.get::<Principal>().ok_or_else(|| {
            AppError::InternalError(anyhow::anyhow!("Principal missing from request extensions"))
        })?;

        Ok(AuthPrincipal(principal.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn claims(org: Uuid, permissions: &[&str], superadmin: bool) -> AccessTokenClaims {
        let user_id = Uuid::new_v4();
        AccessTokenClaims {
            sub: user_id.to_string(),
            user_id,
            organization_id: org,
            session_id: Uuid::new_v4(),
            role_id: None,
            role_name: "member".to_string(),
            permissions: permissions.iter().map(|p| p.to_string()).collect(),
            is_superadmin: superadmin,
            client_id: None,
            scope: None,
            jti: Uuid::new_v4().to_string(),
            iss: "identity-test".to_string(),
            exp: Utc::now().timestamp() + 60,
            iat: Utc::now().timestamp(),
            iat_micros: Utc::now().timestamp_micros(),
        }
    }

    #[test]
    fn test_permission_is_checked_against_own_organization() {
        let org_a = Uuid::new_v4();
        let org_b = Uuid::new_v4();
        let principal = Principal::User(claims(org_a, &["roles:manage"], false));

        assert!(principal.require(org_a, "roles:manage").is_ok());
        assert!(principal.require(org_b, "roles:manage").is_err());
        assert!(principal.require(org_a, "members:manage").is_err());
    }

    #[test]
    fn test_superadmin_passes_everywhere() {
        let principal = Principal::User(claims(Uuid::new_v4(), &[], true));
        assert!(principal.require(Uuid::new_v4(), "roles:manage").is_ok());
    }

    #[test]
    fn test_api_key_scopes() {
        let org = Uuid::new_v4();
        let principal = Principal::ApiKey(ApiKey {
            id: Uuid::new_v4(),
            key_id: "abc".to_string(),
            organization_id: org,
            created_by: Uuid::new_v4(),
            name: "ci".to_string(),
            hashed_secret: String::new(),
            scopes: vec!["users:read".to_string()],
            expires_at: None,
            revoked: false,
            last_used_at: None,
            created_at: Utc::now(),
        });

        assert!(principal.require(org, "users:read").is_ok());
        assert!(principal.require(org, "roles:manage").is_err());
        assert!(principal.claims().is_err());
        assert_eq!(principal.user_id(), None);
    }
}
