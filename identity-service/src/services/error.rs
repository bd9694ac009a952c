//! Mapping of service errors onto HTTP responses.

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use service_core::error::AppError;

use super::api_key::ApiKeyError;
use super::auth::AuthError;
use super::oauth::{OAuthError, OAuthErrorCode};
use super::rbac::RbacError;
use super::revocation::RevocationError;
use super::rotation::RotationError;
use crate::repository::StoreError;

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Timeout(_) => AppError::ServiceUnavailable(err.to_string()),
            StoreError::Conflict(msg) => AppError::Conflict(anyhow::anyhow!(msg)),
            StoreError::Backend(e) => AppError::DatabaseError(e),
        }
    }
}

impl From<RbacError> for AppError {
    fn from(err: RbacError) -> Self {
        match err {
            RbacError::Store(e) => e.into(),
            RbacError::UserNotFound
            | RbacError::OrganizationNotFound
            | RbacError::RoleNotFound
            | RbacError::PermissionNotFound(_) => AppError::NotFound(anyhow::anyhow!(err.to_string())),
            RbacError::NotAMember | RbacError::MembershipInactive | RbacError::OrganizationSuspended => {
                AppError::Forbidden(anyhow::anyhow!(err.to_string()))
            }
            RbacError::AlreadyMember | RbacError::DuplicateName(_) | RbacError::LastAdmin => {
                AppError::Conflict(anyhow::anyhow!(err.to_string()))
            }
            RbacError::RoleNotUsableInOrganization
            | RbacError::CrossOrganizationPermission { .. }
            | RbacError::InvalidName(_) => AppError::BadRequest(anyhow::anyhow!(err.to_string())),
        }
    }
}

impl From<RotationError> for AppError {
    fn from(err: RotationError) -> Self {
        match err {
            RotationError::Store(e) => e.into(),
            RotationError::Rbac(e) => e.into(),
            RotationError::Token(e) => AppError::InternalError(anyhow::anyhow!(e.to_string())),
            _ => AppError::Unauthorized(anyhow::anyhow!("Invalid or expired session")),
        }
    }
}

impl From<RevocationError> for AppError {
    fn from(err: RevocationError) -> Self {
        match err {
            RevocationError::Forbidden => AppError::Forbidden(anyhow::anyhow!(err.to_string())),
            RevocationError::Token(_) => AppError::Unauthorized(anyhow::anyhow!("Invalid or expired token")),
            RevocationError::Rotation(e) => e.into(),
            RevocationError::Store(e) => e.into(),
        }
    }
}

impl From<ApiKeyError> for AppError {
    fn from(err: ApiKeyError) -> Self {
        match err {
            ApiKeyError::Invalid | ApiKeyError::Expired | ApiKeyError::Revoked => {
                AppError::Unauthorized(anyhow::anyhow!("Invalid API key"))
            }
            ApiKeyError::NotFound => AppError::NotFound(anyhow::anyhow!(err.to_string())),
            ApiKeyError::InvalidName => AppError::BadRequest(anyhow::anyhow!(err.to_string())),
            ApiKeyError::Store(e) => e.into(),
        }
    }
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Client(e)
                if matches!(
                    e.error,
                    OAuthErrorCode::TemporarilyUnavailable | OAuthErrorCode::ServerError
                ) =>
            {
                e.into()
            }
            AuthError::InvalidCredentials | AuthError::Client(_) => {
                AppError::Unauthorized(anyhow::anyhow!("Invalid credentials"))
            }
            AuthError::EmailAlreadyRegistered => AppError::Conflict(anyhow::anyhow!(err.to_string())),
            AuthError::Store(e) => e.into(),
            AuthError::Internal(e) => AppError::InternalError(e),
        }
    }
}

impl From<OAuthError> for AppError {
    fn from(err: OAuthError) -> Self {
        match err.error {
            OAuthErrorCode::InvalidClient => AppError::Unauthorized(anyhow::anyhow!(err.error_description)),
            OAuthErrorCode::AccessDenied => AppError::Forbidden(anyhow::anyhow!(err.error_description)),
            OAuthErrorCode::TemporarilyUnavailable => AppError::ServiceUnavailable(err.error_description),
            OAuthErrorCode::ServerError => AppError::InternalError(anyhow::anyhow!(err.error_description)),
            _ => AppError::BadRequest(anyhow::anyhow!(err.error_description)),
        }
    }
}

impl OAuthError {
    pub fn status_code(&self) -> StatusCode {
        match self.error {
            OAuthErrorCode::InvalidClient => StatusCode::UNAUTHORIZED,
            OAuthErrorCode::ServerError => StatusCode::INTERNAL_SERVER_ERROR,
            OAuthErrorCode::TemporarilyUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for OAuthError {
    fn into_response(self) -> Response {
        (
            self.status_code(),
            [(header::CACHE_CONTROL, "no-store"), (header::PRAGMA, "no-cache")],
            Json(self),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_store_timeout_is_unavailable() {
        let response = AppError::from(StoreError::Timeout(Duration::from_millis(5))).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_oauth_error_response() {
        let response = OAuthError::invalid_client().into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers().get(header::CACHE_CONTROL).unwrap(), "no-store");

        let response = OAuthError::invalid_grant().into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_oauth_error_as_app_error() {
        let response = AppError::from(OAuthError::invalid_request("bad redirect")).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let timeout = OAuthError::from(StoreError::Timeout(Duration::from_millis(5)));
        let response = AppError::from(timeout).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn test_rbac_mapping() {
        let response = AppError::from(RbacError::CrossOrganizationPermission {
            permission_id: uuid::Uuid::new_v4(),
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            AppError::from(RbacError::LastAdmin).into_response().status(),
            StatusCode::CONFLICT
        );
    }
}
