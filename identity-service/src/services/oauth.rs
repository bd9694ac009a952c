//! OAuth 2.1 authorization-code flow with mandatory PKCE, plus the refresh grant.
//!
//! Errors returned to clients carry a generic description and never reveal
//! which check failed.

use serde::Serialize;
use service_core::utils::random_token;
use std::{fmt, future::Future, sync::Arc};
use thiserror::Error;
use url::Url;
use uuid::Uuid;

use super::authorization_code::{AuthorizationCodeService, CodeError};
use super::jwt::{TokenError, TokenResponse};
use super::pkce::{self, METHOD_S256};
use super::rbac::{RbacError, RbacService};
use super::rotation::{GrantRequest, IssuedTokens, RotationError, RotationService};
use crate::dtos::oauth::{AuthorizeRequest, TokenRequest};
use crate::models::{normalize_scope, ClientApp, NewAuthorizationCode, TokenBinding};
use crate::repository::{with_timeout, ClientAppRepository, StoreError, StoreResult};
use crate::utils::{hash_blocking, verify_blocking, Secret, SecretHash};

pub const GRANT_AUTHORIZATION_CODE: &str = "authorization_code";
pub const GRANT_REFRESH_TOKEN: &str = "refresh_token";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OAuthErrorCode {
    InvalidRequest,
    InvalidClient,
    InvalidGrant,
    UnauthorizedClient,
    UnsupportedGrantType,
    UnsupportedResponseType,
    InvalidScope,
    AccessDenied,
    ServerError,
    TemporarilyUnavailable,
}

impl OAuthErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            OAuthErrorCode::InvalidRequest => "invalid_request",
            OAuthErrorCode::InvalidClient => "invalid_client",
            OAuthErrorCode::InvalidGrant => "invalid_grant",
            OAuthErrorCode::UnauthorizedClient => "unauthorized_client",
            OAuthErrorCode::UnsupportedGrantType => "unsupported_grant_type",
            OAuthErrorCode::UnsupportedResponseType => "unsupported_response_type",
            OAuthErrorCode::InvalidScope => "invalid_scope",
            OAuthErrorCode::AccessDenied => "access_denied",
            OAuthErrorCode::ServerError => "server_error",
            OAuthErrorCode::TemporarilyUnavailable => "temporarily_unavailable",
        }
    }
}

impl fmt::Display for OAuthErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// RFC 6749 §5.2 error body.
#[derive(Debug, Clone, Error, Serialize, PartialEq, Eq)]
#[error("{error}: {error_description}")]
pub struct OAuthError {
    pub error: OAuthErrorCode,
    pub error_description: String,
}

impl OAuthError {
    pub fn new(error: OAuthErrorCode, description: impl Into<String>) -> Self {
        Self {
            error,
            error_description: description.into(),
        }
    }

    pub fn invalid_request(description: impl Into<String>) -> Self {
        Self::new(OAuthErrorCode::InvalidRequest, description)
    }

    pub fn invalid_client() -> Self {
        Self::new(OAuthErrorCode::InvalidClient, "Client authentication failed")
    }

    pub fn invalid_grant() -> Self {
        Self::new(
            OAuthErrorCode::InvalidGrant,
            "The provided authorization grant is invalid, expired, or revoked",
        )
    }

    pub fn invalid_scope() -> Self {
        Self::new(OAuthErrorCode::InvalidScope, "The requested scope is not allowed")
    }

    pub fn access_denied() -> Self {
        Self::new(OAuthErrorCode::AccessDenied, "The resource owner denied the request")
    }

    pub fn server_error() -> Self {
        Self::new(OAuthErrorCode::ServerError, "The server encountered an unexpected error")
    }
}

impl From<StoreError> for OAuthError {
    fn from(err: StoreError) -> Self {
        if err.is_retryable() {
            tracing::warn!(error = %err, "Store timeout during OAuth request");
            OAuthError::new(
                OAuthErrorCode::TemporarilyUnavailable,
                "The service is temporarily unavailable, retry later",
            )
        } else {
            tracing::error!(error = %err, "Store failure during OAuth request");
            OAuthError::server_error()
        }
    }
}

impl From<CodeError> for OAuthError {
    fn from(err: CodeError) -> Self {
        match err {
            CodeError::Store(e) => e.into(),
            other => {
                tracing::info!(reason = %other, "Authorization code rejected");
                OAuthError::invalid_grant()
            }
        }
    }
}

impl From<RbacError> for OAuthError {
    fn from(err: RbacError) -> Self {
        match err {
            RbacError::Store(e) => e.into(),
            other => {
                tracing::info!(reason = %other, "Grant refused by access control");
                OAuthError::invalid_grant()
            }
        }
    }
}

impl From<TokenError> for OAuthError {
    fn from(err: TokenError) -> Self {
        tracing::error!(error = %err, "Failed to mint access token");
        OAuthError::server_error()
    }
}

impl From<RotationError> for OAuthError {
    fn from(err: RotationError) -> Self {
        match err {
            RotationError::Store(e) => e.into(),
            RotationError::Rbac(e) => e.into(),
            RotationError::Token(e) => e.into(),
            other => {
                tracing::info!(reason = %other, "Refresh grant rejected");
                OAuthError::invalid_grant()
            }
        }
    }
}

/// A registered client together with its one-time plaintext secret.
#[derive(Debug, Clone)]
pub struct RegisteredClient {
    pub client: ClientApp,
    pub client_secret: Option<String>,
}

#[derive(Clone)]
pub struct OAuthService {
    clients: Arc<dyn ClientAppRepository>,
    codes: AuthorizationCodeService,
    rotation: RotationService,
    rbac: RbacService,
    timeout: std::time::Duration,
}

impl OAuthService {
    pub fn new(
        clients: Arc<dyn ClientAppRepository>,
        codes: AuthorizationCodeService,
        rotation: RotationService,
        rbac: RbacService,
        timeout: std::time::Duration,
    ) -> Self {
        Self {
            clients,
            codes,
            rotation,
            rbac,
            timeout,
        }
    }

    async fn timed<T, F>(&self, fut: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        with_timeout(self.timeout, fut).await
    }

    pub async fn register_client(
        &self,
        name: &str,
        redirect_uris: Vec<String>,
        allowed_scopes: Vec<String>,
        confidential: bool,
        organization_id: Option<Uuid>,
    ) -> Result<RegisteredClient, OAuthError> {
        for uri in &redirect_uris {
            let parsed = Url::parse(uri)
                .map_err(|_| OAuthError::invalid_request("Redirect URIs must be absolute URLs"))?;
            if parsed.fragment().is_some() {
                return Err(OAuthError::invalid_request(
                    "Redirect URIs must not contain a fragment",
                ));
            }
        }

        let client_id = random_token(16);
        let (client, client_secret) = if confidential {
            let secret = random_token(32);
            let hash = hash_blocking(Secret::new(secret.as_str())).await.map_err(|e| {
                tracing::error!(error = %e, "Failed to hash client secret");
                OAuthError::server_error()
            })?;
            let client = ClientApp::new_confidential(
                client_id,
                hash.into_string(),
                name.to_string(),
                redirect_uris,
                allowed_scopes,
            );
            (client, Some(secret))
        } else {
            let client =
                ClientApp::new_public(client_id, name.to_string(), redirect_uris, allowed_scopes);
            (client, None)
        };
        let client = ClientApp {
            organization_id,
            ..client
        };

        self.timed(self.clients.insert(&client)).await?;

        tracing::info!(
            client_id = %client.client_id,
            confidential = client.is_confidential,
            "OAuth client registered"
        );

        Ok(RegisteredClient {
            client,
            client_secret,
        })
    }

    /// Confidential clients must present their secret; public clients must not.
    pub async fn authenticate_client(
        &self,
        client_id: &str,
        client_secret: Option<&str>,
    ) -> Result<ClientApp, OAuthError> {
        let client = self
            .timed(self.clients.find_by_client_id(client_id))
            .await?
            .ok_or_else(OAuthError::invalid_client)?;

        match (&client.client_secret_hash, client_secret) {
            (Some(hash), Some(secret)) if client.is_confidential => {
                let matches = verify_blocking(Secret::new(secret), SecretHash::new(hash.as_str()))
                    .await
                    .map_err(|_| OAuthError::server_error())?;
                if !matches {
                    tracing::warn!(client_id = %client_id, "Client secret mismatch");
                    return Err(OAuthError::invalid_client());
                }
            }
            (_, None) if !client.is_confidential => {}
            _ => {
                tracing::warn!(client_id = %client_id, "Client presented unexpected credentials");
                return Err(OAuthError::invalid_client());
            }
        }

        Ok(client)
    }

    /// Handle an authorization request for an authenticated user.
    ///
    /// Returns the redirect location. Unknown clients and unregistered
    /// redirect URIs are errors and never redirect.
    pub async fn authorize(
        &self,
        request: &AuthorizeRequest,
        user_id: Uuid,
        organization_id: Uuid,
    ) -> Result<String, OAuthError> {
        let client = self
            .timed(self.clients.find_by_client_id(&request.client_id))
            .await?
            .ok_or_else(OAuthError::invalid_client)?;

        if !client.has_redirect_uri(&request.redirect_uri) {
            return Err(OAuthError::invalid_request(
                "The redirect URI is not registered for this client",
            ));
        }

        let mut location = Url::parse(&request.redirect_uri)
            .map_err(|_| OAuthError::invalid_request("Invalid redirect URI"))?;

        match self
            .issue_code(request, &client, user_id, organization_id)
            .await
        {
            Ok(code) => {
                location.query_pairs_mut().append_pair("code", &code);
            }
            Err(e) => {
                tracing::info!(
                    client_id = %client.client_id,
                    user_id = %user_id,
                    error = %e.error,
                    "Authorization request refused"
                );
                location
                    .query_pairs_mut()
                    .append_pair("error", e.error.as_str());
            }
        }

        if let Some(state) = &request.state {
            location.query_pairs_mut().append_pair("state", state);
        }

        Ok(location.to_string())
    }

    async fn issue_code(
        &self,
        request: &AuthorizeRequest,
        client: &ClientApp,
        user_id: Uuid,
        organization_id: Uuid,
    ) -> Result<String, OAuthError> {
        if request.response_type != "code" {
            return Err(OAuthError::new(
                OAuthErrorCode::UnsupportedResponseType,
                "Only the code response type is supported",
            ));
        }

        let challenge = request
            .code_challenge
            .as_deref()
            .filter(|c| pkce::is_well_formed_challenge(c))
            .ok_or_else(|| OAuthError::invalid_request("A valid code_challenge is required"))?;

        if request.code_challenge_method.as_deref() != Some(METHOD_S256) {
            return Err(OAuthError::invalid_request(
                "code_challenge_method must be S256",
            ));
        }

        let scope = normalize_scope(request.scope.as_deref().unwrap_or_default());
        if !client.allows_scope(&scope) {
            return Err(OAuthError::invalid_scope());
        }

        match self
            .rbac
            .resolve_effective_permissions(user_id, organization_id)
            .await
        {
            Ok(_) => {}
            Err(RbacError::Store(e)) => return Err(e.into()),
            Err(_) => return Err(OAuthError::access_denied()),
        }

        let code = self
            .codes
            .issue(NewAuthorizationCode {
                client_id: client.client_id.clone(),
                user_id,
                organization_id,
                redirect_uri: request.redirect_uri.clone(),
                scope,
                code_challenge: challenge.to_string(),
                code_challenge_method: METHOD_S256.to_string(),
            })
            .await?;

        Ok(code)
    }

    /// Token endpoint: dispatch on `grant_type`.
    pub async fn token(
        &self,
        request: &TokenRequest,
        binding: &TokenBinding,
    ) -> Result<TokenResponse, OAuthError> {
        let client_id = required(request.client_id.as_deref(), "client_id")?;

        let issued = match request.grant_type.as_str() {
            GRANT_AUTHORIZATION_CODE => {
                let code = required(request.code.as_deref(), "code")?;
                let redirect_uri = required(request.redirect_uri.as_deref(), "redirect_uri")?;
                let verifier = required(request.code_verifier.as_deref(), "code_verifier")?;

                let client = self
                    .authenticate_client(client_id, request.client_secret.as_deref())
                    .await?;
                self.exchange_code(&client, code, redirect_uri, verifier, binding)
                    .await?
            }
            GRANT_REFRESH_TOKEN => {
                let refresh_token = required(request.refresh_token.as_deref(), "refresh_token")?;

                let client = self
                    .authenticate_client(client_id, request.client_secret.as_deref())
                    .await?;
                self.rotation
                    .rotate(refresh_token, Some(&client.client_id), binding)
                    .await?
            }
            _ => {
                return Err(OAuthError::new(
                    OAuthErrorCode::UnsupportedGrantType,
                    "The grant type is not supported",
                ))
            }
        };

        Ok(token_response(issued))
    }

    async fn exchange_code(
        &self,
        client: &ClientApp,
        code: &str,
        redirect_uri: &str,
        verifier: &str,
        binding: &TokenBinding,
    ) -> Result<IssuedTokens, OAuthError> {
        let redeemed = self
            .codes
            .redeem(code, &client.client_id, redirect_uri, verifier)
            .await?;

        let issued = self
            .rotation
            .start_session(GrantRequest {
                client_id: redeemed.client_id,
                user_id: redeemed.user_id,
                organization_id: redeemed.organization_id,
                scope: redeemed.scope,
                binding: binding.clone(),
                family_id: Some(redeemed.family_id),
            })
            .await?;

        tracing::info!(
            client_id = %client.client_id,
            user_id = %redeemed.user_id,
            family_id = %issued.family_id,
            "Authorization code exchanged"
        );

        Ok(issued)
    }
}

pub fn token_response(issued: IssuedTokens) -> TokenResponse {
    TokenResponse {
        access_token: issued.access_token,
        refresh_token: issued.refresh_token,
        token_type: "Bearer".to_string(),
        expires_in: issued.expires_in,
        scope: issued.claims.scope,
    }
}

fn required<'a>(value: Option<&'a str>, name: &str) -> Result<&'a str, OAuthError> {
    value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| OAuthError::invalid_request(format!("Missing {}", name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::User;
    use crate::repository::{MemoryStore, Repositories, UserRepository};
    use crate::services::audit::MemoryAuditSink;
    use crate::services::jwt::JwtService;
    use chrono::Duration;

    struct Fixture {
        oauth: OAuthService,
        client: ClientApp,
        user_id: Uuid,
        org_id: Uuid,
    }

    const REDIRECT: &str = "https://app.example.com/callback";

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let audit = Arc::new(MemoryAuditSink::new());
        let timeout = std::time::Duration::from_secs(1);
        let rbac = RbacService::new(Repositories::from_store(store.clone()), audit.clone(), timeout);
        rbac.ensure_system_catalog().await.unwrap();

        let user = User::new("dana@example.com".to_string(), None);
        UserRepository::insert(store.as_ref(), &user).await.unwrap();
        let org = rbac.create_organization(user.id, "Initech", "initech").await.unwrap();

        let rotation = RotationService::new(
            store.clone(),
            rbac.clone(),
            JwtService::with_hmac_secret(b"oauth-test-secret-oauth-test-secret", "identity-test", 15),
            audit.clone(),
            Duration::days(7),
            timeout,
        );
        let codes = AuthorizationCodeService::new(
            store.clone(),
            store.clone(),
            audit,
            Duration::seconds(60),
            timeout,
        );
        let oauth = OAuthService::new(store.clone(), codes, rotation, rbac, timeout);
        let client = ClientApp::new_public(
            "spa".to_string(),
            "SPA".to_string(),
            vec![REDIRECT.to_string()],
            vec!["openid".to_string(), "profile".to_string()],
        );
        ClientAppRepository::insert(store.as_ref(), &client).await.unwrap();

        Fixture {
            oauth,
            client,
            user_id: user.id,
            org_id: org.id,
        }
    }

    fn authorize_request(challenge: &str) -> AuthorizeRequest {
        AuthorizeRequest {
            response_type: "code".to_string(),
            client_id: "spa".to_string(),
            redirect_uri: REDIRECT.to_string(),
            scope: Some("openid".to_string()),
            code_challenge: Some(challenge.to_string()),
            code_challenge_method: Some("S256".to_string()),
            state: Some("xyz".to_string()),
        }
    }

    fn query_value(location: &str, key: &str) -> Option<String> {
        Url::parse(location)
            .unwrap()
            .query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }

    #[tokio::test]
    async fn test_authorize_then_exchange() {
        let f = fixture().await;
        let verifier = pkce::generate_verifier();
        let challenge = pkce::challenge(&verifier).unwrap();

        let location = f
            .oauth
            .authorize(&authorize_request(&challenge), f.user_id, f.org_id)
            .await
            .unwrap();
        assert!(location.starts_with(REDIRECT));
        assert_eq!(query_value(&location, "state").as_deref(), Some("xyz"));
        let code = query_value(&location, "code").unwrap();

        let response = f
            .oauth
            .token(
                &TokenRequest {
                    grant_type: GRANT_AUTHORIZATION_CODE.to_string(),
                    code: Some(code),
                    redirect_uri: Some(REDIRECT.to_string()),
                    code_verifier: Some(verifier),
                    client_id: Some(f.client.client_id.clone()),
                    ..TokenRequest::default()
                },
                &TokenBinding::default(),
            )
            .await
            .unwrap();
        assert_eq!(response.token_type, "Bearer");
        assert_eq!(response.scope.as_deref(), Some("openid"));
    }

    #[tokio::test]
    async fn test_authorize_errors_redirect_with_state() {
        let f = fixture().await;
        let challenge = pkce::challenge(&pkce::generate_verifier()).unwrap();

        let mut plain = authorize_request(&challenge);
        plain.code_challenge_method = Some("plain".to_string());
        let location = f.oauth.authorize(&plain, f.user_id, f.org_id).await.unwrap();
        assert_eq!(query_value(&location, "error").as_deref(), Some("invalid_request"));
        assert_eq!(query_value(&location, "state").as_deref(), Some("xyz"));
        assert!(query_value(&location, "code").is_none());

        let mut wide = authorize_request(&challenge);
        wide.scope = Some("openid admin".to_string());
        let location = f.oauth.authorize(&wide, f.user_id, f.org_id).await.unwrap();
        assert_eq!(query_value(&location, "error").as_deref(), Some("invalid_scope"));

        let location = f
            .oauth
            .authorize(&authorize_request(&challenge), f.user_id, Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(query_value(&location, "error").as_deref(), Some("access_denied"));
    }

    #[tokio::test]
    async fn test_unregistered_redirect_never_redirects() {
        let f = fixture().await;
        let challenge = pkce::challenge(&pkce::generate_verifier()).unwrap();
        let mut request = authorize_request(&challenge);
        request.redirect_uri = "https://evil.example.com/callback".to_string();

        let err = f.oauth.authorize(&request, f.user_id, f.org_id).await.unwrap_err();
        assert_eq!(err.error, OAuthErrorCode::InvalidRequest);
    }

    #[tokio::test]
    async fn test_token_request_validation() {
        let f = fixture().await;
        let binding = TokenBinding::default();

        let err = f
            .oauth
            .token(
                &TokenRequest {
                    grant_type: "password".to_string(),
                    client_id: Some("spa".to_string()),
                    ..TokenRequest::default()
                },
                &binding,
            )
            .await
            .unwrap_err();
        assert_eq!(err.error, OAuthErrorCode::UnsupportedGrantType);

        let err = f
            .oauth
            .token(
                &TokenRequest {
                    grant_type: GRANT_REFRESH_TOKEN.to_string(),
                    client_id: Some("spa".to_string()),
                    ..TokenRequest::default()
                },
                &binding,
            )
            .await
            .unwrap_err();
        assert_eq!(err.error, OAuthErrorCode::InvalidRequest);

        let err = f
            .oauth
            .token(
                &TokenRequest {
                    grant_type: GRANT_REFRESH_TOKEN.to_string(),
                    client_id: Some("unknown".to_string()),
                    refresh_token: Some("x".to_string()),
                    ..TokenRequest::default()
                },
                &binding,
            )
            .await
            .unwrap_err();
        assert_eq!(err.error, OAuthErrorCode::InvalidClient);

        let err = f
            .oauth
            .token(
                &TokenRequest {
                    grant_type: GRANT_REFRESH_TOKEN.to_string(),
                    client_id: Some("spa".to_string()),
                    refresh_token: Some("not-a-token".to_string()),
                    ..TokenRequest::default()
                },
                &binding,
            )
            .await
            .unwrap_err();
        assert_eq!(err, OAuthError::invalid_grant());
    }

    #[tokio::test]
    async fn test_confidential_client_authentication() {
        let f = fixture().await;
        let registered = f
            .oauth
            .register_client(
                "Backend",
                vec!["https://backend.example.com/cb".to_string()],
                vec![],
                true,
                None,
            )
            .await
            .unwrap();
        let secret = registered.client_secret.clone().unwrap();
        let client_id = registered.client.client_id.clone();

        assert!(f.oauth.authenticate_client(&client_id, Some(&secret)).await.is_ok());
        assert!(f.oauth.authenticate_client(&client_id, Some("wrong")).await.is_err());
        assert!(f.oauth.authenticate_client(&client_id, None).await.is_err());
        // Public clients must not present a secret
        assert!(f.oauth.authenticate_client("spa", Some("anything")).await.is_err());
        assert!(f.oauth.authenticate_client("spa", None).await.is_ok());
    }

    #[tokio::test]
    async fn test_register_client_rejects_fragment_uri() {
        let f = fixture().await;
        let err = f
            .oauth
            .register_client("Bad", vec!["https://a.example.com/cb#frag".to_string()], vec![], false, None)
            .await
            .unwrap_err();
        assert_eq!(err.error, OAuthErrorCode::InvalidRequest);
    }
}
