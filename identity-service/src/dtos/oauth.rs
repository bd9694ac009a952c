use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;
use validator::Validate;

/// Query of the authorization endpoint.
#[derive(Debug, Clone, Deserialize, IntoParams, ToSchema)]
pub struct AuthorizeRequest {
    #[param(example = "code")]
    pub response_type: String,
    #[param(example = "spa-client")]
    pub client_id: String,
    #[param(example = "https://app.example.com/callback")]
    pub redirect_uri: String,
    pub scope: Option<String>,
    pub code_challenge: Option<String>,
    #[param(example = "S256")]
    pub code_challenge_method: Option<String>,
    pub state: Option<String>,
}

/// Form body of the token endpoint. Which fields are required depends on `grant_type`.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct TokenRequest {
    #[schema(example = "authorization_code")]
    pub grant_type: String,
    pub code: Option<String>,
    pub redirect_uri: Option<String>,
    pub code_verifier: Option<String>,
    pub refresh_token: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct CreateClientRequest {
    #[validate(length(min = 1, max = 100, message = "Name must be 1-100 characters"))]
    #[schema(example = "Dashboard")]
    pub name: String,

    #[validate(length(min = 1, message = "At least one redirect URI is required"))]
    pub redirect_uris: Vec<String>,

    #[serde(default)]
    pub allowed_scopes: Vec<String>,

    /// Confidential clients get a secret; public clients rely on PKCE alone
    #[serde(default)]
    pub confidential: bool,

    pub organization_id: Option<Uuid>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CreateClientResponse {
    pub client_id: String,
    pub name: String,
    pub redirect_uris: Vec<String>,
    pub allowed_scopes: Vec<String>,
    pub is_confidential: bool,
    /// Shown once; only its hash is stored
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
}

/// RFC 7009 revocation request.
#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct RevokeTokenRequest {
    #[validate(length(min = 1, message = "Token is required"))]
    pub token: String,
    /// Accepted for compatibility; the token kind is detected
    pub token_type_hint: Option<String>,
}
