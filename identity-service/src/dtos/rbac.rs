use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct CreateOrganizationRequest {
    #[validate(length(min = 1, max = 200, message = "Name must be 1-200 characters"))]
    #[schema(example = "Acme Corp")]
    pub name: String,

    #[validate(length(min = 1, max = 63, message = "Slug must be 1-63 characters"))]
    #[schema(example = "acme-corp")]
    pub slug: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct AddMemberRequest {
    pub user_id: Uuid,
    pub role_id: Uuid,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct CreatePermissionRequest {
    #[validate(length(min = 1, max = 100, message = "Name must be 1-100 characters"))]
    #[schema(example = "invoices:approve")]
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct CreateRoleRequest {
    #[validate(length(min = 1, max = 100, message = "Name must be 1-100 characters"))]
    #[schema(example = "approver")]
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct AssignPermissionsRequest {
    #[validate(length(min = 1, message = "At least one permission is required"))]
    pub permission_ids: Vec<Uuid>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct EffectivePermissionsResponse {
    pub user_id: Uuid,
    pub organization_id: Uuid,
    pub role_id: Option<Uuid>,
    pub role_name: String,
    pub permissions: Vec<String>,
    pub is_superadmin: bool,
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct CreateApiKeyRequest {
    #[validate(length(min = 1, max = 100, message = "Name must be 1-100 characters"))]
    #[schema(example = "ci-pipeline")]
    pub name: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[schema(value_type = Option<String>, format = "date-time")]
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CreateApiKeyResponse {
    pub key_id: String,
    /// Shown once; only a hash is stored
    #[schema(example = "idk_3f2a9c1b7d4e8a60_secret")]
    pub api_key: String,
    pub name: String,
    pub scopes: Vec<String>,
    #[schema(value_type = Option<String>, format = "date-time")]
    pub expires_at: Option<chrono::DateTime<chrono::Utc>>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SessionsRevokedResponse {
    /// Refresh tokens revoked by this call; zero when nothing was active
    pub revoked: u64,
}
