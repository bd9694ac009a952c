pub mod api_key;
pub mod authorization_code;
pub mod client;
pub mod membership;
pub mod organization;
pub mod permission;
pub mod refresh_token;
pub mod role;
pub mod user;

pub use api_key::{parse_presented_key, ApiKey, API_KEY_PREFIX};
pub use authorization_code::{AuthorizationCode, NewAuthorizationCode};
pub use client::{normalize_scope, ClientApp};
pub use membership::{Membership, MembershipRemoval, MembershipStatus};
pub use organization::{normalize_slug, Organization, OrganizationStatus};
pub use permission::{is_valid_permission_name, Permission};
pub use refresh_token::{RefreshToken, RefreshTokenSubject, TokenBinding};
pub use role::{Role, ADMIN_ROLE};
pub use user::{normalize_email, User};
