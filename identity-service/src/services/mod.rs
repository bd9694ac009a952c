//! Services layer for the identity provider.
//!
//! Engines take their repositories, stores and audit sink at construction and
//! hold no global state.

pub mod api_key;
pub mod audit;
pub mod auth;
pub mod authorization_code;
pub mod error;
pub mod jwt;
pub mod oauth;
pub mod pkce;
pub mod rate_limiter;
pub mod rbac;
pub mod redis;
pub mod revocation;
pub mod rotation;

pub use api_key::{ApiKeyError, ApiKeyService, IssuedApiKey};
pub use audit::{AuditEvent, AuditEventKind, AuditSink, MemoryAuditSink, TracingAuditSink};
pub use auth::{AuthError, AuthService, LoginParams};
pub use authorization_code::{AuthorizationCodeService, CodeError, RedeemedCode};
pub use jwt::{AccessTokenClaims, AccessTokenRequest, JwtService, TokenError, TokenResponse};
pub use oauth::{OAuthError, OAuthErrorCode, OAuthService, RegisteredClient};
pub use rate_limiter::{RateLimitDecision, RateLimitScope, RateLimiter};
pub use rbac::{EffectivePermissions, RbacError, RbacService};
pub use redis::RedisService;
pub use revocation::{RevocationError, RevocationService};
pub use rotation::{GrantRequest, IssuedTokens, RotationError, RotationService};
