pub mod auth;
pub mod rate_limit;

pub use auth::{auth_middleware, AuthPrincipal, Principal, API_KEY_HEADER};
pub use rate_limit::{ip_rate_limit_middleware, ScopedRateLimit};
