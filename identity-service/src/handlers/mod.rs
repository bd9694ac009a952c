//! HTTP handlers for the identity service.

pub mod api_keys;
pub mod auth;
pub mod clients;
pub mod oauth;
pub mod organizations;
pub mod sessions;

pub use api_keys::*;
pub use auth::*;
pub use clients::*;
pub use oauth::*;
pub use organizations::*;
pub use sessions::*;
