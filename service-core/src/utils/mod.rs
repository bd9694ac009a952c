pub mod crypto;

pub use crypto::{constant_time_eq, random_token, sha256_hex};
