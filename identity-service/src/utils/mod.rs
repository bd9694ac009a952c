pub mod secret;
pub mod validation;

pub use secret::{hash_blocking, hash_secret, verify_blocking, Secret, SecretHash};
pub use validation::ValidatedJson;
