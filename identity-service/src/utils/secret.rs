//! Argon2 hashing for user passwords and OAuth client secrets.
//!
//! Hashing is CPU-bound, so the async helpers run it on the blocking pool.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use std::fmt;
use tokio::task::JoinHandle;

/// A plaintext password or client secret. Never printed.
#[derive(Clone)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    fn expose(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

/// PHC-formatted Argon2id hash as stored in the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretHash(String);

impl SecretHash {
    pub fn new(hash: impl Into<String>) -> Self {
        Self(hash.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

pub fn hash_secret(secret: &Secret) -> Result<SecretHash, anyhow::Error> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(secret.expose(), &salt)
        .map_err(|e| anyhow::anyhow!("Failed to hash secret: {}", e))?;

    Ok(SecretHash(hash.to_string()))
}

/// `false` for a wrong secret and for a hash that does not parse.
pub fn verify_secret(secret: &Secret, hash: &SecretHash) -> bool {
    match PasswordHash::new(hash.as_str()) {
        Ok(parsed) => Argon2::default()
            .verify_password(secret.expose(), &parsed)
            .is_ok(),
        Err(e) => {
            tracing::warn!(error = %e, "Stored secret hash is not a valid PHC string");
            false
        }
    }
}

/// Hash of a random value, verified against when no real hash exists so
/// unknown accounts take as long to reject as wrong passwords.
pub fn timing_equalizer() -> Option<SecretHash> {
    match hash_secret(&Secret::new(service_core::utils::random_token(16))) {
        Ok(hash) => Some(hash),
        Err(e) => {
            tracing::error!(error = %e, "Failed to prepare timing equalizer hash");
            None
        }
    }
}

pub async fn hash_blocking(secret: Secret) -> Result<SecretHash, anyhow::Error> {
    joined(tokio::task::spawn_blocking(move || hash_secret(&secret)), "hash").await?
}

pub async fn verify_blocking(secret: Secret, hash: SecretHash) -> Result<bool, anyhow::Error> {
    joined(
        tokio::task::spawn_blocking(move || verify_secret(&secret, &hash)),
        "verify",
    )
    .await
}

/// A panicked or cancelled hashing task is an internal error, never a mismatch.
async fn joined<T>(handle: JoinHandle<T>, operation: &str) -> Result<T, anyhow::Error> {
    handle.await.map_err(|e| {
        tracing::error!(operation, error = %e, "Secret hashing task failed");
        anyhow::anyhow!("Secret {} task failed: {}", operation, e)
    })
}
