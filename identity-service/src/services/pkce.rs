//! Proof Key for Code Exchange (RFC 7636), S256 only.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use service_core::utils::{constant_time_eq, random_token};
use sha2::{Digest, Sha256};
use thiserror::Error;

pub const METHOD_S256: &str = "S256";
pub const MIN_VERIFIER_LEN: usize = 43;
pub const MAX_VERIFIER_LEN: usize = 128;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PkceError {
    #[error("Invalid code verifier")]
    InvalidVerifier,

    #[error("Unsupported code challenge method: {0}")]
    UnsupportedMethod(String),

    #[error("Code verifier length out of range")]
    LengthOutOfRange,

    #[error("Code challenge mismatch")]
    ChallengeMismatch,
}

fn is_unreserved(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~')
}

fn check_verifier(verifier: &str) -> Result<(), PkceError> {
    if !(MIN_VERIFIER_LEN..=MAX_VERIFIER_LEN).contains(&verifier.len()) {
        return Err(PkceError::LengthOutOfRange);
    }
    if !verifier.chars().all(is_unreserved) {
        return Err(PkceError::InvalidVerifier);
    }
    Ok(())
}

/// 32 random bytes, base64url-encoded: 43 characters, 256 bits of entropy.
pub fn generate_verifier() -> String {
    random_token(32)
}

/// `BASE64URL(SHA256(verifier))` without padding.
pub fn challenge(verifier: &str) -> Result<String, PkceError> {
    check_verifier(verifier).map_err(|_| PkceError::InvalidVerifier)?;
    Ok(URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes())))
}

/// An S256 challenge is the 43-character base64url encoding of a SHA-256 digest.
pub fn is_well_formed_challenge(challenge_value: &str) -> bool {
    challenge_value.len() == 43
        && challenge_value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Check a verifier presented at the token endpoint against the challenge
/// stored with the code.
pub fn verify(verifier: &str, challenge_value: &str, method: &str) -> Result<(), PkceError> {
    if method != METHOD_S256 {
        return Err(PkceError::UnsupportedMethod(method.to_string()));
    }
    check_verifier(verifier)?;

    let computed = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
    if constant_time_eq(computed.as_bytes(), challenge_value.as_bytes()) {
        Ok(())
    } else {
        Err(PkceError::ChallengeMismatch)
    }
}
