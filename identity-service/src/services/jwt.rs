use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use std::fs;
use thiserror::Error;
use uuid::Uuid;

use crate::config::{JwtAlgorithm, JwtConfig};

/// JWT service for access token issuance and validation
#[derive(Clone)]
pub struct JwtService {
    algorithm: Algorithm,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
    access_token_expiry_minutes: i64,
}

/// Claims carried by an access token: a snapshot of the caller's capabilities
/// in one organization at issuance time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessTokenClaims {
    /// Subject (user ID)
    pub sub: String,
    pub user_id: Uuid,
    pub organization_id: Uuid,
    /// Refresh-token family this token was minted from
    pub session_id: Uuid,
    /// `None` for superadmins, whose access does not come from a membership
    pub role_id: Option<Uuid>,
    pub role_name: String,
    pub permissions: Vec<String>,
    pub is_superadmin: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    /// JWT ID (for deny-listing)
    pub jti: String,
    pub iss: String,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Issued at in microseconds, ordered against revocation watermarks
    #[serde(default)]
    pub iat_micros: i64,
}

impl AccessTokenClaims {
    pub fn has_permission(&self, permission: &str) -> bool {
        self.is_superadmin || self.permissions.iter().any(|p| p == permission)
    }

    /// Issue time in microseconds, falling back to `iat` for tokens without `iat_micros`.
    pub fn issued_at_micros(&self) -> i64 {
        if self.iat_micros > 0 {
            self.iat_micros
        } else {
            self.iat.saturating_mul(1_000_000)
        }
    }

    pub fn issued_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_micros(self.issued_at_micros())
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.exp, 0)
    }
}

/// Everything needed to mint an access token.
#[derive(Debug, Clone)]
pub struct AccessTokenRequest {
    pub user_id: Uuid,
    pub organization_id: Uuid,
    pub session_id: Uuid,
    pub role_id: Option<Uuid>,
    pub role_name: String,
    pub permissions: Vec<String>,
    pub is_superadmin: bool,
    pub client_id: Option<String>,
    pub scope: Option<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("Malformed token")]
    Malformed,

    #[error("Invalid token signature")]
    SignatureInvalid,

    #[error("Token expired")]
    Expired,

    #[error("Token revoked")]
    Revoked,

    #[error("Failed to sign token: {0}")]
    Signing(String),
}

impl From<jsonwebtoken::errors::Error> for TokenError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            ErrorKind::ExpiredSignature => TokenError::Expired,
            ErrorKind::InvalidSignature
            | ErrorKind::InvalidAlgorithm
            | ErrorKind::InvalidIssuer => TokenError::SignatureInvalid,
            _ => TokenError::Malformed,
        }
    }
}

/// Token response returned to client
#[derive(Debug, Serialize, Deserialize, utoipa::ToSchema)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    pub expires_in: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

impl JwtService {
    /// Build the service from configuration, loading RSA keys from files for RS256.
    pub fn new(config: &JwtConfig) -> Result<Self, anyhow::Error> {
        match config.algorithm {
            JwtAlgorithm::Rs256 => {
                let private_key_path = config
                    .private_key_path
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("JWT_PRIVATE_KEY_PATH is not set"))?;
                let public_key_path = config
                    .public_key_path
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("JWT_PUBLIC_KEY_PATH is not set"))?;

                // Load private key for signing
                let private_key_pem = fs::read_to_string(private_key_path).map_err(|e| {
                    anyhow::anyhow!(
                        "Failed to read private key from {}: {}",
                        private_key_path,
                        e
                    )
                })?;
                let encoding_key = EncodingKey::from_rsa_pem(private_key_pem.as_bytes())
                    .map_err(|e| anyhow::anyhow!("Failed to parse private key: {}", e))?;

                // Load public key for verification
                let public_key_pem = fs::read_to_string(public_key_path).map_err(|e| {
                    anyhow::anyhow!("Failed to read public key from {}: {}", public_key_path, e)
                })?;
                let decoding_key = DecodingKey::from_rsa_pem(public_key_pem.as_bytes())
                    .map_err(|e| anyhow::anyhow!("Failed to parse public key: {}", e))?;

                tracing::info!("JWT service initialized with RS256 keys");

                Ok(Self {
                    algorithm: Algorithm::RS256,
                    encoding_key,
                    decoding_key,
                    issuer: config.issuer.clone(),
                    access_token_expiry_minutes: config.access_token_expiry_minutes,
                })
            }
            JwtAlgorithm::Hs256 => {
                let secret = config
                    .hmac_secret
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("JWT_HMAC_SECRET is not set"))?;

                tracing::info!("JWT service initialized with HS256 secret");

                Ok(Self::with_hmac_secret(
                    secret.as_bytes(),
                    &config.issuer,
                    config.access_token_expiry_minutes,
                ))
            }
        }
    }

    pub fn with_hmac_secret(secret: &[u8], issuer: &str, access_token_expiry_minutes: i64) -> Self {
        Self {
            algorithm: Algorithm::HS256,
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            issuer: issuer.to_string(),
            access_token_expiry_minutes,
        }
    }

    /// Issue an access token valid from now.
    pub fn issue(&self, request: AccessTokenRequest) -> Result<(String, AccessTokenClaims), TokenError> {
        self.issue_at(request, Utc::now())
    }

    /// Issue an access token with an explicit issue time.
    pub fn issue_at(
        &self,
        request: AccessTokenRequest,
        issued_at: DateTime<Utc>,
    ) -> Result<(String, AccessTokenClaims), TokenError> {
        let exp = issued_at + Duration::minutes(self.access_token_expiry_minutes);

        let claims = AccessTokenClaims {
            sub: request.user_id.to_string(),
            user_id: request.user_id,
            organization_id: request.organization_id,
            session_id: request.session_id,
            role_id: request.role_id,
            role_name: request.role_name,
            permissions: request.permissions,
            is_superadmin: request.is_superadmin,
            client_id: request.client_id,
            scope: request.scope,
            jti: Uuid::new_v4().to_string(),
            iss: self.issuer.clone(),
            exp: exp.timestamp(),
            iat: issued_at.timestamp(),
            iat_micros: issued_at.timestamp_micros(),
        };

        let header = Header::new(self.algorithm);
        let token = encode(&header, &claims, &self.encoding_key)
            .map_err(|e| TokenError::Signing(e.to_string()))?;

        Ok((token, claims))
    }

    /// Validate signature, issuer and expiry. Revocation is checked separately.
    pub fn validate(&self, token: &str) -> Result<AccessTokenClaims, TokenError> {
        let mut validation = Validation::new(self.algorithm);
        validation.validate_exp = true;
        validation.leeway = 0;
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "iat", "sub", "iss"]);

        let token_data = decode::<AccessTokenClaims>(token, &self.decoding_key, &validation)?;
        Ok(token_data.claims)
    }

    /// Decode without checking expiry. Used by revocation, which must accept
    /// expired tokens as no-ops.
    pub fn decode_ignoring_expiry(&self, token: &str) -> Result<AccessTokenClaims, TokenError> {
        let mut validation = Validation::new(self.algorithm);
        validation.validate_exp = false;
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.set_required_spec_claims(&["iss"]);

        let token_data = decode::<AccessTokenClaims>(token, &self.decoding_key, &validation)?;
        Ok(token_data.claims)
    }

    /// Get access token expiry in seconds (for client info)
    pub fn access_token_expiry_seconds(&self) -> i64 {
        self.access_token_expiry_minutes * 60
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"an-hs256-test-secret-of-sufficient-length";

    fn service() -> JwtService {
        JwtService::with_hmac_secret(SECRET, "identity-test", 15)
    }

    fn request() -> AccessTokenRequest {
        AccessTokenRequest {
            user_id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            role_id: Some(Uuid::new_v4()),
            role_name: "admin".to_string(),
            permissions: vec!["users:read".to_string(), "sessions:revoke".to_string()],
            is_superadmin: false,
            client_id: Some("spa".to_string()),
            scope: Some("openid".to_string()),
        }
    }

    #[test]
    fn test_issue_and_validate() -> Result<(), anyhow::Error> {
        let service = service();
        let req = request();
        let (token, issued) = service.issue(req.clone())?;
        assert!(!token.is_empty());

        let claims = service.validate(&token)?;
        assert_eq!(claims, issued);
        assert_eq!(claims.sub, req.user_id.to_string());
        assert_eq!(claims.organization_id, req.organization_id);
        assert_eq!(claims.session_id, req.session_id);
        assert_eq!(claims.permissions, req.permissions);
        assert_eq!(claims.exp - claims.iat, 15 * 60);
        assert!(claims.has_permission("sessions:revoke"));
        assert!(!claims.has_permission("roles:manage"));
        Ok(())
    }

    #[test]
    fn test_issue_time_keeps_sub_second_precision() {
        let service = service();
        let at = DateTime::from_timestamp(1_700_000_000, 250_000_000).unwrap();
        let (token, _) = service.issue_at(request(), Utc::now()).unwrap();
        let fresh = service.validate(&token).unwrap();
        assert_eq!(fresh.iat, fresh.iat_micros / 1_000_000);

        let (token, _) = service.issue_at(request(), at).unwrap();
        let claims = service.decode_ignoring_expiry(&token).unwrap();
        assert_eq!(claims.iat, 1_700_000_000);
        assert_eq!(claims.issued_at_micros(), 1_700_000_000_250_000);
        assert_eq!(claims.issued_at(), Some(at));

        let legacy = AccessTokenClaims {
            iat_micros: 0,
            ..claims
        };
        assert_eq!(legacy.issued_at_micros(), 1_700_000_000_000_000);
    }

    #[test]
    fn test_expired_token_rejected() {
        let service = service();
        let (token, _) = service
            .issue_at(request(), Utc::now() - Duration::hours(1))
            .unwrap();
        assert_eq!(service.validate(&token), Err(TokenError::Expired));
        assert!(service.decode_ignoring_expiry(&token).is_ok());
    }

    #[test]
    fn test_signature_from_other_key_rejected() {
        let other = JwtService::with_hmac_secret(b"another-secret-entirely-different!!", "identity-test", 15);
        let (token, _) = other.issue(request()).unwrap();
        assert_eq!(service().validate(&token), Err(TokenError::SignatureInvalid));
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let service = service();
        let (token, _) = service.issue(request()).unwrap();
        let mut parts: Vec<String> = token.split('.').map(str::to_string).collect();
        let forged = service.issue(request()).unwrap().0;
        parts[1] = forged.split('.').nth(1).unwrap().to_string();
        assert_eq!(
            service.validate(&parts.join(".")),
            Err(TokenError::SignatureInvalid)
        );
    }

    #[test]
    fn test_garbage_is_malformed() {
        assert_eq!(service().validate("not-a-jwt"), Err(TokenError::Malformed));
    }

    #[test]
    fn test_superadmin_has_every_permission() {
        let service = service();
        let mut req = request();
        req.is_superadmin = true;
        req.role_id = None;
        req.permissions = vec![];
        let (token, _) = service.issue(req).unwrap();
        let claims = service.validate(&token).unwrap();
        assert!(claims.has_permission("anything:at_all"));
        assert_eq!(claims.role_id, None);
    }
}
