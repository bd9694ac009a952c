use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use service_core::utils::sha256_hex;
use sqlx::FromRow;
use uuid::Uuid;

/// Refresh token stored in PostgreSQL for session management.
///
/// Tokens form families: the root of a grant has `family_id == id`, every
/// rotation inserts a successor sharing the family and stamps the predecessor
/// with `used_at` and `replaced_by_id`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RefreshToken {
    pub id: Uuid,

    /// SHA-256 of the opaque token
    pub token_hash: String,

    pub client_id: String,
    pub user_id: Uuid,
    pub organization_id: Uuid,
    pub scope: String,

    /// Groups every token descended from one original grant
    pub family_id: Uuid,

    pub expires_at: DateTime<Utc>,

    /// Set by logout and bulk revocation
    #[serde(default)]
    pub revoked: bool,

    /// Set when the token was rotated away
    pub used_at: Option<DateTime<Utc>>,

    /// Forward link to the successor
    pub replaced_by_id: Option<Uuid>,

    pub user_agent_hash: Option<String>,
    pub ip_hash: Option<String>,
    pub device_hash: Option<String>,

    pub created_at: DateTime<Utc>,
}

/// Hashed client fingerprint recorded alongside a refresh token.
///
/// Differences between rotations are reported, never enforced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenBinding {
    pub user_agent_hash: Option<String>,
    pub ip_hash: Option<String>,
    pub device_hash: Option<String>,
}

impl TokenBinding {
    pub fn from_raw(user_agent: Option<&str>, ip: Option<&str>, device_id: Option<&str>) -> Self {
        Self {
            user_agent_hash: user_agent.map(sha256_hex),
            ip_hash: ip.map(sha256_hex),
            device_hash: device_id.map(sha256_hex),
        }
    }

    /// Names of the fingerprint components that changed. Components missing on
    /// either side are not compared.
    pub fn drift_from(&self, token: &RefreshToken) -> Vec<&'static str> {
        let mut drift = Vec::new();
        let pairs = [
            ("user_agent", &self.user_agent_hash, &token.user_agent_hash),
            ("ip", &self.ip_hash, &token.ip_hash),
            ("device", &self.device_hash, &token.device_hash),
        ];
        for (name, presented, recorded) in pairs {
            if let (Some(p), Some(r)) = (presented, recorded) {
                if p != r {
                    drift.push(name);
                }
            }
        }
        drift
    }
}

/// Fields shared by a grant root and its successors.
#[derive(Debug, Clone)]
pub struct RefreshTokenSubject {
    pub client_id: String,
    pub user_id: Uuid,
    pub organization_id: Uuid,
    pub scope: String,
}

impl RefreshToken {
    /// Root of a new family. `family_id` doubles as the token id.
    pub fn new_root(
        family_id: Uuid,
        token: &str,
        subject: RefreshTokenSubject,
        binding: &TokenBinding,
        ttl: Duration,
    ) -> Self {
        Self::build(family_id, family_id, token, subject, binding, ttl)
    }

    /// Successor of `self` within the same family.
    pub fn successor(&self, token: &str, binding: &TokenBinding, ttl: Duration) -> Self {
        let subject = RefreshTokenSubject {
            client_id: self.client_id.clone(),
            user_id: self.user_id,
            organization_id: self.organization_id,
            scope: self.scope.clone(),
        };
        Self::build(Uuid::new_v4(), self.family_id, token, subject, binding, ttl)
    }

    fn build(
        id: Uuid,
        family_id: Uuid,
        token: &str,
        subject: RefreshTokenSubject,
        binding: &TokenBinding,
        ttl: Duration,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            token_hash: Self::hash_token(token),
            client_id: subject.client_id,
            user_id: subject.user_id,
            organization_id: subject.organization_id,
            scope: subject.scope,
            family_id,
            expires_at: now + ttl,
            revoked: false,
            used_at: None,
            replaced_by_id: None,
            user_agent_hash: binding.user_agent_hash.clone(),
            ip_hash: binding.ip_hash.clone(),
            device_hash: binding.device_hash.clone(),
            created_at: now,
        }
    }

    /// Hash a token using SHA-256
    pub fn hash_token(token: &str) -> String {
        sha256_hex(token)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Already rotated away
    pub fn is_consumed(&self) -> bool {
        self.used_at.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subject() -> RefreshTokenSubject {
        RefreshTokenSubject {
            client_id: "spa".to_string(),
            user_id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            scope: "openid".to_string(),
        }
    }

    #[test]
    fn test_root_token_starts_its_family() {
        let family = Uuid::new_v4();
        let token = RefreshToken::new_root(
            family,
            "token_abc",
            subject(),
            &TokenBinding::default(),
            Duration::days(7),
        );

        assert_eq!(token.id, family);
        assert_eq!(token.family_id, family);
        assert_ne!(token.token_hash, "token_abc");
        assert!(!token.revoked);
        assert!(!token.is_consumed());
        assert!(!token.is_expired_at(Utc::now()));
    }

    #[test]
    fn test_successor_shares_family() {
        let root = RefreshToken::new_root(
            Uuid::new_v4(),
            "token_abc",
            subject(),
            &TokenBinding::default(),
            Duration::days(7),
        );
        let next = root.successor("token_def", &TokenBinding::default(), Duration::days(7));

        assert_eq!(next.family_id, root.family_id);
        assert_ne!(next.id, root.id);
        assert_eq!(next.user_id, root.user_id);
        assert_eq!(next.token_hash, RefreshToken::hash_token("token_def"));
    }

    #[test]
    fn test_refresh_token_expiry() {
        let mut token = RefreshToken::new_root(
            Uuid::new_v4(),
            "token_abc",
            subject(),
            &TokenBinding::default(),
            Duration::days(7),
        );
        token.expires_at = Utc::now() - Duration::seconds(1);
        assert!(token.is_expired_at(Utc::now()));
    }

    #[test]
    fn test_binding_drift_ignores_missing_components() {
        let recorded = TokenBinding::from_raw(Some("Firefox"), Some("10.0.0.1"), None);
        let token = RefreshToken::new_root(
            Uuid::new_v4(),
            "t",
            subject(),
            &recorded,
            Duration::days(1),
        );

        let same = TokenBinding::from_raw(Some("Firefox"), None, Some("device-1"));
        assert!(same.drift_from(&token).is_empty());

        let moved = TokenBinding::from_raw(Some("Firefox"), Some("192.0.2.5"), None);
        assert_eq!(moved.drift_from(&token), vec!["ip"]);
    }
}
