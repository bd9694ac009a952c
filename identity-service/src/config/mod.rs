use serde::Deserialize;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct IdentityConfig {
    #[serde(flatten)]
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub jwt: JwtConfig,
    pub oauth: OAuthConfig,
    pub store: StoreConfig,
    pub revocation: RevocationConfig,
    pub security: SecurityConfig,
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Dev,
    Prod,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JwtAlgorithm {
    Rs256,
    Hs256,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub algorithm: JwtAlgorithm,
    pub private_key_path: Option<String>,
    pub public_key_path: Option<String>,
    pub hmac_secret: Option<String>,
    pub issuer: String,
    pub access_token_expiry_minutes: i64,
    pub refresh_token_expiry_days: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OAuthConfig {
    pub authorization_code_ttl_seconds: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub timeout_ms: u64,
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RevocationConfig {
    /// How long a watermark is kept. Must outlive the longest-lived token.
    pub watermark_retention_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    pub allowed_origins: Vec<String>,
    /// Peers whose `x-forwarded-for` header is believed
    #[serde(default)]
    pub trusted_proxies: Vec<IpAddr>,
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
pub struct ScopeLimit {
    pub attempts: u32,
    pub window_seconds: u64,
}

/// What the rate limiter does when the shared counter store is unavailable.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StoreFailureMode {
    /// Allow the request
    Open,
    /// Reject the request with 429
    Closed,
    /// Count in process memory until the store recovers
    Local,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    pub registration: ScopeLimit,
    pub login: ScopeLimit,
    pub password_reset: ScopeLimit,
    pub token_refresh: ScopeLimit,
    pub oauth_token: ScopeLimit,
    pub api_calls: ScopeLimit,
    pub store_failure_mode: StoreFailureMode,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            registration: ScopeLimit { attempts: 3, window_seconds: 3600 },
            login: ScopeLimit { attempts: 5, window_seconds: 900 },
            password_reset: ScopeLimit { attempts: 3, window_seconds: 3600 },
            token_refresh: ScopeLimit { attempts: 30, window_seconds: 60 },
            oauth_token: ScopeLimit { attempts: 20, window_seconds: 60 },
            api_calls: ScopeLimit { attempts: 600, window_seconds: 60 },
            store_failure_mode: StoreFailureMode::Local,
        }
    }
}

impl IdentityConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;

        let env_str = env::var("ENVIRONMENT").unwrap_or_else(|_| "dev".to_string());
        let environment: Environment = env_str
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;

        let is_prod = environment == Environment::Prod;
        let defaults = RateLimitConfig::default();

        let config = IdentityConfig {
            common: common_config,
            environment: environment.clone(),
            service_name: get_env("SERVICE_NAME", Some("identity-service"), is_prod)?,
            service_version: get_env("SERVICE_VERSION", Some(env!("CARGO_PKG_VERSION")), is_prod)?,
            log_level: get_env("LOG_LEVEL", Some("info"), is_prod)?,
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok().filter(|v| !v.is_empty()),
            database: DatabaseConfig {
                url: get_env("DATABASE_URL", None, is_prod)?,
                max_connections: get_parsed("DATABASE_MAX_CONNECTIONS", "10", is_prod)?,
                min_connections: get_parsed("DATABASE_MIN_CONNECTIONS", "1", is_prod)?,
            },
            redis: RedisConfig {
                url: get_env("REDIS_URL", Some("redis://127.0.0.1:6379"), is_prod)?,
            },
            jwt: JwtConfig {
                algorithm: get_parsed("JWT_ALGORITHM", "rs256", is_prod)?,
                private_key_path: env::var("JWT_PRIVATE_KEY_PATH").ok(),
                public_key_path: env::var("JWT_PUBLIC_KEY_PATH").ok(),
                hmac_secret: env::var("JWT_HMAC_SECRET").ok(),
                issuer: get_env("JWT_ISSUER", Some("identity-service"), is_prod)?,
                access_token_expiry_minutes: get_parsed(
                    "JWT_ACCESS_TOKEN_EXPIRY_MINUTES",
                    "15",
                    is_prod,
                )?,
                refresh_token_expiry_days: get_parsed("JWT_REFRESH_TOKEN_EXPIRY_DAYS", "7", is_prod)?,
            },
            oauth: OAuthConfig {
                authorization_code_ttl_seconds: get_parsed(
                    "AUTHORIZATION_CODE_TTL_SECONDS",
                    "60",
                    is_prod,
                )?,
            },
            store: StoreConfig {
                timeout_ms: get_parsed("STORE_TIMEOUT_MS", "2000", is_prod)?,
            },
            revocation: RevocationConfig {
                watermark_retention_seconds: get_parsed(
                    "REVOCATION_WATERMARK_RETENTION_SECONDS",
                    "2592000",
                    is_prod,
                )?,
            },
            security: SecurityConfig {
                allowed_origins: get_env("ALLOWED_ORIGINS", Some("http://localhost:3000"), is_prod)?
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect(),
                trusted_proxies: parse_ip_list(
                    "TRUSTED_PROXIES",
                    &get_env("TRUSTED_PROXIES", Some(""), is_prod)?,
                )?,
            },
            rate_limit: RateLimitConfig {
                registration: scope_limit("REGISTRATION", defaults.registration, is_prod)?,
                login: scope_limit("LOGIN", defaults.login, is_prod)?,
                password_reset: scope_limit("PASSWORD_RESET", defaults.password_reset, is_prod)?,
                token_refresh: scope_limit("TOKEN_REFRESH", defaults.token_refresh, is_prod)?,
                oauth_token: scope_limit("OAUTH_TOKEN", defaults.oauth_token, is_prod)?,
                api_calls: scope_limit("API_CALLS", defaults.api_calls, is_prod)?,
                store_failure_mode: get_parsed("RATE_LIMIT_STORE_FAILURE_POLICY", "local", is_prod)?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.common.port == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "PORT must be greater than 0"
            )));
        }

        if self.jwt.access_token_expiry_minutes <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "JWT_ACCESS_TOKEN_EXPIRY_MINUTES must be positive"
            )));
        }

        if self.jwt.refresh_token_expiry_days <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "JWT_REFRESH_TOKEN_EXPIRY_DAYS must be positive"
            )));
        }

        if self.oauth.authorization_code_ttl_seconds <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "AUTHORIZATION_CODE_TTL_SECONDS must be positive"
            )));
        }

        if self.store.timeout_ms == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "STORE_TIMEOUT_MS must be positive"
            )));
        }

        let refresh_lifetime = self.jwt.refresh_token_expiry_days as u64 * 86_400;
        if self.revocation.watermark_retention_seconds < refresh_lifetime {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "REVOCATION_WATERMARK_RETENTION_SECONDS must cover the refresh token lifetime"
            )));
        }

        let limits = [
            ("REGISTRATION", self.rate_limit.registration),
            ("LOGIN", self.rate_limit.login),
            ("PASSWORD_RESET", self.rate_limit.password_reset),
            ("TOKEN_REFRESH", self.rate_limit.token_refresh),
            ("OAUTH_TOKEN", self.rate_limit.oauth_token),
            ("API_CALLS", self.rate_limit.api_calls),
        ];
        for (name, limit) in limits {
            if limit.attempts == 0 || limit.window_seconds == 0 {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "RATE_LIMIT_{}_ATTEMPTS and RATE_LIMIT_{}_WINDOW_SECONDS must be positive",
                    name,
                    name
                )));
            }
        }

        match self.jwt.algorithm {
            JwtAlgorithm::Rs256 => {
                if self.jwt.private_key_path.is_none() || self.jwt.public_key_path.is_none() {
                    return Err(AppError::ConfigError(anyhow::anyhow!(
                        "JWT_PRIVATE_KEY_PATH and JWT_PUBLIC_KEY_PATH are required for rs256"
                    )));
                }
            }
            JwtAlgorithm::Hs256 => {
                let secret_len = self.jwt.hmac_secret.as_deref().map_or(0, str::len);
                if secret_len < 32 {
                    return Err(AppError::ConfigError(anyhow::anyhow!(
                        "JWT_HMAC_SECRET of at least 32 bytes is required for hs256"
                    )));
                }
            }
        }

        if self.environment == Environment::Prod {
            if self.security.allowed_origins.iter().any(|o| o == "*") {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "Wildcard CORS origin not allowed in production"
                )));
            }

            if self.jwt.algorithm == JwtAlgorithm::Hs256 {
                tracing::warn!("HS256 access tokens in production cannot be verified by third parties");
            }

            if self.rate_limit.store_failure_mode == StoreFailureMode::Open {
                tracing::warn!("Rate limiter fails open in production");
            }
        }

        Ok(())
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required in production but not set",
                    key
                ))))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(format!(
                    "{} is required but not set",
                    key
                ))))
            }
        }
    }
}

fn get_parsed<T>(key: &str, default: &str, is_prod: bool) -> Result<T, AppError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get_env(key, Some(default), is_prod)?
        .parse()
        .map_err(|e: T::Err| AppError::ConfigError(anyhow::anyhow!("{}: {}", key, e)))
}

/// Comma-separated IP addresses; blanks are skipped.
fn parse_ip_list(key: &str, raw: &str) -> Result<Vec<IpAddr>, AppError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<IpAddr>()
                .map_err(|e| AppError::ConfigError(anyhow::anyhow!("{}: {}: {}", key, s, e)))
        })
        .collect()
}

fn scope_limit(scope: &str, default: ScopeLimit, is_prod: bool) -> Result<ScopeLimit, AppError> {
    Ok(ScopeLimit {
        attempts: get_parsed(
            &format!("RATE_LIMIT_{}_ATTEMPTS", scope),
            &default.attempts.to_string(),
            is_prod,
        )?,
        window_seconds: get_parsed(
            &format!("RATE_LIMIT_{}_WINDOW_SECONDS", scope),
            &default.window_seconds.to_string(),
            is_prod,
        )?,
    })
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}

impl FromStr for JwtAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "rs256" => Ok(JwtAlgorithm::Rs256),
            "hs256" => Ok(JwtAlgorithm::Hs256),
            _ => Err(format!("Invalid JWT algorithm: {}", s)),
        }
    }
}

impl FromStr for StoreFailureMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "open" => Ok(StoreFailureMode::Open),
            "closed" => Ok(StoreFailureMode::Closed),
            "local" => Ok(StoreFailureMode::Local),
            _ => Err(format!("Invalid rate limit store failure policy: {}", s)),
        }
    }
}
