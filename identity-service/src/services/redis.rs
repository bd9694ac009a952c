use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::{aio::ConnectionManager, Client, Script};
use std::time::Duration;
use uuid::Uuid;

use crate::repository::{
    CounterStore, RevocationStore, StoreError, StoreHealth, StoreResult, WatermarkScope,
    Watermarks,
};

/// Increment and set the expiry on first use, atomically.
const INCREMENT_WITH_EXPIRY: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return count
"#;

/// Only ever raise a watermark.
const RAISE_WATERMARK: &str = r#"
local current = redis.call('GET', KEYS[1])
if (not current) or tonumber(current) < tonumber(ARGV[1]) then
    redis.call('SET', KEYS[1], ARGV[1], 'EX', ARGV[2])
    return 1
end
return 0
"#;

fn redis_error(context: &str, err: redis::RedisError) -> StoreError {
    StoreError::Backend(anyhow::anyhow!("{}: {}", context, err))
}

/// Redis-backed rate-limit counters, session watermarks and access-token deny list.
#[derive(Clone)]
pub struct RedisService {
    _client: Client,
    manager: ConnectionManager,
    watermark_retention_seconds: u64,
}

impl RedisService {
    pub async fn new(
        config: &crate::config::RedisConfig,
        watermark_retention_seconds: u64,
    ) -> Result<Self, anyhow::Error> {
        tracing::info!(url = %config.url, "Connecting to Redis");
        let client = Client::open(config.url.clone())?;

        // Use ConnectionManager for automatic reconnection
        let manager = client.get_connection_manager().await.map_err(|e| {
            tracing::error!("Failed to get Redis connection manager: {}", e);
            anyhow::anyhow!("Failed to connect to Redis: {}", e)
        })?;

        tracing::info!("Successfully connected to Redis");

        Ok(Self {
            _client: client,
            manager,
            watermark_retention_seconds,
        })
    }
}

#[async_trait]
impl StoreHealth for RedisService {
    async fn health_check(&self) -> StoreResult<()> {
        let mut conn = self.manager.clone();
        redis::cmd("PING")
            .query_async::<_, String>(&mut conn)
            .await
            .map(|_| ())
            .map_err(|e| redis_error("Redis health check failed", e))
    }
}

#[async_trait]
impl CounterStore for RedisService {
    async fn increment(&self, key: &str, ttl: Duration) -> StoreResult<u64> {
        let mut conn = self.manager.clone();
        let ttl_ms = ttl.as_millis().max(1) as u64;

        Script::new(INCREMENT_WITH_EXPIRY)
            .key(key)
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| redis_error("Failed to increment rate limit counter", e))
    }
}

#[async_trait]
impl RevocationStore for RedisService {
    async fn raise_watermark(&self, scope: WatermarkScope, at: DateTime<Utc>) -> StoreResult<()> {
        let mut conn = self.manager.clone();

        let _: i64 = Script::new(RAISE_WATERMARK)
            .key(scope.key())
            .arg(at.timestamp_micros())
            .arg(self.watermark_retention_seconds)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| redis_error("Failed to raise revocation watermark", e))?;
        Ok(())
    }

    async fn watermarks(&self, user_id: Uuid, org_id: Uuid) -> StoreResult<Watermarks> {
        let mut conn = self.manager.clone();
        let keys = [
            WatermarkScope::User(user_id).key(),
            WatermarkScope::Organization(org_id).key(),
            WatermarkScope::UserInOrganization { user_id, org_id }.key(),
        ];

        let values: Vec<Option<i64>> = redis::cmd("MGET")
            .arg(&keys[..])
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_error("Failed to read revocation watermarks", e))?;

        let at = |index: usize| {
            values
                .get(index)
                .copied()
                .flatten()
                .and_then(DateTime::from_timestamp_micros)
        };

        Ok(Watermarks {
            user: at(0),
            organization: at(1),
            user_in_organization: at(2),
        })
    }

    /// Deny-list an access token until it would have expired anyway.
    async fn deny_token(&self, jti: &str, expires_at: DateTime<Utc>) -> StoreResult<()> {
        let remaining = (expires_at - Utc::now()).num_seconds();
        if remaining <= 0 {
            return Ok(());
        }

        let mut conn = self.manager.clone();
        let key = format!("denylist:{}", jti);

        redis::cmd("SET")
            .arg(&key)
            .arg("revoked")
            .arg("EX")
            .arg(remaining)
            .query_async::<_, ()>(&mut conn)
            .await
            .map_err(|e| redis_error("Failed to deny-list token", e))
    }

    async fn is_token_denied(&self, jti: &str) -> StoreResult<bool> {
        let mut conn = self.manager.clone();
        let key = format!("denylist:{}", jti);

        redis::cmd("EXISTS")
            .arg(&key)
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_error("Failed to check deny list", e))
    }
}
