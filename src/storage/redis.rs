//! Redis implementation of `KvBackend` over a deadpool connection pool.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::redis::{self, AsyncCommands, IntoConnectionInfo};
use deadpool_redis::{Config, Connection, Pool, Runtime};
use tracing::{info, warn};

use super::{KvBackend, StorageError, StorageResult};

/// Connection settings for the Redis credential store.
#[derive(Debug, Clone)]
pub struct RedisSettings {
    pub host: String,
    pub port: u16,
    pub password: Option<String>,
    pub db: i64,
    pub pool_max: usize,
    /// Attempts before startup gives up on an unreachable server.
    pub max_retries: u32,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self { host: "localhost".into(), port: 6379, password: None, db: 0, pool_max: 16, max_retries: 10 }
    }
}

/// Delay before reconnect attempt `attempt` (1-based): 100ms steps, capped at 3s.
pub fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_millis(u64::from(attempt).saturating_mul(100).min(3_000))
}

#[derive(Clone)]
pub struct RedisKv {
    pool: Pool,
}

impl RedisKv {
    fn build_pool(settings: &RedisSettings) -> StorageResult<Pool> {
        let url = format!("redis://{}:{}/{}", settings.host, settings.port, settings.db);
        let mut info = url.as_str().into_connection_info().map_err(|e| StorageError::Unavailable(e.to_string()))?;
        // Set directly rather than through the URL so passwords need no escaping
        info.redis.password = settings.password.clone();
        let mut cfg = Config::from_connection_info(info);
        cfg.pool = Some(deadpool_redis::PoolConfig::new(settings.pool_max));
        cfg.create_pool(Some(Runtime::Tokio1)).map_err(|e| StorageError::Unavailable(e.to_string()))
    }

    /// Build the pool and wait for the server to answer PING, backing off between tries.
    pub async fn connect(settings: &RedisSettings) -> StorageResult<Self> {
        let pool = Self::build_pool(settings)?;
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let ping = async {
                let mut conn = pool.get().await.map_err(|e| StorageError::Unavailable(e.to_string()))?;
                redis::cmd("PING")
                    .query_async::<String>(&mut conn)
                    .await
                    .map_err(|e| StorageError::Unavailable(e.to_string()))
            };
            match ping.await {
                Ok(_) => {
                    info!(host = %settings.host, port = settings.port, db = settings.db, "Connected to Redis");
                    return Ok(Self { pool });
                }
                Err(e) if attempt >= settings.max_retries => {
                    warn!("Redis max retries reached ({} attempts): {}", attempt, e);
                    return Err(e);
                }
                Err(e) => {
                    let delay = backoff_delay(attempt);
                    warn!(attempt = attempt, delay_ms = delay.as_millis() as u64, "Redis not ready: {}", e);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn conn(&self) -> StorageResult<Connection> {
        self.pool.get().await.map_err(|e| StorageError::Unavailable(e.to_string()))
    }
}

fn cmd_err(e: redis::RedisError) -> StorageError {
    StorageError::Command(e.to_string())
}

#[async_trait]
impl KvBackend for RedisKv {
    async fn hset_all(&self, key: &str, fields: &[(String, String)]) -> StorageResult<()> {
        if fields.is_empty() { return Ok(()); }
        let mut conn = self.conn().await?;
        let _: () = conn.hset_multiple(key, fields).await.map_err(cmd_err)?;
        Ok(())
    }

    async fn hgetall(&self, key: &str) -> StorageResult<HashMap<String, String>> {
        let mut conn = self.conn().await?;
        let h: HashMap<String, String> = conn.hgetall(key).await.map_err(cmd_err)?;
        Ok(h)
    }

    async fn sadd(&self, key: &str, member: &str) -> StorageResult<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.sadd(key, member).await.map_err(cmd_err)?;
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> StorageResult<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.srem(key, member).await.map_err(cmd_err)?;
        Ok(())
    }

    async fn smembers(&self, key: &str) -> StorageResult<Vec<String>> {
        let mut conn = self.conn().await?;
        let mut members: Vec<String> = conn.smembers(key).await.map_err(cmd_err)?;
        members.sort();
        Ok(members)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> StorageResult<()> {
        let mut conn = self.conn().await?;
        let _: () = conn.set_ex(key, value, ttl.as_secs().max(1)).await.map_err(cmd_err)?;
        Ok(())
    }

    async fn get(&self, key: &str) -> StorageResult<Option<String>> {
        let mut conn = self.conn().await?;
        let v: Option<String> = conn.get(key).await.map_err(cmd_err)?;
        Ok(v)
    }

    async fn del(&self, key: &str) -> StorageResult<bool> {
        let mut conn = self.conn().await?;
        let removed: i64 = conn.del(key).await.map_err(cmd_err)?;
        Ok(removed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_linear_then_capped() {
        assert_eq!(backoff_delay(1), Duration::from_millis(100));
        assert_eq!(backoff_delay(7), Duration::from_millis(700));
        assert_eq!(backoff_delay(30), Duration::from_secs(3));
        assert_eq!(backoff_delay(u32::MAX), Duration::from_secs(3));
    }

    #[tokio::test]
    async fn unreachable_server_gives_up_after_max_retries() {
        // Port 1 on loopback refuses connections immediately.
        let settings = RedisSettings { host: "127.0.0.1".into(), port: 1, max_retries: 2, ..Default::default() };
        let started = std::time::Instant::now();
        let res = RedisKv::connect(&settings).await;
        assert!(matches!(res, Err(StorageError::Unavailable(_))));
        // One 100ms backoff between the two attempts
        assert!(started.elapsed() >= Duration::from_millis(100));
    }
}
