//! Replay-protection cache and failed-attempt lockout counters.
//!
//! Horizontally scaled deployments must share this cache across processes
//! (two requests with the same nonce landing on different instances still
//! have to collide), hence the Redis implementation; the in-memory variant
//! serves single-process deployments and tests.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use redis::{aio::ConnectionManager, Client};
use std::collections::HashMap;
use std::sync::Mutex;

#[async_trait]
pub trait NonceCache: Send + Sync {
    /// Reserve a (device, nonce) pair for `ttl_seconds`. Returns true when
    /// the nonce was fresh and is now burned; false on reuse. The
    /// reservation itself is the serialization point for at-least-once
    /// replay detection under concurrency.
    async fn reserve_nonce(
        &self,
        device_id: &str,
        nonce: &str,
        ttl_seconds: i64,
    ) -> Result<bool, anyhow::Error>;

    /// Record a verification failure for the device; returns the running
    /// count within the window.
    async fn record_failure(
        &self,
        device_id: &str,
        window_seconds: i64,
    ) -> Result<i64, anyhow::Error>;

    async fn clear_failures(&self, device_id: &str) -> Result<(), anyhow::Error>;

    async fn lock_out(&self, device_id: &str, ttl_seconds: i64) -> Result<(), anyhow::Error>;

    async fn is_locked_out(&self, device_id: &str) -> Result<bool, anyhow::Error>;

    async fn health_check(&self) -> Result<(), anyhow::Error>;
}

#[derive(Clone)]
pub struct RedisNonceCache {
    _client: Client,
    manager: ConnectionManager,
}

impl RedisNonceCache {
    pub async fn new(url: &str) -> Result<Self, anyhow::Error> {
        tracing::info!(url = %url, "Connecting to Redis");
        let client = Client::open(url.to_string())?;

        // ConnectionManager reconnects automatically
        let manager = client.get_connection_manager().await.map_err(|e| {
            tracing::error!("Failed to get Redis connection manager: {}", e);
            anyhow::anyhow!("Failed to connect to Redis: {}", e)
        })?;

        tracing::info!("Successfully connected to Redis");

        Ok(Self {
            _client: client,
            manager,
        })
    }

    fn nonce_key(device_id: &str, nonce: &str) -> String {
        format!("nonce:{}:{}", device_id, nonce)
    }

    fn failure_key(device_id: &str) -> String {
        format!("sigfail:{}", device_id)
    }

    fn lockout_key(device_id: &str) -> String {
        format!("lockout:{}", device_id)
    }
}

#[async_trait]
impl NonceCache for RedisNonceCache {
    async fn reserve_nonce(
        &self,
        device_id: &str,
        nonce: &str,
        ttl_seconds: i64,
    ) -> Result<bool, anyhow::Error> {
        let mut conn = self.manager.clone();

        // SET NX EX: exactly one caller wins the reservation
        let reserved: Option<String> = redis::cmd("SET")
            .arg(Self::nonce_key(device_id, nonce))
            .arg("1")
            .arg("NX")
            .arg("EX")
            .arg(ttl_seconds)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to reserve nonce: {}", e))?;

        Ok(reserved.is_some())
    }

    async fn record_failure(
        &self,
        device_id: &str,
        window_seconds: i64,
    ) -> Result<i64, anyhow::Error> {
        let mut conn = self.manager.clone();
        let key = Self::failure_key(device_id);

        let count: i64 = redis::cmd("INCR")
            .arg(&key)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to record failure: {}", e))?;

        // Start the window on the first failure
        if count == 1 {
            redis::cmd("EXPIRE")
                .arg(&key)
                .arg(window_seconds)
                .query_async::<_, ()>(&mut conn)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to expire failure counter: {}", e))?;
        }

        Ok(count)
    }

    async fn clear_failures(&self, device_id: &str) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("DEL")
            .arg(Self::failure_key(device_id))
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to clear failures: {}", e))
    }

    async fn lock_out(&self, device_id: &str, ttl_seconds: i64) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("SET")
            .arg(Self::lockout_key(device_id))
            .arg("1")
            .arg("EX")
            .arg(ttl_seconds)
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to set lockout: {}", e))
    }

    async fn is_locked_out(&self, device_id: &str) -> Result<bool, anyhow::Error> {
        let mut conn = self.manager.clone();
        let exists: bool = redis::cmd("EXISTS")
            .arg(Self::lockout_key(device_id))
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to check lockout: {}", e))?;
        Ok(exists)
    }

    async fn health_check(&self) -> Result<(), anyhow::Error> {
        let mut conn = self.manager.clone();
        redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| anyhow::anyhow!("Redis health check failed: {}", e))
    }
}

/// In-memory nonce cache with TTL bookkeeping.
#[derive(Default)]
pub struct MemoryNonceCache {
    nonces: Mutex<HashMap<String, DateTime<Utc>>>,
    failures: Mutex<HashMap<String, (i64, DateTime<Utc>)>>,
    lockouts: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl MemoryNonceCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_err() -> anyhow::Error {
        anyhow::anyhow!("Nonce cache mutex poisoned")
    }
}

#[async_trait]
impl NonceCache for MemoryNonceCache {
    async fn reserve_nonce(
        &self,
        device_id: &str,
        nonce: &str,
        ttl_seconds: i64,
    ) -> Result<bool, anyhow::Error> {
        let mut nonces = self.nonces.lock().map_err(|_| Self::lock_err())?;
        let now = Utc::now();
        nonces.retain(|_, expiry| *expiry > now);

        let key = format!("{}:{}", device_id, nonce);
        if nonces.contains_key(&key) {
            return Ok(false);
        }
        nonces.insert(key, now + Duration::seconds(ttl_seconds));
        Ok(true)
    }

    async fn record_failure(
        &self,
        device_id: &str,
        window_seconds: i64,
    ) -> Result<i64, anyhow::Error> {
        let mut failures = self.failures.lock().map_err(|_| Self::lock_err())?;
        let now = Utc::now();

        let entry = failures
            .entry(device_id.to_string())
            .and_modify(|(count, expiry)| {
                if *expiry <= now {
                    *count = 0;
                    *expiry = now + Duration::seconds(window_seconds);
                }
                *count += 1;
            })
            .or_insert((1, now + Duration::seconds(window_seconds)));

        Ok(entry.0)
    }

    async fn clear_failures(&self, device_id: &str) -> Result<(), anyhow::Error> {
        let mut failures = self.failures.lock().map_err(|_| Self::lock_err())?;
        failures.remove(device_id);
        Ok(())
    }

    async fn lock_out(&self, device_id: &str, ttl_seconds: i64) -> Result<(), anyhow::Error> {
        let mut lockouts = self.lockouts.lock().map_err(|_| Self::lock_err())?;
        lockouts.insert(
            device_id.to_string(),
            Utc::now() + Duration::seconds(ttl_seconds),
        );
        Ok(())
    }

    async fn is_locked_out(&self, device_id: &str) -> Result<bool, anyhow::Error> {
        let mut lockouts = self.lockouts.lock().map_err(|_| Self::lock_err())?;
        let now = Utc::now();
        lockouts.retain(|_, expiry| *expiry > now);
        Ok(lockouts.contains_key(device_id))
    }

    async fn health_check(&self) -> Result<(), anyhow::Error> {
        Ok(())
    }
}
