// src/server/cache.rs
//
// Best-effort Redis cache for the realtime endpoint.
//
// The cache is an optimization, never a source of truth: every operation
// swallows connection, timeout, and protocol errors after logging them.
// Callers treat a failed read as a miss and a failed write/delete as a
// no-op. The service keeps running with the cache completely unavailable.

use redis::aio::ConnectionManager;
use redis::AsyncCommands;

/// Cache key for the latest sample of a device.
pub fn realtime_key(device_id: &str) -> String {
    format!("realtime:{}", device_id)
}

#[derive(Clone)]
pub struct Cache {
    // None = cache disabled (initial connection failed or test mode)
    inner: Option<ConnectionManager>,
}

impl Cache {
    /// Connect to Redis. A malformed URL is a configuration error; an
    /// unreachable server just disables the cache.
    pub async fn connect(cache_url: &str) -> Result<Self, String> {
        let client =
            redis::Client::open(cache_url).map_err(|e| format!("Invalid CACHE_URL: {}", e))?;

        match client.get_connection_manager().await {
            Ok(manager) => {
                tlog!("[cache] Connected");
                Ok(Self { inner: Some(manager) })
            }
            Err(e) => {
                tlog!("[cache] Initial connection failed, running without cache: {}", e);
                Ok(Self { inner: None })
            }
        }
    }

    /// A cache that never hits. Used when Redis is unavailable and in tests.
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    /// Best-effort read; failure degrades to a miss.
    pub async fn get(&self, key: &str) -> Option<String> {
        let mut conn = self.inner.clone()?;
        match conn.get::<_, Option<String>>(key).await {
            Ok(value) => value,
            Err(e) => {
                tlog!("[cache] Read failed for key {}: {}", key, e);
                None
            }
        }
    }

    /// Best-effort write with TTL; failure is a no-op.
    pub async fn set(&self, key: &str, value: &str, ttl_s: u64) {
        if let Some(mut conn) = self.inner.clone() {
            if let Err(e) = conn.set_ex::<_, _, ()>(key, value, ttl_s).await {
                tlog!("[cache] Write failed for key {}: {}", key, e);
            }
        }
    }

    /// Best-effort delete; failure is a no-op.
    pub async fn delete(&self, key: &str) {
        if let Some(mut conn) = self.inner.clone() {
            if let Err(e) = conn.del::<_, ()>(key).await {
                tlog!("[cache] Delete failed for key {}: {}", key, e);
            }
        }
    }

    /// Drop the realtime entry for a device (called after ingest writes).
    pub async fn invalidate_device(&self, device_id: &str) {
        self.delete(&realtime_key(device_id)).await;
    }
}
