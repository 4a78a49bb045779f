//! Shared-store primitives: the dedup lock and the message metrics counters.
//!
//! Both live in Redis, the only state shared across worker processes. Each
//! is a narrow trait with a Redis implementation so dispatch code can be
//! exercised against in-memory fakes.

use async_trait::async_trait;
use chrono::Local;
use redis::aio::ConnectionManager;
use sha2::{Digest, Sha256};
use std::time::Duration;

use sw_common::{DispatchError, Result};

pub mod metrics;

pub use metrics::{MetricsStore, RedisMetricsStore};

/// Fingerprint of a raw payload, used as the dedup key.
///
/// Computed over the raw bytes, not the parsed form: two logically identical
/// messages with different incidental encoding get different fingerprints.
pub fn fingerprint(payload: &[u8]) -> String {
    hex::encode(Sha256::digest(payload))
}

/// Short-lived distributed mutual exclusion keyed by message fingerprint.
#[async_trait]
pub trait DedupLock: Send + Sync {
    /// Returns true exactly once per fingerprint within the TTL window.
    /// There is no unlock; release is purely time-based.
    async fn try_acquire(&self, fingerprint: &str, ttl: Duration) -> Result<bool>;
}

pub struct RedisDedupLock {
    conn: ConnectionManager,
}

impl RedisDedupLock {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl DedupLock for RedisDedupLock {
    async fn try_acquire(&self, fingerprint: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();

        // SET NX EX: atomic set-if-absent with expiry. Replies OK on the
        // winning call and nil on every later call before expiry.
        let reply: Option<String> = redis::cmd("SET")
            .arg(fingerprint)
            .arg("locked")
            .arg("NX")
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await
            .map_err(|e| DispatchError::Store(format!("dedup lock: {e}")))?;

        Ok(reply.is_some())
    }
}

/// Open a shared Redis connection manager for the lock and metrics stores.
pub async fn connect(redis_url: &str) -> Result<ConnectionManager> {
    let client = redis::Client::open(redis_url)
        .map_err(|e| DispatchError::Store(format!("redis url: {e}")))?;

    client
        .get_connection_manager()
        .await
        .map_err(|e| DispatchError::Store(format!("redis connect: {e}")))
}

/// Metrics hash key for a given local date.
pub fn metrics_key_for_today() -> String {
    metrics::metrics_key(Local::now().date_naive())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_deterministic_hex() {
        let a = fingerprint(b"{\"msg\":1}");
        let b = fingerprint(b"{\"msg\":1}");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn fingerprint_is_encoding_sensitive() {
        // Same logical content, different byte encoding: distinct keys.
        assert_ne!(fingerprint(b"{\"a\":1,\"b\":2}"), fingerprint(b"{\"b\":2,\"a\":1}"));
    }
}
