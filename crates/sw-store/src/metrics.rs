//! Day-bucketed per-subsystem message counters.
//!
//! One Redis hash per day (`system_metrics_{date}`), one field per
//! subsystem. The hash gets a TTL on the first increment of the day so
//! stale counters clean themselves up.

use async_trait::async_trait;
use chrono::{Local, NaiveDate};
use redis::aio::ConnectionManager;
use tracing::debug;

use sw_common::{DispatchError, Result};

/// Best-effort message counters. Callers are expected to log and swallow
/// errors; a metrics failure must never fail the message that produced it.
#[async_trait]
pub trait MetricsStore: Send + Sync {
    async fn increment(&self, subsystem: &str) -> Result<()>;
}

pub fn metrics_key(date: NaiveDate) -> String {
    format!("system_metrics_{date}")
}

pub struct RedisMetricsStore {
    conn: ConnectionManager,
    expire_secs: i64,
}

impl RedisMetricsStore {
    pub fn new(conn: ConnectionManager, expire_secs: i64) -> Self {
        Self { conn, expire_secs }
    }
}

#[async_trait]
impl MetricsStore for RedisMetricsStore {
    async fn increment(&self, subsystem: &str) -> Result<()> {
        let key = metrics_key(Local::now().date_naive());
        let mut conn = self.conn.clone();

        let count: i64 = redis::cmd("HINCRBY")
            .arg(&key)
            .arg(subsystem)
            .arg(1)
            .query_async(&mut conn)
            .await
            .map_err(|e| DispatchError::Store(format!("metrics incr: {e}")))?;

        // TTL is -1 when the key exists without an expiry, i.e. this is the
        // first increment of the day.
        let ttl: i64 = redis::cmd("TTL")
            .arg(&key)
            .query_async(&mut conn)
            .await
            .map_err(|e| DispatchError::Store(format!("metrics ttl: {e}")))?;

        if ttl == -1 {
            let _: () = redis::cmd("EXPIRE")
                .arg(&key)
                .arg(self.expire_secs)
                .query_async(&mut conn)
                .await
                .map_err(|e| DispatchError::Store(format!("metrics expire: {e}")))?;
        }

        debug!(subsystem = subsystem, count = count, "recorded message metric");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_key_is_day_bucketed() {
        let date = NaiveDate::from_ymd_opt(2021, 4, 12).unwrap();
        assert_eq!(metrics_key(date), "system_metrics_2021-04-12");
    }
}
