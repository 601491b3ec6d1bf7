//! Redis-backed store.

use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use ::redis::aio::MultiplexedConnection;
use ::redis::{AsyncCommands, Client, RedisResult};
use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use super::{DistributedStore, StoreError, StoreResult};

/// A [`DistributedStore`] talking to Redis over one multiplexed connection.
///
/// The connection is opened on first use and dropped after any failed call so
/// the next call reconnects. Every round-trip, including connecting, is bounded
/// by `timeout`.
pub struct RedisStore {
    client: Client,
    conn: RwLock<Option<MultiplexedConnection>>,
    timeout: Duration,
}

impl RedisStore {
    /// Parse `url` without touching the network.
    pub fn open(url: &str, timeout: Duration) -> StoreResult<Self> {
        let client = Client::open(url).map_err(|e| StoreError::InvalidUrl(e.to_string()))?;
        Ok(Self {
            client,
            conn: RwLock::new(None),
            timeout,
        })
    }

    async fn connection(&self) -> StoreResult<MultiplexedConnection> {
        let cached = self.conn.read().clone();
        if let Some(conn) = cached {
            return Ok(conn);
        }

        debug!("Opening redis connection");
        let conn = self
            .bounded(self.client.get_multiplexed_async_connection())
            .await?;
        *self.conn.write() = Some(conn.clone());
        Ok(conn)
    }

    /// Run one redis future under the configured timeout.
    async fn bounded<T, F>(&self, fut: F) -> StoreResult<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                self.drop_connection();
                Err(StoreError::Redis(e))
            }
            Err(_) => {
                self.drop_connection();
                Err(StoreError::Timeout(self.timeout))
            }
        }
    }

    fn drop_connection(&self) {
        *self.conn.write() = None;
    }
}

fn expiry(ttl_secs: u64) -> i64 {
    i64::try_from(ttl_secs).unwrap_or(i64::MAX)
}

#[async_trait]
impl DistributedStore for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn window_hit(
        &self,
        key: &str,
        window_start: i64,
        member: &str,
        now: i64,
        ttl_secs: u64,
    ) -> StoreResult<u64> {
        let mut conn = self.connection().await?;

        let mut pipe = ::redis::pipe();
        pipe.atomic()
            .zrembyscore(key, "-inf", window_start)
            .ignore()
            .zcard(key)
            .zadd(key, member, now)
            .ignore()
            .expire(key, expiry(ttl_secs))
            .ignore();

        let (count,): (u64,) = self.bounded(pipe.query_async(&mut conn)).await?;
        Ok(count)
    }

    async fn window_remove(&self, key: &str, member: &str) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        let _: i64 = self.bounded(conn.zrem(key, member)).await?;
        Ok(())
    }

    async fn window_oldest(&self, key: &str) -> StoreResult<Option<i64>> {
        let mut conn = self.connection().await?;
        let oldest: Vec<(String, f64)> = self.bounded(conn.zrange_withscores(key, 0, 0)).await?;
        Ok(oldest.first().map(|(_, score)| *score as i64))
    }

    async fn hash_incr(
        &self,
        key: &str,
        fields: &[(&str, i64)],
        ttl_secs: u64,
    ) -> StoreResult<()> {
        let mut conn = self.connection().await?;

        let mut pipe = ::redis::pipe();
        pipe.atomic();
        for (field, delta) in fields {
            pipe.hincr(key, *field, *delta).ignore();
        }
        pipe.expire(key, expiry(ttl_secs)).ignore();

        let () = self.bounded(pipe.query_async(&mut conn)).await?;
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, i64>> {
        let mut conn = self.connection().await?;
        let fields: HashMap<String, i64> = self.bounded(conn.hgetall(key)).await?;
        Ok(fields)
    }
}
