//! Valkey/Redis adapter for the liveness cache.

use std::time::Duration;

use async_trait::async_trait;
use deadpool_redis::{Config, Connection, Pool, Runtime};
use redis::AsyncCommands;
use tracing::debug;

use crate::error::CacheError;
use crate::traits::CacheBackend;

/// Valkey/Redis cache backend.
///
/// Leases map onto `SET EX`, prefix scans onto `SCAN MATCH` and the
/// allocated-CPU counter onto `INCRBY`, so every operation is a single
/// server-side command.
#[derive(Clone)]
pub struct ValkeyCache {
    pool: Pool,
    namespace: Option<String>,
}

impl ValkeyCache {
    /// Create a new Valkey cache backend and check the server answers.
    pub async fn new(
        url: &str,
        namespace: Option<String>,
        pool_size: usize,
    ) -> Result<Self, CacheError> {
        let config = Config::from_url(url);
        let pool = config
            .builder()
            .map_err(|e| CacheError::Connection(e.to_string()))?
            .max_size(pool_size)
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| CacheError::Connection(e.to_string()))?;

        let cache = Self { pool, namespace };
        let mut conn = cache.conn().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut *conn)
            .await
            .map_err(|e| CacheError::Connection(e.to_string()))?;

        debug!(pool_size, namespace = ?cache.namespace, "valkey cache ready");
        Ok(cache)
    }

    async fn conn(&self) -> Result<Connection, CacheError> {
        self.pool
            .get()
            .await
            .map_err(|e| CacheError::Connection(e.to_string()))
    }

    fn prefixed_key(&self, key: &str) -> String {
        match &self.namespace {
            Some(ns) => format!("{ns}:{key}"),
            None => key.to_string(),
        }
    }

    fn strip_prefix<'a>(&self, key: &'a str) -> &'a str {
        match &self.namespace {
            Some(ns) => key
                .strip_prefix(ns)
                .and_then(|k| k.strip_prefix(':'))
                .unwrap_or(key),
            None => key,
        }
    }
}

#[async_trait]
impl CacheBackend for ValkeyCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let mut conn = self.conn().await?;
        conn.get(self.prefixed_key(key))
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))
    }

    async fn put(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), CacheError> {
        let mut conn = self.conn().await?;
        let prefixed = self.prefixed_key(key);

        match ttl {
            Some(duration) => {
                let seconds = duration.as_secs().max(1);
                conn.set_ex::<_, _, ()>(&prefixed, value, seconds)
                    .await
                    .map_err(|e| CacheError::Backend(e.to_string()))?;
            }
            None => {
                conn.set::<_, _, ()>(&prefixed, value)
                    .await
                    .map_err(|e| CacheError::Backend(e.to_string()))?;
            }
        }

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn().await?;
        let deleted: i64 = conn
            .del(self.prefixed_key(key))
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))?;
        Ok(deleted > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.conn().await?;
        conn.exists(self.prefixed_key(key))
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))
    }

    async fn list(
        &self,
        prefix: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<(Vec<String>, Option<String>), CacheError> {
        let mut conn = self.conn().await?;

        let pattern = self.prefixed_key(&format!("{prefix}*"));
        let start_cursor: u64 = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);

        let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(start_cursor)
            .arg("MATCH")
            .arg(&pattern)
            .arg("COUNT")
            .arg(limit)
            .query_async(&mut *conn)
            .await
            .map_err(|e| CacheError::Backend(e.to_string()))?;

        let stripped_keys: Vec<String> = keys
            .into_iter()
            .map(|k| self.strip_prefix(&k).to_string())
            .collect();

        let next = if next_cursor == 0 {
            None
        } else {
            Some(next_cursor.to_string())
        };

        Ok((stripped_keys, next))
    }

    async fn incr_by(&self, key: &str, delta: i64) -> Result<i64, CacheError> {
        let mut conn = self.conn().await?;
        let prefixed = self.prefixed_key(key);
        conn.incr(&prefixed, delta).await.map_err(|e| {
            let message = e.to_string();
            if message.contains("not an integer") {
                CacheError::NotAnInteger { key: key.to_owned() }
            } else {
                CacheError::Backend(message)
            }
        })
    }
}

impl std::fmt::Debug for ValkeyCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValkeyCache")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}
