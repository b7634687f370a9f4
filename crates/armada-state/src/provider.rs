use std::sync::Arc;

use crate::config::{CacheConfig, LedgerConfig, QueueConfig, StateConfig};
use crate::error::StateError;
use crate::traits::{CacheBackend, Ledger, QueueBackend};

#[cfg(feature = "memory")]
use crate::memory::{MemoryCache, MemoryLedger, MemoryQueue};

#[cfg(feature = "valkey")]
use crate::valkey::ValkeyCache;

#[cfg(feature = "postgres")]
use crate::postgres::{PostgresLedger, PostgresQueue};

/// Handles to the configured cache, ledger and queue.
#[derive(Clone, Default)]
pub struct StateProvider {
    cache: Option<Arc<dyn CacheBackend>>,
    ledger: Option<Arc<dyn Ledger>>,
    queue: Option<Arc<dyn QueueBackend>>,
}

impl StateProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build all three backends. Any connection failure is returned.
    pub async fn from_config(config: &StateConfig) -> Result<Self, StateError> {
        Ok(Self {
            cache: Some(Self::create_cache(&config.cache).await?),
            ledger: Some(Self::create_ledger(&config.ledger).await?),
            queue: Some(Self::create_queue(&config.queue).await?),
        })
    }

    #[must_use]
    pub fn with_cache(mut self, cache: Arc<dyn CacheBackend>) -> Self {
        self.cache = Some(cache);
        self
    }

    #[must_use]
    pub fn with_ledger(mut self, ledger: Arc<dyn Ledger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    #[must_use]
    pub fn with_queue(mut self, queue: Arc<dyn QueueBackend>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn cache(&self) -> Result<Arc<dyn CacheBackend>, StateError> {
        self.cache
            .clone()
            .ok_or_else(|| StateError::NotConfigured("cache".to_owned()))
    }

    pub fn ledger(&self) -> Result<Arc<dyn Ledger>, StateError> {
        self.ledger
            .clone()
            .ok_or_else(|| StateError::NotConfigured("ledger".to_owned()))
    }

    pub fn queue(&self) -> Result<Arc<dyn QueueBackend>, StateError> {
        self.queue
            .clone()
            .ok_or_else(|| StateError::NotConfigured("queue".to_owned()))
    }

    pub async fn create_cache(config: &CacheConfig) -> Result<Arc<dyn CacheBackend>, StateError> {
        match config {
            #[cfg(feature = "memory")]
            CacheConfig::Memory => Ok(Arc::new(MemoryCache::new())),

            #[cfg(feature = "valkey")]
            CacheConfig::Valkey {
                url,
                namespace,
                pool_size,
            } => {
                let cache = ValkeyCache::new(url, namespace.clone(), *pool_size)
                    .await
                    .map_err(|e| StateError::Connection(e.to_string()))?;
                Ok(Arc::new(cache))
            }

            #[allow(unreachable_patterns)]
            _ => Err(StateError::UnsupportedBackend(
                "No suitable cache backend enabled".to_owned(),
            )),
        }
    }

    pub async fn create_ledger(config: &LedgerConfig) -> Result<Arc<dyn Ledger>, StateError> {
        match config {
            #[cfg(feature = "memory")]
            LedgerConfig::Memory => Ok(Arc::new(MemoryLedger::new())),

            #[cfg(feature = "postgres")]
            LedgerConfig::Postgres {
                url,
                max_connections,
            } => {
                let ledger = PostgresLedger::new(url, *max_connections)
                    .await
                    .map_err(|e| StateError::Connection(e.to_string()))?;
                Ok(Arc::new(ledger))
            }

            #[allow(unreachable_patterns)]
            _ => Err(StateError::UnsupportedBackend(
                "No suitable ledger backend enabled".to_owned(),
            )),
        }
    }

    pub async fn create_queue(config: &QueueConfig) -> Result<Arc<dyn QueueBackend>, StateError> {
        match config {
            #[cfg(feature = "memory")]
            QueueConfig::Memory => Ok(Arc::new(MemoryQueue::new())),

            #[cfg(feature = "postgres")]
            QueueConfig::Postgres {
                url,
                table,
                max_connections,
            } => {
                let queue = PostgresQueue::new(url, table.clone(), *max_connections)
                    .await
                    .map_err(|e| StateError::Connection(e.to_string()))?;
                Ok(Arc::new(queue))
            }

            #[allow(unreachable_patterns)]
            _ => Err(StateError::UnsupportedBackend(
                "No suitable queue backend enabled".to_owned(),
            )),
        }
    }
}

impl std::fmt::Debug for StateProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateProvider")
            .field("cache", &self.cache.is_some())
            .field("ledger", &self.ledger.is_some())
            .field("queue", &self.queue.is_some())
            .finish()
    }
}
