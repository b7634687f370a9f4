use serde::Deserialize;

/// Backend selection for the three stores.
///
/// Every section defaults to the in-memory backend, which is only useful for
/// tests and single-process experiments.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct StateConfig {
    pub cache: CacheConfig,
    pub ledger: LedgerConfig,
    pub queue: QueueConfig,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum CacheConfig {
    #[default]
    Memory,
    #[cfg(feature = "valkey")]
    Valkey {
        url: String,
        #[serde(default)]
        namespace: Option<String>,
        #[serde(default = "default_pool_size")]
        pool_size: usize,
    },
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum LedgerConfig {
    #[default]
    Memory,
    #[cfg(feature = "postgres")]
    Postgres {
        url: String,
        #[serde(default = "default_max_connections")]
        max_connections: u32,
    },
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum QueueConfig {
    #[default]
    Memory,
    #[cfg(feature = "postgres")]
    Postgres {
        url: String,
        #[serde(default = "default_queue_table")]
        table: String,
        #[serde(default = "default_max_connections")]
        max_connections: u32,
    },
}

impl CacheConfig {
    /// Short backend name for logs.
    pub const fn backend_name(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            #[cfg(feature = "valkey")]
            Self::Valkey { .. } => "valkey",
        }
    }
}

#[cfg(feature = "valkey")]
const fn default_pool_size() -> usize {
    10
}

#[cfg(feature = "postgres")]
const fn default_max_connections() -> u32 {
    10
}

#[cfg(feature = "postgres")]
fn default_queue_table() -> String {
    "armada_queue".to_owned()
}
