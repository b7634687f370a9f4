//! Storage seams for armada.
//!
//! Three stores, each behind an async trait with an in-memory twin:
//!
//! - [`CacheBackend`]: the liveness cache holding worker leases, the cached
//!   allocated-CPU counter and cancellation flags. Never authoritative.
//! - [`Ledger`]: the durable record of jobs and resource allocations.
//! - [`QueueBackend`]: the work queue carrying dispatches to workers.
//!
//! Concrete backends are selected with cargo features (`memory`, `valkey`,
//! `postgres`) and built from [`StateConfig`] by [`StateProvider`].

mod error;
mod traits;
mod types;

#[cfg(feature = "memory")]
mod memory;

#[cfg(feature = "valkey")]
mod valkey;

#[cfg(feature = "postgres")]
mod postgres;

#[cfg(feature = "config")]
mod config;

#[cfg(feature = "config")]
mod provider;

pub use error::{CacheError, LedgerError, QueueError, StateError};
pub use traits::{CacheBackend, Ledger, QueueBackend};
pub use types::{
    Allocation, AllocationStatus, JobId, JobRecord, JobSpec, JobState, Message, MessageId,
};

#[cfg(feature = "memory")]
pub use memory::{MemoryCache, MemoryLedger, MemoryQueue};

#[cfg(feature = "valkey")]
pub use valkey::ValkeyCache;

#[cfg(feature = "postgres")]
pub use postgres::{PostgresLedger, PostgresQueue};

#[cfg(feature = "config")]
pub use config::{CacheConfig, LedgerConfig, QueueConfig, StateConfig};

#[cfg(feature = "config")]
pub use provider::StateProvider;
