//! PostgreSQL adapters for the ledger and the work queue.

mod ledger;
mod queue;

pub use ledger::PostgresLedger;
pub use queue::PostgresQueue;

use sqlx::postgres::{PgPool, PgPoolOptions};

/// Open a connection pool.
pub(crate) async fn connect(url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await
}

/// True when the error means the server could not be reached at all.
pub(crate) const fn is_connection_error(error: &sqlx::Error) -> bool {
    matches!(
        error,
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Tls(_)
    )
}
