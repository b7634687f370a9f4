//! PostgreSQL ledger.
//!
//! `jobs` and `resource_allocations` are the durable source of truth. The
//! partial unique index on `resource_allocations (job_id)` enforces at most
//! one non-released allocation per job at the database level; every status
//! change happens under a row lock so concurrent writers observe each
//! transition exactly once.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgRow};
use sqlx::Row;
use tracing::{debug, warn};

use crate::error::LedgerError;
use crate::traits::Ledger;
use crate::types::{Allocation, AllocationStatus, JobId, JobRecord, JobSpec, JobState};

const JOB_COLUMNS: &str = "id, cpus_required, script, environment, time_limit_secs, state, \
                           submitted_at, start_time, end_time, exit_code, error_msg";

const ALLOCATION_COLUMNS: &str = "id, job_id, allocated_cpus, status, allocation_time, \
                                  allocated_time, released_time, process_id, process_host";

/// PostgreSQL-backed ledger.
#[derive(Clone)]
pub struct PostgresLedger {
    pool: PgPool,
}

impl PostgresLedger {
    /// Connect to PostgreSQL and create the tables if they don't exist.
    pub async fn new(url: &str, max_connections: u32) -> Result<Self, LedgerError> {
        let pool = super::connect(url, max_connections)
            .await
            .map_err(|e| LedgerError::Connection(e.to_string()))?;
        Self::from_pool(pool).await
    }

    /// Create a ledger from an existing connection pool.
    pub async fn from_pool(pool: PgPool) -> Result<Self, LedgerError> {
        let ledger = Self { pool };
        ledger.ensure_schema().await?;
        Ok(ledger)
    }

    async fn ensure_schema(&self) -> Result<(), LedgerError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                seq BIGSERIAL UNIQUE,
                id TEXT PRIMARY KEY,
                cpus_required INTEGER NOT NULL CHECK (cpus_required > 0),
                script TEXT NOT NULL,
                environment JSONB NOT NULL DEFAULT '{}'::jsonb,
                time_limit_secs BIGINT,
                state TEXT NOT NULL,
                submitted_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                start_time TIMESTAMPTZ,
                end_time TIMESTAMPTZ,
                exit_code INTEGER,
                error_msg TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS resource_allocations (
                id BIGSERIAL PRIMARY KEY,
                job_id TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
                allocated_cpus INTEGER NOT NULL,
                status TEXT NOT NULL,
                allocation_time TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                allocated_time TIMESTAMPTZ,
                released_time TIMESTAMPTZ,
                process_id INTEGER,
                process_host TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        sqlx::query(
            "ALTER TABLE resource_allocations ADD COLUMN IF NOT EXISTS process_host TEXT",
        )
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        sqlx::query(
            r#"
            CREATE UNIQUE INDEX IF NOT EXISTS idx_resource_allocations_live
            ON resource_allocations (job_id)
            WHERE status <> 'released'
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_resource_allocations_status
            ON resource_allocations (status, allocation_time)
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_jobs_state_seq
            ON jobs (state, seq)
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        debug!("ledger schema ready");
        Ok(())
    }

    fn row_to_job(row: &PgRow) -> Result<JobRecord, LedgerError> {
        let id: String = row.get("id");
        let cpus_required: i32 = row.get("cpus_required");
        let environment: serde_json::Value = row.get("environment");
        let time_limit_secs: Option<i64> = row.get("time_limit_secs");
        let state_str: String = row.get("state");

        let environment: BTreeMap<String, String> = serde_json::from_value(environment)
            .map_err(|e| {
                LedgerError::Serialisation(format!("failed to deserialise environment: {e}"))
            })?;

        let state: JobState = state_str.parse().map_err(LedgerError::Serialisation)?;

        Ok(JobRecord {
            id: JobId::new(id),
            spec: JobSpec {
                cpus_required: to_u32(cpus_required, "cpus_required")?,
                script: row.get("script"),
                environment,
                time_limit: time_limit_secs
                    .and_then(|secs| u64::try_from(secs).ok())
                    .map(Duration::from_secs),
            },
            state,
            submitted_at: row.get("submitted_at"),
            start_time: row.get("start_time"),
            end_time: row.get("end_time"),
            exit_code: row.get("exit_code"),
            error_msg: row.get("error_msg"),
        })
    }

    fn row_to_allocation(row: &PgRow) -> Result<Allocation, LedgerError> {
        let job_id: String = row.get("job_id");
        let allocated_cpus: i32 = row.get("allocated_cpus");
        let status_str: String = row.get("status");
        let process_id: Option<i32> = row.get("process_id");

        let status: AllocationStatus = status_str.parse().map_err(LedgerError::Serialisation)?;

        Ok(Allocation {
            id: row.get("id"),
            job_id: JobId::new(job_id),
            allocated_cpus: to_u32(allocated_cpus, "allocated_cpus")?,
            status,
            allocation_time: row.get("allocation_time"),
            allocated_time: row.get("allocated_time"),
            released_time: row.get("released_time"),
            process_id: process_id.map(|pid| to_u32(pid, "process_id")).transpose()?,
            process_host: row.get("process_host"),
        })
    }

    async fn live_status(&self, id: &JobId) -> Result<Option<AllocationStatus>, LedgerError> {
        let row = sqlx::query(
            r#"
            SELECT status FROM resource_allocations
            WHERE job_id = $1 AND status <> 'released'
            "#,
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error)?;

        row.map(|r| {
            let status: String = r.get("status");
            status.parse().map_err(LedgerError::Serialisation)
        })
        .transpose()
    }
}

#[async_trait]
impl Ledger for PostgresLedger {
    async fn insert_job(&self, spec: JobSpec) -> Result<JobRecord, LedgerError> {
        spec.validate().map_err(LedgerError::InvalidJob)?;

        let environment = serde_json::to_value(&spec.environment).map_err(|e| {
            LedgerError::Serialisation(format!("failed to serialise environment: {e}"))
        })?;
        let time_limit_secs = spec
            .time_limit
            .map(|limit| i64::try_from(limit.as_secs()).unwrap_or(i64::MAX));

        let query = format!(
            r#"
            INSERT INTO jobs (id, cpus_required, script, environment, time_limit_secs, state)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING {JOB_COLUMNS}
            "#
        );

        let row = sqlx::query(&query)
            .bind(JobId::generate().as_str())
            .bind(to_i32(spec.cpus_required)?)
            .bind(&spec.script)
            .bind(&environment)
            .bind(time_limit_secs)
            .bind(JobState::Pending.as_str())
            .fetch_one(&self.pool)
            .await
            .map_err(db_error)?;

        Self::row_to_job(&row)
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<JobRecord>, LedgerError> {
        let query = format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;

        row.as_ref().map(Self::row_to_job).transpose()
    }

    async fn pending_jobs(&self, limit: usize) -> Result<Vec<JobRecord>, LedgerError> {
        let query = format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE state = 'pending'
            ORDER BY seq
            LIMIT $1
            "#
        );
        let rows = sqlx::query(&query)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;

        rows.iter().map(Self::row_to_job).collect()
    }

    async fn reserve(&self, id: &JobId, cpus: u32) -> Result<Allocation, LedgerError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let flipped = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'running', start_time = NOW()
            WHERE id = $1 AND state = 'pending'
            "#,
        )
        .bind(id.as_str())
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        if flipped.rows_affected() == 0 {
            let row = sqlx::query("SELECT state FROM jobs WHERE id = $1")
                .bind(id.as_str())
                .fetch_optional(&mut *tx)
                .await
                .map_err(db_error)?;

            return match row {
                None => Err(LedgerError::JobNotFound(id.clone())),
                Some(row) => {
                    let state: String = row.get("state");
                    Err(LedgerError::JobNotPending {
                        job_id: id.clone(),
                        state: state.parse().map_err(LedgerError::Serialisation)?,
                    })
                }
            };
        }

        let query = format!(
            r#"
            INSERT INTO resource_allocations (job_id, allocated_cpus, status)
            VALUES ($1, $2, 'reserved')
            RETURNING {ALLOCATION_COLUMNS}
            "#
        );
        let row = sqlx::query(&query)
            .bind(id.as_str())
            .bind(to_i32(cpus)?)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| {
                if e.as_database_error()
                    .is_some_and(sqlx::error::DatabaseError::is_unique_violation)
                {
                    warn!(job_id = %id, "live allocation already exists, rolling back");
                    LedgerError::AllocationConflict(id.clone())
                } else {
                    db_error(e)
                }
            })?;

        let allocation = Self::row_to_allocation(&row)?;
        tx.commit().await.map_err(db_error)?;
        Ok(allocation)
    }

    async fn abandon_reservation(&self, id: &JobId) -> Result<(), LedgerError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        let released = sqlx::query(
            r#"
            UPDATE resource_allocations
            SET status = 'released', released_time = NOW()
            WHERE job_id = $1 AND status = 'reserved'
            "#,
        )
        .bind(id.as_str())
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        if released.rows_affected() == 0 {
            drop(tx);
            return Err(LedgerError::NotReserved {
                job_id: id.clone(),
                found: self.live_status(id).await?,
            });
        }

        sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'pending', start_time = NULL
            WHERE id = $1 AND state = 'running'
            "#,
        )
        .bind(id.as_str())
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        tx.commit().await.map_err(db_error)
    }

    async fn promote(&self, id: &JobId) -> Result<Allocation, LedgerError> {
        let query = format!(
            r#"
            UPDATE resource_allocations
            SET status = 'allocated', allocated_time = NOW()
            WHERE job_id = $1 AND status = 'reserved'
            RETURNING {ALLOCATION_COLUMNS}
            "#
        );
        let row = sqlx::query(&query)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;

        match row {
            Some(row) => Self::row_to_allocation(&row),
            None => Err(LedgerError::NotReserved {
                job_id: id.clone(),
                found: self.live_status(id).await?,
            }),
        }
    }

    async fn attach_process(&self, id: &JobId, pid: u32, host: &str) -> Result<(), LedgerError> {
        let result = sqlx::query(
            r#"
            UPDATE resource_allocations
            SET process_id = $2, process_host = $3
            WHERE job_id = $1 AND status <> 'released'
            "#,
        )
        .bind(id.as_str())
        .bind(to_i32(pid)?)
        .bind(host)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::NotReserved {
                job_id: id.clone(),
                found: None,
            });
        }
        Ok(())
    }

    async fn release(&self, id: &JobId) -> Result<Option<Allocation>, LedgerError> {
        let mut tx = self.pool.begin().await.map_err(db_error)?;

        // A concurrent releaser blocks on the row lock and then sees the row
        // as released, so only one caller gets the prior row back.
        let query = format!(
            r#"
            SELECT {ALLOCATION_COLUMNS} FROM resource_allocations
            WHERE job_id = $1 AND status <> 'released'
            FOR UPDATE
            "#
        );
        let row = sqlx::query(&query)
            .bind(id.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_error)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let prior = Self::row_to_allocation(&row)?;

        sqlx::query(
            r#"
            UPDATE resource_allocations
            SET status = 'released', released_time = NOW()
            WHERE id = $1
            "#,
        )
        .bind(prior.id)
        .execute(&mut *tx)
        .await
        .map_err(db_error)?;

        tx.commit().await.map_err(db_error)?;
        Ok(Some(prior))
    }

    async fn active_allocation(&self, id: &JobId) -> Result<Option<Allocation>, LedgerError> {
        let query = format!(
            r#"
            SELECT {ALLOCATION_COLUMNS} FROM resource_allocations
            WHERE job_id = $1 AND status <> 'released'
            "#
        );
        let row = sqlx::query(&query)
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error)?;

        row.as_ref().map(Self::row_to_allocation).transpose()
    }

    async fn sum_allocated(&self) -> Result<u64, LedgerError> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(allocated_cpus), 0)::BIGINT AS total
            FROM resource_allocations
            WHERE status = 'allocated'
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(db_error)?;

        let total: i64 = row.get("total");
        u64::try_from(total)
            .map_err(|_| LedgerError::Serialisation(format!("negative allocated sum {total}")))
    }

    async fn finish_job(
        &self,
        id: &JobId,
        state: JobState,
        exit_code: Option<i32>,
        error: Option<&str>,
    ) -> Result<bool, LedgerError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = $2, end_time = NOW(), exit_code = $3, error_msg = $4
            WHERE id = $1 AND state IN ('pending', 'running')
            "#,
        )
        .bind(id.as_str())
        .bind(state.as_str())
        .bind(exit_code)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        if result.rows_affected() > 0 {
            return Ok(true);
        }

        match self.get_job(id).await? {
            Some(_) => Ok(false),
            None => Err(LedgerError::JobNotFound(id.clone())),
        }
    }

    async fn stale_reservations(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Allocation>, LedgerError> {
        let rows = sqlx::query(
            r#"
            SELECT ra.id, ra.job_id, ra.allocated_cpus, ra.status, ra.allocation_time,
                   ra.allocated_time, ra.released_time, ra.process_id, ra.process_host
            FROM resource_allocations ra
            JOIN jobs j ON j.id = ra.job_id
            WHERE ra.status = 'reserved'
              AND ra.allocation_time < $1
              AND j.state = 'running'
            ORDER BY ra.allocation_time
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error)?;

        rows.iter().map(Self::row_to_allocation).collect()
    }

    async fn orphaned_jobs(&self, cutoff: DateTime<Utc>) -> Result<Vec<JobRecord>, LedgerError> {
        let query = format!(
            r#"
            SELECT {JOB_COLUMNS} FROM jobs
            WHERE state = 'running' AND start_time < $1
            ORDER BY seq
            "#
        );
        let rows = sqlx::query(&query)
            .bind(cutoff)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error)?;

        rows.iter().map(Self::row_to_job).collect()
    }
}

impl std::fmt::Debug for PostgresLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresLedger").finish_non_exhaustive()
    }
}

fn db_error(error: sqlx::Error) -> LedgerError {
    if super::is_connection_error(&error) {
        LedgerError::Connection(error.to_string())
    } else {
        LedgerError::Backend(error.to_string())
    }
}

fn to_i32(value: u32) -> Result<i32, LedgerError> {
    i32::try_from(value).map_err(|_| LedgerError::InvalidJob(format!("{value} out of range")))
}

fn to_u32(value: i32, column: &str) -> Result<u32, LedgerError> {
    u32::try_from(value)
        .map_err(|_| LedgerError::Serialisation(format!("negative {column}: {value}")))
}
