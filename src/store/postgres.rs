//! PostgreSQL checkpoint and job store for production use.
//!
//! ## Configuration
//!
//! All settings can be configured via environment variables:
//! - `DATABASE_URL`: PostgreSQL connection string (required)
//! - `DB_MAX_CONNECTIONS`: Maximum pool size (default: 10)
//! - `DB_MIN_CONNECTIONS`: Minimum idle connections (default: 2)
//! - `DB_CONNECT_TIMEOUT_SECS`: Connection timeout (default: 10)
//! - `DB_IDLE_TIMEOUT_SECS`: Idle connection timeout (default: 300)
//! - `DB_MAX_LIFETIME_SECS`: Max connection lifetime (default: 1800)
//!
//! ## Write isolation
//!
//! Checkpoint appends take a transaction-scoped advisory lock keyed by the job
//! id; job record updates lock the job's row. Writes to different jobs never
//! wait on each other.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Executor, Postgres, Row, Transaction};
use std::time::Duration;
use uuid::Uuid;

use crate::types::{
    Checkpoint, CheckpointId, CheckpointPayload, FailureRecord, JobId, JobRecord, JobStatus, Stage,
};
use super::{CheckpointStore, JobStore};

/// SQL schema for the job table.
pub const JOBS_TABLE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS edit_plan_jobs (
    job_id UUID PRIMARY KEY,
    spec JSONB NOT NULL,
    status TEXT NOT NULL,
    completed_stage TEXT,
    active_stage TEXT,
    heartbeat_at TIMESTAMPTZ,
    cancel_requested BOOLEAN NOT NULL DEFAULT FALSE,
    failure JSONB,
    output_ref TEXT,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_edit_plan_jobs_in_flight
    ON edit_plan_jobs(heartbeat_at) WHERE active_stage IS NOT NULL;
"#;

/// SQL schema for the append-only checkpoint table.
pub const CHECKPOINTS_TABLE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS edit_plan_checkpoints (
    checkpoint_id UUID PRIMARY KEY,
    job_id UUID NOT NULL,
    stage TEXT NOT NULL,
    sequence BIGINT NOT NULL,
    payload JSONB NOT NULL,
    digest TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,

    CONSTRAINT edit_plan_checkpoints_sequence_key UNIQUE (job_id, sequence)
);
"#;

const SELECT_JOB: &str = r#"
    SELECT job_id, spec, status, completed_stage, active_stage, heartbeat_at,
           cancel_requested, failure, output_ref, created_at, updated_at
    FROM edit_plan_jobs
"#;

const SELECT_CHECKPOINT: &str = r#"
    SELECT checkpoint_id, job_id, stage, sequence, payload, digest, created_at
    FROM edit_plan_checkpoints
"#;

/// Configuration for PostgreSQL connection pool.
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    /// Database connection URL.
    pub database_url: String,
    /// Maximum connections in pool (default: 10).
    pub max_connections: u32,
    /// Minimum idle connections to keep warm (default: 2).
    pub min_connections: u32,
    /// Connection acquire timeout in seconds (default: 10).
    pub connect_timeout_secs: u64,
    /// Idle connection timeout in seconds (default: 300 = 5 min).
    pub idle_timeout_secs: u64,
    /// Maximum connection lifetime in seconds (default: 1800 = 30 min).
    pub max_lifetime_secs: u64,
}

impl PostgresConfig {
    /// Load configuration from environment variables with production defaults.
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "postgresql://localhost/edit_plan".to_string()),
            max_connections: std::env::var("DB_MAX_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),
            min_connections: std::env::var("DB_MIN_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(2),
            connect_timeout_secs: std::env::var("DB_CONNECT_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(10),
            idle_timeout_secs: std::env::var("DB_IDLE_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(300),
            max_lifetime_secs: std::env::var("DB_MAX_LIFETIME_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(1800),
        }
    }
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Error type for PostgreSQL store.
#[derive(Debug, thiserror::Error)]
pub enum PostgresError {
    /// Database error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    /// JSON column could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Job not found.
    #[error("Job not found: {0}")]
    JobNotFound(JobId),
    /// Job id already registered.
    #[error("Job already exists: {0}")]
    JobExists(JobId),
    /// Payload does not belong to the named stage.
    #[error("Stage {stage} cannot checkpoint a {kind} payload")]
    StageMismatch {
        /// Stage given to `put`.
        stage: Stage,
        /// Payload kind.
        kind: &'static str,
    },
    /// A stored value is not a known enum name.
    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

/// PostgreSQL store.
///
/// Uses connection pooling with production-tuned settings.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new store with the given configuration.
    pub async fn new(config: PostgresConfig) -> Result<Self, sqlx::Error> {
        tracing::info!(
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            connect_timeout_secs = config.connect_timeout_secs,
            idle_timeout_secs = config.idle_timeout_secs,
            max_lifetime_secs = config.max_lifetime_secs,
            "Initializing PostgreSQL connection pool"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
            .max_lifetime(Duration::from_secs(config.max_lifetime_secs))
            .test_before_acquire(true)
            .connect(&config.database_url)
            .await?;

        Ok(Self { pool })
    }

    /// Create a store from environment variables.
    pub async fn from_env() -> Result<Self, sqlx::Error> {
        Self::new(PostgresConfig::from_env()).await
    }

    /// Create the tables if they do not exist.
    pub async fn migrate(&self) -> Result<(), sqlx::Error> {
        self.pool.execute(JOBS_TABLE_SCHEMA).await?;
        self.pool.execute(CHECKPOINTS_TABLE_SCHEMA).await?;
        tracing::info!("Edit plan schema ready");
        Ok(())
    }

    /// Get the connection pool for health checks.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check if the database is reachable.
    pub async fn is_healthy(&self) -> bool {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .is_ok()
    }

    /// Get pool statistics for monitoring.
    pub fn pool_stats(&self) -> PoolStats {
        PoolStats {
            size: self.pool.size(),
            idle: self.pool.num_idle(),
            max: self.pool.options().get_max_connections(),
        }
    }

    fn parse_job_row(row: &PgRow) -> Result<JobRecord, PostgresError> {
        let status: String = row.try_get("status")?;
        let failure: Option<serde_json::Value> = row.try_get("failure")?;

        Ok(JobRecord {
            job_id: JobId::new(row.try_get::<Uuid, _>("job_id")?),
            spec: serde_json::from_value(row.try_get("spec")?)?,
            status: JobStatus::from_str(&status)
                .ok_or_else(|| PostgresError::Corrupt(format!("unknown status {:?}", status)))?,
            completed_stage: parse_stage(row.try_get("completed_stage")?)?,
            active_stage: parse_stage(row.try_get("active_stage")?)?,
            heartbeat_at: row.try_get("heartbeat_at")?,
            cancel_requested: row.try_get("cancel_requested")?,
            failure: failure.map(serde_json::from_value).transpose()?,
            output_ref: row.try_get("output_ref")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    fn parse_checkpoint_row(row: &PgRow) -> Result<Checkpoint, PostgresError> {
        let stage: String = row.try_get("stage")?;
        let sequence: i64 = row.try_get("sequence")?;
        Ok(Checkpoint {
            checkpoint_id: CheckpointId::new(row.try_get("checkpoint_id")?),
            job_id: JobId::new(row.try_get("job_id")?),
            stage: Stage::from_str(&stage)
                .ok_or_else(|| PostgresError::Corrupt(format!("unknown stage {:?}", stage)))?,
            sequence: sequence.max(0) as u64,
            payload: serde_json::from_value(row.try_get("payload")?)?,
            digest: row.try_get("digest")?,
            created_at: row.try_get("created_at")?,
        })
    }

    async fn write_job(
        tx: &mut Transaction<'_, Postgres>,
        record: &JobRecord,
    ) -> Result<(), PostgresError> {
        let failure = record.failure.as_ref().map(serde_json::to_value).transpose()?;
        sqlx::query(
            r#"
            UPDATE edit_plan_jobs
            SET status = $2, completed_stage = $3, active_stage = $4, heartbeat_at = $5,
                cancel_requested = $6, failure = $7, output_ref = $8, updated_at = $9
            WHERE job_id = $1
            "#,
        )
        .bind(record.job_id.as_uuid())
        .bind(record.status.as_str())
        .bind(record.completed_stage.map(Stage::as_str))
        .bind(record.active_stage.map(Stage::as_str))
        .bind(record.heartbeat_at)
        .bind(record.cancel_requested)
        .bind(failure)
        .bind(record.output_ref.as_deref())
        .bind(record.updated_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }

    /// Apply `f` to a job record with its row locked.
    async fn update<T: Send>(
        &self,
        job_id: JobId,
        now: DateTime<Utc>,
        f: impl FnOnce(&mut JobRecord) -> T + Send,
    ) -> Result<T, PostgresError> {
        let mut tx = self.pool.begin().await?;
        let sql = format!("{} WHERE job_id = $1 FOR UPDATE", SELECT_JOB);
        let row = sqlx::query(&sql)
            .bind(job_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(PostgresError::JobNotFound(job_id))?;

        let mut record = Self::parse_job_row(&row)?;
        record.updated_at = now;
        let out = f(&mut record);
        Self::write_job(&mut tx, &record).await?;
        tx.commit().await?;
        Ok(out)
    }

    async fn fetch_jobs(&self, filter: &str) -> Result<Vec<JobRecord>, PostgresError> {
        let sql = format!("{} {}", SELECT_JOB, filter);
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(Self::parse_job_row).collect()
    }
}

fn parse_stage(value: Option<String>) -> Result<Option<Stage>, PostgresError> {
    value
        .map(|s| Stage::from_str(&s).ok_or_else(|| PostgresError::Corrupt(format!("unknown stage {:?}", s))))
        .transpose()
}

/// Advisory lock key for a job.
fn lock_key(job_id: JobId) -> i64 {
    job_id.as_uuid().as_u128() as i64
}

/// Pool statistics for monitoring.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PoolStats {
    /// Current pool size.
    pub size: u32,
    /// Number of idle connections.
    pub idle: usize,
    /// Maximum pool size.
    pub max: u32,
}

#[async_trait]
impl CheckpointStore for PostgresStore {
    type Error = PostgresError;

    async fn put(
        &self,
        job_id: JobId,
        stage: Stage,
        payload: CheckpointPayload,
    ) -> Result<CheckpointId, Self::Error> {
        if payload.stage() != stage {
            return Err(PostgresError::StageMismatch { stage, kind: payload.kind() });
        }
        let checkpoint_id = CheckpointId::generate();
        let digest = payload.digest();
        let json = serde_json::to_value(&payload)?;

        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(lock_key(job_id))
            .execute(&mut *tx)
            .await?;
        let sequence: i64 = sqlx::query(
            r#"
            INSERT INTO edit_plan_checkpoints
                (checkpoint_id, job_id, stage, sequence, payload, digest, created_at)
            SELECT $1, $2, $3, COALESCE(MAX(sequence), 0) + 1, $4, $5, $6
            FROM edit_plan_checkpoints
            WHERE job_id = $2
            RETURNING sequence
            "#,
        )
        .bind(checkpoint_id.as_uuid())
        .bind(job_id.as_uuid())
        .bind(stage.as_str())
        .bind(json)
        .bind(digest)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await?
        .try_get("sequence")?;
        tx.commit().await?;

        tracing::debug!(job_id = %job_id, stage = %stage, sequence, "Checkpoint stored");
        Ok(checkpoint_id)
    }

    async fn latest(&self, job_id: JobId) -> Result<Option<Checkpoint>, Self::Error> {
        let sql = format!("{} WHERE job_id = $1 ORDER BY sequence DESC LIMIT 1", SELECT_CHECKPOINT);
        let row = sqlx::query(&sql)
            .bind(job_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::parse_checkpoint_row).transpose()
    }

    async fn list(&self, job_id: JobId) -> Result<Vec<Checkpoint>, Self::Error> {
        let sql = format!("{} WHERE job_id = $1 ORDER BY sequence", SELECT_CHECKPOINT);
        let rows = sqlx::query(&sql)
            .bind(job_id.as_uuid())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::parse_checkpoint_row).collect()
    }
}

#[async_trait]
impl JobStore for PostgresStore {
    type Error = PostgresError;

    async fn create_job(&self, record: JobRecord) -> Result<(), Self::Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO edit_plan_jobs
                (job_id, spec, status, completed_stage, active_stage, heartbeat_at,
                 cancel_requested, failure, output_ref, created_at, updated_at)
            VALUES ($1, $2, $3, NULL, NULL, NULL, FALSE, NULL, NULL, $4, $5)
            ON CONFLICT (job_id) DO NOTHING
            "#,
        )
        .bind(record.job_id.as_uuid())
        .bind(serde_json::to_value(&record.spec)?)
        .bind(record.status.as_str())
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(PostgresError::JobExists(record.job_id));
        }
        Ok(())
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<JobRecord>, Self::Error> {
        let sql = format!("{} WHERE job_id = $1", SELECT_JOB);
        let row = sqlx::query(&sql)
            .bind(job_id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::parse_job_row).transpose()
    }

    async fn list_jobs(&self) -> Result<Vec<JobRecord>, Self::Error> {
        self.fetch_jobs("ORDER BY created_at, job_id").await
    }

    async fn try_begin_stage(
        &self,
        job_id: JobId,
        stage: Stage,
        now: DateTime<Utc>,
    ) -> Result<Option<JobRecord>, Self::Error> {
        self.update(job_id, now, |record| {
            if record.status.is_terminal()
                || record.active_stage.is_some()
                || record.cancel_requested
                || record.completed_stage >= Some(stage)
            {
                return None;
            }
            record.status = JobStatus::from(stage);
            record.active_stage = Some(stage);
            record.heartbeat_at = Some(now);
            Some(record.clone())
        })
        .await
    }

    async fn heartbeat(&self, job_id: JobId, now: DateTime<Utc>) -> Result<(), Self::Error> {
        let result = sqlx::query(
            r#"
            UPDATE edit_plan_jobs
            SET heartbeat_at = $2, updated_at = $2
            WHERE job_id = $1 AND active_stage IS NOT NULL
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(now)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 && self.get_job(job_id).await?.is_none() {
            return Err(PostgresError::JobNotFound(job_id));
        }
        Ok(())
    }

    async fn finish_stage(
        &self,
        job_id: JobId,
        stage: Stage,
        now: DateTime<Utc>,
    ) -> Result<JobRecord, Self::Error> {
        self.update(job_id, now, |record| {
            record.completed_stage = record.completed_stage.max(Some(stage));
            record.active_stage = None;
            record.heartbeat_at = None;
            record.clone()
        })
        .await
    }

    async fn clear_claim(&self, job_id: JobId, now: DateTime<Utc>) -> Result<JobRecord, Self::Error> {
        self.update(job_id, now, |record| {
            record.active_stage = None;
            record.heartbeat_at = None;
            record.clone()
        })
        .await
    }

    async fn set_status(
        &self,
        job_id: JobId,
        status: JobStatus,
        now: DateTime<Utc>,
    ) -> Result<JobRecord, Self::Error> {
        self.update(job_id, now, |record| {
            if record.status == JobStatus::Failed && status != JobStatus::Failed {
                record.failure = None;
            }
            record.status = status;
            record.active_stage = None;
            record.heartbeat_at = None;
            record.clone()
        })
        .await
    }

    async fn complete(
        &self,
        job_id: JobId,
        output_ref: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<JobRecord, Self::Error> {
        self.update(job_id, now, |record| {
            record.status = JobStatus::Completed;
            record.output_ref = output_ref;
            record.active_stage = None;
            record.heartbeat_at = None;
            record.clone()
        })
        .await
    }

    async fn fail(&self, job_id: JobId, failure: FailureRecord) -> Result<JobRecord, Self::Error> {
        let now = failure.failed_at;
        self.update(job_id, now, |record| {
            record.status = JobStatus::Failed;
            record.failure = Some(failure);
            record.active_stage = None;
            record.heartbeat_at = None;
            record.clone()
        })
        .await
    }

    async fn request_cancel(&self, job_id: JobId, now: DateTime<Utc>) -> Result<JobRecord, Self::Error> {
        self.update(job_id, now, |record| {
            record.cancel_requested = true;
            record.clone()
        })
        .await
    }

    async fn list_in_flight(&self) -> Result<Vec<JobRecord>, Self::Error> {
        self.fetch_jobs(
            r#"
            WHERE active_stage IS NOT NULL
              AND status NOT IN ('completed', 'failed', 'cancelled')
            ORDER BY heartbeat_at NULLS FIRST, job_id
            "#,
        )
        .await
    }
}
