//! Checkpoint and job storage backends.

pub mod memory;

#[cfg(feature = "postgres")]
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::types::{
    Checkpoint, CheckpointId, CheckpointPayload, CheckpointSet, FailureRecord, JobId, JobRecord,
    JobStatus, Stage,
};

/// Append-only checkpoint storage.
///
/// Checkpoints are never updated or deleted. Writes for one job must not
/// block or race with writes for another; reads may run concurrently.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Error type for store operations.
    type Error: std::error::Error + Send + Sync;

    /// Persist a stage output; assigns the next per-job sequence number.
    ///
    /// `stage` must be the stage that produces `payload`.
    async fn put(
        &self,
        job_id: JobId,
        stage: Stage,
        payload: CheckpointPayload,
    ) -> Result<CheckpointId, Self::Error>;

    /// The checkpoint with the highest sequence for a job.
    async fn latest(&self, job_id: JobId) -> Result<Option<Checkpoint>, Self::Error>;

    /// Every checkpoint of a job, by ascending sequence.
    async fn list(&self, job_id: JobId) -> Result<Vec<Checkpoint>, Self::Error>;

    /// Newest checkpoint per payload kind.
    async fn checkpoint_set(&self, job_id: JobId) -> Result<CheckpointSet, Self::Error> {
        Ok(CheckpointSet::from_checkpoints(self.list(job_id).await?))
    }
}

/// Job record storage.
///
/// Every mutating method is atomic per job. Methods taking `now` stamp
/// `updated_at` (and heartbeats) with it.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Error type for store operations.
    type Error: std::error::Error + Send + Sync;

    /// Register a new job. Fails if the id exists.
    async fn create_job(&self, record: JobRecord) -> Result<(), Self::Error>;

    /// Fetch a job record.
    async fn get_job(&self, job_id: JobId) -> Result<Option<JobRecord>, Self::Error>;

    /// Every job record, ordered by creation time then id.
    async fn list_jobs(&self) -> Result<Vec<JobRecord>, Self::Error>;

    /// Claim `stage` for execution.
    ///
    /// Returns `None` without changes when the job is terminal, has a pending
    /// cancel request, another stage is already claimed, or `stage` is not
    /// past `completed_stage`. On success sets status to the stage, records
    /// the claim and a heartbeat.
    async fn try_begin_stage(
        &self,
        job_id: JobId,
        stage: Stage,
        now: DateTime<Utc>,
    ) -> Result<Option<JobRecord>, Self::Error>;

    /// Refresh the heartbeat of the claimed stage.
    async fn heartbeat(&self, job_id: JobId, now: DateTime<Utc>) -> Result<(), Self::Error>;

    /// Release the claim and advance `completed_stage` to `stage`.
    async fn finish_stage(
        &self,
        job_id: JobId,
        stage: Stage,
        now: DateTime<Utc>,
    ) -> Result<JobRecord, Self::Error>;

    /// Drop a claim left behind by a dead worker, keeping status and progress.
    async fn clear_claim(&self, job_id: JobId, now: DateTime<Utc>) -> Result<JobRecord, Self::Error>;

    /// Set status directly (terminal transitions and failure reset on resume).
    ///
    /// Clears the claim. Leaving `Failed` also clears the failure record.
    async fn set_status(
        &self,
        job_id: JobId,
        status: JobStatus,
        now: DateTime<Utc>,
    ) -> Result<JobRecord, Self::Error>;

    /// Mark completed with the exporter's output reference.
    async fn complete(
        &self,
        job_id: JobId,
        output_ref: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<JobRecord, Self::Error>;

    /// Mark failed, clearing any claim.
    async fn fail(&self, job_id: JobId, failure: FailureRecord) -> Result<JobRecord, Self::Error>;

    /// Record a cancel request.
    async fn request_cancel(&self, job_id: JobId, now: DateTime<Utc>) -> Result<JobRecord, Self::Error>;

    /// Non-terminal jobs with a claimed stage, oldest heartbeat first.
    async fn list_in_flight(&self) -> Result<Vec<JobRecord>, Self::Error>;
}

pub use memory::{InMemoryStore, InMemoryStoreError};

#[cfg(feature = "postgres")]
pub use postgres::{PostgresConfig, PostgresError, PostgresStore};
