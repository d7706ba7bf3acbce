//! In-memory checkpoint and job store.
//!
//! One mutex per job behind a map lock: the map lock is only held to find or
//! insert a job's slot, so writes to different jobs never contend.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};

use crate::types::{
    Checkpoint, CheckpointId, CheckpointPayload, FailureRecord, JobId, JobRecord, JobStatus, Stage,
};
use super::{CheckpointStore, JobStore};

/// Error type for in-memory store.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InMemoryStoreError {
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
}

#[derive(Debug, Default)]
struct JobSlot {
    record: Option<JobRecord>,
    checkpoints: Vec<Checkpoint>,
}

impl JobSlot {
    fn record_mut(&mut self, job_id: JobId) -> Result<&mut JobRecord, InMemoryStoreError> {
        self.record.as_mut().ok_or(InMemoryStoreError::JobNotFound(job_id))
    }
}

/// In-memory store for tests and single-process deployments.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    jobs: Arc<RwLock<BTreeMap<JobId, Arc<Mutex<JobSlot>>>>>,
}

impl InMemoryStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, job_id: JobId) -> Option<Arc<Mutex<JobSlot>>> {
        self.jobs.read().get(&job_id).cloned()
    }

    fn slot_or_insert(&self, job_id: JobId) -> Arc<Mutex<JobSlot>> {
        if let Some(slot) = self.slot(job_id) {
            return slot;
        }
        self.jobs.write().entry(job_id).or_default().clone()
    }

    /// Apply `f` to an existing job record under the job's lock.
    fn update<T>(
        &self,
        job_id: JobId,
        now: DateTime<Utc>,
        f: impl FnOnce(&mut JobRecord) -> T,
    ) -> Result<T, InMemoryStoreError> {
        let slot = self.slot(job_id).ok_or(InMemoryStoreError::JobNotFound(job_id))?;
        let mut slot = slot.lock();
        let record = slot.record_mut(job_id)?;
        record.updated_at = now;
        Ok(f(record))
    }

    /// Number of checkpoints stored for a job.
    pub fn checkpoint_count(&self, job_id: JobId) -> usize {
        self.slot(job_id).map_or(0, |slot| slot.lock().checkpoints.len())
    }

    /// Number of registered jobs.
    pub fn job_count(&self) -> usize {
        self.jobs
            .read()
            .values()
            .filter(|slot| slot.lock().record.is_some())
            .count()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryStore {
    type Error = InMemoryStoreError;

    async fn put(
        &self,
        job_id: JobId,
        stage: Stage,
        payload: CheckpointPayload,
    ) -> Result<CheckpointId, Self::Error> {
        if payload.stage() != stage {
            return Err(InMemoryStoreError::StageMismatch { stage, kind: payload.kind() });
        }
        let slot = self.slot_or_insert(job_id);
        let mut slot = slot.lock();
        let checkpoint = Checkpoint {
            checkpoint_id: CheckpointId::generate(),
            job_id,
            stage,
            sequence: slot.checkpoints.len() as u64 + 1,
            digest: payload.digest(),
            payload,
            created_at: Utc::now(),
        };
        let id = checkpoint.checkpoint_id;
        tracing::debug!(
            job_id = %job_id,
            stage = %stage,
            sequence = checkpoint.sequence,
            "Checkpoint stored"
        );
        slot.checkpoints.push(checkpoint);
        Ok(id)
    }

    async fn latest(&self, job_id: JobId) -> Result<Option<Checkpoint>, Self::Error> {
        Ok(self
            .slot(job_id)
            .and_then(|slot| slot.lock().checkpoints.last().cloned()))
    }

    async fn list(&self, job_id: JobId) -> Result<Vec<Checkpoint>, Self::Error> {
        Ok(self
            .slot(job_id)
            .map(|slot| slot.lock().checkpoints.clone())
            .unwrap_or_default())
    }
}

#[async_trait]
impl JobStore for InMemoryStore {
    type Error = InMemoryStoreError;

    async fn create_job(&self, record: JobRecord) -> Result<(), Self::Error> {
        let job_id = record.job_id;
        let slot = self.slot_or_insert(job_id);
        let mut slot = slot.lock();
        if slot.record.is_some() {
            return Err(InMemoryStoreError::JobExists(job_id));
        }
        slot.record = Some(record);
        Ok(())
    }

    async fn get_job(&self, job_id: JobId) -> Result<Option<JobRecord>, Self::Error> {
        Ok(self.slot(job_id).and_then(|slot| slot.lock().record.clone()))
    }

    async fn list_jobs(&self) -> Result<Vec<JobRecord>, Self::Error> {
        let mut records: Vec<JobRecord> = self
            .jobs
            .read()
            .values()
            .filter_map(|slot| slot.lock().record.clone())
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.job_id.cmp(&b.job_id)));
        Ok(records)
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
    }

    async fn heartbeat(&self, job_id: JobId, now: DateTime<Utc>) -> Result<(), Self::Error> {
        self.update(job_id, now, |record| {
            if record.active_stage.is_some() {
                record.heartbeat_at = Some(now);
            }
        })
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
    }

    async fn clear_claim(&self, job_id: JobId, now: DateTime<Utc>) -> Result<JobRecord, Self::Error> {
        self.update(job_id, now, |record| {
            record.active_stage = None;
            record.heartbeat_at = None;
            record.clone()
        })
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
    }

    async fn request_cancel(&self, job_id: JobId, now: DateTime<Utc>) -> Result<JobRecord, Self::Error> {
        self.update(job_id, now, |record| {
            record.cancel_requested = true;
            record.clone()
        })
    }

    async fn list_in_flight(&self) -> Result<Vec<JobRecord>, Self::Error> {
        let mut records: Vec<JobRecord> = self
            .list_jobs()
            .await?
            .into_iter()
            .filter(|r| r.active_stage.is_some() && !r.status.is_terminal())
            .collect();
        records.sort_by(|a, b| a.heartbeat_at.cmp(&b.heartbeat_at).then_with(|| a.job_id.cmp(&b.job_id)));
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AssetManifest, JobSpec, StyleProfile, RhythmAlignment};
    use uuid::Uuid;

    fn job(id: u128) -> JobRecord {
        JobRecord::new(JobId::new(Uuid::from_u128(id)), JobSpec::new("job", vec![]), Utc::now())
    }

    #[tokio::test]
    async fn test_checkpoint_sequence_and_latest() {
        let store = InMemoryStore::new();
        let id = JobId::new(Uuid::from_u128(1));

        assert!(store.latest(id).await.unwrap().is_none());

        store
            .put(id, Stage::Annotating, CheckpointPayload::Manifest(AssetManifest::default()))
            .await
            .unwrap();
        let profile = StyleProfile::new(2.0, RhythmAlignment::Bar, 0.2);
        store
            .put(id, Stage::StyleExtracting, CheckpointPayload::StyleProfile(profile))
            .await
            .unwrap();

        let latest = store.latest(id).await.unwrap().unwrap();
        assert_eq!(latest.sequence, 2);
        assert_eq!(latest.stage, Stage::StyleExtracting);
        assert!(latest.verify_digest());

        let set = store.checkpoint_set(id).await.unwrap();
        assert_eq!(set.furthest_stage(), Some(Stage::StyleExtracting));
        assert!(set.manifest().is_some());
    }

    #[tokio::test]
    async fn test_put_rejects_stage_mismatch() {
        let store = InMemoryStore::new();
        let err = store
            .put(
                JobId::new(Uuid::from_u128(1)),
                Stage::Planning,
                CheckpointPayload::Manifest(AssetManifest::default()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, InMemoryStoreError::StageMismatch { kind: "manifest", .. }));
    }

    #[tokio::test]
    async fn test_jobs_are_isolated() {
        let store = InMemoryStore::new();
        let a = JobId::new(Uuid::from_u128(1));
        let b = JobId::new(Uuid::from_u128(2));
        store
            .put(a, Stage::Annotating, CheckpointPayload::Manifest(AssetManifest::default()))
            .await
            .unwrap();
        assert_eq!(store.checkpoint_count(a), 1);
        assert_eq!(store.checkpoint_count(b), 0);
        assert!(store.latest(b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stage_claim_is_exclusive() {
        let store = InMemoryStore::new();
        let record = job(1);
        let id = record.job_id;
        store.create_job(record).await.unwrap();

        let now = Utc::now();
        let claimed = store.try_begin_stage(id, Stage::Uploading, now).await.unwrap().unwrap();
        assert_eq!(claimed.status, JobStatus::Uploading);
        assert_eq!(claimed.active_stage, Some(Stage::Uploading));

        assert!(store.try_begin_stage(id, Stage::Uploading, now).await.unwrap().is_none());

        let done = store.finish_stage(id, Stage::Uploading, now).await.unwrap();
        assert_eq!(done.completed_stage, Some(Stage::Uploading));
        assert!(done.active_stage.is_none());
        assert!(store.try_begin_stage(id, Stage::Annotating, now).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_completed_stage_cannot_be_reclaimed() {
        let store = InMemoryStore::new();
        let record = job(1);
        let id = record.job_id;
        store.create_job(record).await.unwrap();

        let now = Utc::now();
        store.try_begin_stage(id, Stage::Uploading, now).await.unwrap().unwrap();
        store.finish_stage(id, Stage::Uploading, now).await.unwrap();

        assert!(store.try_begin_stage(id, Stage::Uploading, now).await.unwrap().is_none());
        let current = store.get_job(id).await.unwrap().unwrap();
        assert!(current.active_stage.is_none());
        assert_eq!(current.completed_stage, Some(Stage::Uploading));
    }

    #[tokio::test]
    async fn test_duplicate_job_rejected() {
        let store = InMemoryStore::new();
        store.create_job(job(1)).await.unwrap();
        assert_eq!(
            store.create_job(job(1)).await.unwrap_err(),
            InMemoryStoreError::JobExists(JobId::new(Uuid::from_u128(1)))
        );
        assert_eq!(store.job_count(), 1);
    }

    #[tokio::test]
    async fn test_terminal_job_cannot_be_claimed() {
        let store = InMemoryStore::new();
        let record = job(1);
        let id = record.job_id;
        store.create_job(record).await.unwrap();
        store.set_status(id, JobStatus::Cancelled, Utc::now()).await.unwrap();
        assert!(store.try_begin_stage(id, Stage::Uploading, Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_in_flight_listing() {
        let store = InMemoryStore::new();
        let busy = job(1);
        let idle = job(2);
        let busy_id = busy.job_id;
        store.create_job(busy).await.unwrap();
        store.create_job(idle).await.unwrap();
        store.try_begin_stage(busy_id, Stage::Annotating, Utc::now()).await.unwrap();

        let in_flight = store.list_in_flight().await.unwrap();
        assert_eq!(in_flight.len(), 1);
        assert_eq!(in_flight[0].job_id, busy_id);
    }
}
