//! Job state machine.
//!
//! The next stage is always derived from persisted state: the furthest of the
//! job record's `completed_stage` and the newest checkpoint. `advance` and
//! `resume` share that path, so a resumed job skips every stage whose output
//! already exists.
//!
//! ## Stage claims
//!
//! A stage runs only after `try_begin_stage` atomically claims it. While it
//! runs a background task refreshes the claim's heartbeat. A claim whose
//! heartbeat is older than the staleness threshold belongs to a dead worker
//! and may be cleared by `resume` or `recover_interrupted`.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinHandle;

use super::stages::{CollaboratorError, Collaborators};
use crate::config::EngineConfig;
use crate::progress::{JobProgress, ProgressPublisher, StageProgress};
use crate::solver::{PlanningError, TimelineSolver};
use crate::store::{CheckpointStore, JobStore};
use crate::types::{
    AssetManifest, Blueprint, CheckpointId, CheckpointPayload, CheckpointSet, FailureKind,
    FailureRecord, JobId, JobRecord, JobSpec, JobStatus, ProgressBand, Stage, StyleProfile,
};

/// Error type for state machine calls.
///
/// These describe calls that could not act on a job. Stage failures are not
/// errors here; they are recorded on the job and reported as
/// [`StageResult::Failed`].
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum JobError {
    /// Job not found.
    #[error("Job not found: {0}")]
    NotFound(JobId),
    /// Another worker holds a live claim.
    #[error("Job {job_id} is already running stage {stage}")]
    StageInFlight {
        /// Job id.
        job_id: JobId,
        /// Claimed stage.
        stage: Stage,
    },
    /// Another worker completed the stage after this call read the job.
    #[error("Job {job_id} already completed stage {stage}")]
    StageCompleted {
        /// Job id.
        job_id: JobId,
        /// Stage that was already done.
        stage: Stage,
    },
    /// Job is in a terminal status.
    #[error("Job {job_id} is {status}")]
    Terminal {
        /// Job id.
        job_id: JobId,
        /// Terminal status.
        status: JobStatus,
    },
    /// Job cannot be resumed.
    #[error("Job {job_id} cannot be resumed: {reason}")]
    NotResumable {
        /// Job id.
        job_id: JobId,
        /// Why not.
        reason: String,
    },
    /// A stage's input checkpoint is absent.
    #[error("Job {job_id} has no {kind} checkpoint for stage {stage}")]
    MissingCheckpoint {
        /// Job id.
        job_id: JobId,
        /// Stage that needs it.
        stage: Stage,
        /// Payload kind.
        kind: &'static str,
    },
    /// Stored digest no longer matches the payload.
    #[error("Checkpoint {checkpoint_id} of job {job_id} failed digest verification")]
    CorruptCheckpoint {
        /// Job id.
        job_id: JobId,
        /// Checkpoint id.
        checkpoint_id: CheckpointId,
    },
    /// Storage backend error.
    #[error("Store error: {0}")]
    Store(String),
}

impl JobError {
    /// Wrap a storage backend error.
    pub fn from_store<E: std::error::Error>(e: E) -> Self {
        JobError::Store(e.to_string())
    }
}

/// Outcome of one `advance` or `resume` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum StageResult {
    /// A stage completed and the job can advance again.
    Advanced {
        /// Stage that ran.
        stage: Stage,
        /// Checkpoint written by the stage, if it produces one.
        checkpoint_id: Option<CheckpointId>,
        /// Stage the next call will run.
        next: Option<Stage>,
    },
    /// The job finished.
    Completed {
        /// Exporter's output reference.
        output_ref: Option<String>,
    },
    /// The stage failed; the failure is recorded on the job.
    Failed {
        /// Stage that failed.
        stage: Stage,
        /// Recorded failure.
        failure: FailureRecord,
    },
    /// A pending cancel request took effect.
    Cancelled,
}

impl StageResult {
    /// Whether the job can advance again.
    pub fn is_advanced(&self) -> bool {
        matches!(self, StageResult::Advanced { .. })
    }
}

/// What a stage produced.
enum StageOutput {
    Staged,
    Checkpoint(CheckpointPayload),
    Exported(String),
}

/// Checkpointed inputs a stage consumes.
enum StageInput<'a> {
    Fresh,
    Plan {
        manifest: &'a AssetManifest,
        style: Option<&'a StyleProfile>,
    },
    Export(&'a Blueprint),
}

struct StageFailure {
    kind: FailureKind,
    summary: String,
}

impl From<CollaboratorError> for StageFailure {
    fn from(e: CollaboratorError) -> Self {
        let kind = match e {
            CollaboratorError::Input(_) => FailureKind::Input,
            _ => FailureKind::Collaborator,
        };
        Self { kind, summary: e.to_string() }
    }
}

impl From<PlanningError> for StageFailure {
    fn from(e: PlanningError) -> Self {
        let kind = match e {
            PlanningError::Input(_) => FailureKind::Input,
            _ => FailureKind::Planning,
        };
        Self { kind, summary: e.to_string() }
    }
}

impl From<crate::types::InputError> for StageFailure {
    fn from(e: crate::types::InputError) -> Self {
        Self { kind: FailureKind::Input, summary: e.to_string() }
    }
}

/// Aborts the heartbeat task when the stage ends, however it ends.
struct HeartbeatGuard(JoinHandle<()>);

impl Drop for HeartbeatGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Drives jobs through their stages.
pub struct JobStateMachine<S> {
    store: Arc<S>,
    publisher: Arc<dyn ProgressPublisher>,
    collaborators: Collaborators,
    config: EngineConfig,
}

impl<S> Clone for JobStateMachine<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            publisher: self.publisher.clone(),
            collaborators: self.collaborators.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S> std::fmt::Debug for JobStateMachine<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobStateMachine")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S> JobStateMachine<S>
where
    S: CheckpointStore + JobStore + 'static,
{
    /// Create a state machine over a store, a progress sink and collaborators.
    pub fn new(
        store: Arc<S>,
        publisher: Arc<dyn ProgressPublisher>,
        collaborators: Collaborators,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            publisher,
            collaborators,
            config,
        }
    }

    /// Get the store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Get the configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Register a new job in `Created`.
    pub async fn create(&self, spec: JobSpec) -> Result<JobRecord, JobError> {
        let record = JobRecord::new(JobId::generate(), spec, Utc::now());
        self.store
            .create_job(record.clone())
            .await
            .map_err(JobError::from_store)?;

        tracing::info!(job_id = %record.job_id, name = %record.spec.name, "Job created");
        JobProgress::new(record.job_id, self.publisher.clone(), 0.0)
            .emit_status(JobStatus::Created, "Job created");
        Ok(record)
    }

    /// Fetch a job record.
    pub async fn get(&self, job_id: JobId) -> Result<JobRecord, JobError> {
        self.store
            .get_job(job_id)
            .await
            .map_err(JobError::from_store)?
            .ok_or(JobError::NotFound(job_id))
    }

    /// Run the next stage of an idle, non-terminal job.
    pub async fn advance(&self, job_id: JobId) -> Result<StageResult, JobError> {
        let record = self.get(job_id).await?;
        if record.status.is_terminal() {
            return Err(JobError::Terminal { job_id, status: record.status });
        }
        if let Some(stage) = record.active_stage {
            return Err(JobError::StageInFlight { job_id, stage });
        }
        self.step(record).await
    }

    /// Pick a job up again after a failure or an interruption.
    ///
    /// Failed jobs with a resumable failure are reset to their last completed
    /// stage. A stale claim is cleared; a live one is left alone. The next
    /// stage is then derived exactly as `advance` derives it.
    ///
    /// Planning reads only immutable checkpoints and is pure, so resuming a
    /// `Planning` failure fails again unless the planner configuration has
    /// changed since.
    pub async fn resume(&self, job_id: JobId) -> Result<StageResult, JobError> {
        let now = Utc::now();
        let mut record = self.get(job_id).await?;

        match record.status {
            JobStatus::Completed | JobStatus::Cancelled => {
                return Err(JobError::NotResumable {
                    job_id,
                    reason: format!("job is {}", record.status),
                });
            }
            JobStatus::Failed => {
                if let Some(failure) = record.failure.as_ref().filter(|f| !f.kind.is_resumable()) {
                    return Err(JobError::NotResumable {
                        job_id,
                        reason: format!("{} failure: {}", failure.kind, failure.summary),
                    });
                }
                let status = record.completed_stage.map_or(JobStatus::Created, JobStatus::from);
                record = self
                    .store
                    .set_status(job_id, status, now)
                    .await
                    .map_err(JobError::from_store)?;
                tracing::info!(job_id = %job_id, status = %status, "Resuming failed job");
            }
            _ => {
                if let Some(stage) = record.active_stage {
                    if !record.is_interrupted(now, self.config.staleness()) {
                        return Err(JobError::StageInFlight { job_id, stage });
                    }
                    tracing::warn!(job_id = %job_id, stage = %stage, "Clearing stale stage claim");
                    record = self
                        .store
                        .clear_claim(job_id, now)
                        .await
                        .map_err(JobError::from_store)?;
                }
            }
        }

        self.step(record).await
    }

    /// Request cancellation.
    ///
    /// An idle job is cancelled immediately. A running stage finishes first;
    /// the cancel takes effect at the next stage boundary.
    pub async fn cancel(&self, job_id: JobId) -> Result<JobRecord, JobError> {
        let record = self.get(job_id).await?;
        match record.status {
            JobStatus::Cancelled => return Ok(record),
            status if status.is_terminal() => return Err(JobError::Terminal { job_id, status }),
            _ => {}
        }

        let record = self
            .store
            .request_cancel(job_id, Utc::now())
            .await
            .map_err(JobError::from_store)?;
        if record.active_stage.is_some() {
            tracing::info!(job_id = %job_id, "Cancel requested, waiting for stage boundary");
            return Ok(record);
        }
        let progress = JobProgress::new(job_id, self.publisher.clone(), floor_of(&record));
        self.finish_cancel(job_id, &progress).await?;
        self.get(job_id).await
    }

    /// Advance until the job stops advancing.
    ///
    /// A stage finished concurrently by another worker is skipped, not
    /// reported.
    pub async fn run(&self, job_id: JobId) -> Result<StageResult, JobError> {
        loop {
            match self.advance(job_id).await {
                Ok(result) if result.is_advanced() => {}
                Err(JobError::StageCompleted { .. }) => {}
                other => return other,
            }
        }
    }

    /// Handle jobs left claimed by a dead worker.
    ///
    /// With `auto_resume` each one is resumed and run to a stop; otherwise it
    /// is marked failed as interrupted, which a later `resume` can pick up.
    pub async fn recover_interrupted(&self) -> Result<Vec<(JobId, Result<StageResult, JobError>)>, JobError> {
        let now = Utc::now();
        let staleness = self.config.staleness();
        let stale: Vec<JobRecord> = self
            .store
            .list_in_flight()
            .await
            .map_err(JobError::from_store)?
            .into_iter()
            .filter(|r| r.is_interrupted(now, staleness))
            .collect();

        let mut outcomes = Vec::with_capacity(stale.len());
        for record in stale {
            let job_id = record.job_id;
            tracing::warn!(
                job_id = %job_id,
                stage = ?record.active_stage,
                auto_resume = self.config.auto_resume,
                "Recovering interrupted job"
            );

            let outcome = if self.config.auto_resume {
                match self.resume(job_id).await {
                    Ok(result) if result.is_advanced() => self.run(job_id).await,
                    other => other,
                }
            } else {
                self.fail_interrupted(record).await
            };
            outcomes.push((job_id, outcome));
        }
        Ok(outcomes)
    }

    async fn fail_interrupted(&self, record: JobRecord) -> Result<StageResult, JobError> {
        let stage = record.active_stage.or(record.status.stage()).unwrap_or(Stage::Uploading);
        let failure = FailureRecord {
            kind: FailureKind::Interrupted,
            stage: Some(stage),
            summary: format!("worker stopped during {}", stage),
            failed_at: Utc::now(),
        };
        self.store
            .fail(record.job_id, failure.clone())
            .await
            .map_err(JobError::from_store)?;
        let progress = JobProgress::new(record.job_id, self.publisher.clone(), floor_of(&record));
        progress.emit_status(JobStatus::Failed, failure.summary.clone());
        progress.close();
        Ok(StageResult::Failed { stage, failure })
    }

    async fn finish_cancel(&self, job_id: JobId, progress: &JobProgress) -> Result<StageResult, JobError> {
        self.store
            .set_status(job_id, JobStatus::Cancelled, Utc::now())
            .await
            .map_err(JobError::from_store)?;
        tracing::info!(job_id = %job_id, "Job cancelled");
        progress.emit_status(JobStatus::Cancelled, "Job cancelled");
        progress.close();
        Ok(StageResult::Cancelled)
    }

    /// Shared body of `advance` and `resume` for an unclaimed job.
    async fn step(&self, record: JobRecord) -> Result<StageResult, JobError> {
        let job_id = record.job_id;
        let checkpoints = self
            .store
            .checkpoint_set(job_id)
            .await
            .map_err(JobError::from_store)?;
        for checkpoint in [&checkpoints.manifest, &checkpoints.style_profile, &checkpoints.blueprint]
            .into_iter()
            .flatten()
        {
            if !checkpoint.verify_digest() {
                return Err(JobError::CorruptCheckpoint {
                    job_id,
                    checkpoint_id: checkpoint.checkpoint_id,
                });
            }
        }

        let furthest = record.completed_stage.max(checkpoints.furthest_stage());
        let progress = JobProgress::new(
            job_id,
            self.publisher.clone(),
            furthest.map_or(0.0, |s| ProgressBand::for_stage(s).end),
        );

        if record.cancel_requested {
            return self.finish_cancel(job_id, &progress).await;
        }

        let Some(stage) = Stage::next_after(furthest, &record.spec) else {
            return self.finish(job_id, record.output_ref.clone(), &progress).await;
        };
        let input = stage_input(job_id, stage, &checkpoints)?;

        let now = Utc::now();
        let Some(claimed) = self
            .store
            .try_begin_stage(job_id, stage, now)
            .await
            .map_err(JobError::from_store)?
        else {
            let current = self.get(job_id).await?;
            if current.status.is_terminal() {
                return Err(JobError::Terminal { job_id, status: current.status });
            }
            if current.cancel_requested && current.active_stage.is_none() {
                return self.finish_cancel(job_id, &progress).await;
            }
            if current.completed_stage >= Some(stage) {
                tracing::debug!(job_id = %job_id, stage = %stage, "Stage completed by another worker");
                return Err(JobError::StageCompleted { job_id, stage });
            }
            return Err(JobError::StageInFlight {
                job_id,
                stage: current.active_stage.unwrap_or(stage),
            });
        };

        tracing::info!(job_id = %job_id, stage = %stage, resumed_from = ?furthest, "Stage started");
        let outcome = {
            let _heartbeat = self.spawn_heartbeat(job_id);
            self.execute(stage, &claimed, input, progress.stage(stage)).await
        };

        // A store error past this point leaves the claim in place; its
        // heartbeat has stopped, so recovery picks the job up once stale.
        match outcome {
            Ok(StageOutput::Exported(output_ref)) => {
                self.store
                    .finish_stage(job_id, stage, Utc::now())
                    .await
                    .map_err(JobError::from_store)?;
                self.finish(job_id, Some(output_ref), &progress).await
            }
            Ok(output) => {
                let checkpoint_id = match output {
                    StageOutput::Checkpoint(payload) => Some(
                        self.store
                            .put(job_id, stage, payload)
                            .await
                            .map_err(JobError::from_store)?,
                    ),
                    _ => None,
                };
                self.store
                    .finish_stage(job_id, stage, Utc::now())
                    .await
                    .map_err(JobError::from_store)?;
                let next = Stage::next_after(Some(stage), &claimed.spec);
                tracing::info!(
                    job_id = %job_id,
                    stage = %stage,
                    checkpoint_id = ?checkpoint_id,
                    next = ?next,
                    "Stage completed"
                );
                Ok(StageResult::Advanced { stage, checkpoint_id, next })
            }
            Err(StageFailure { kind, summary }) => {
                let failure = FailureRecord {
                    kind,
                    stage: Some(stage),
                    summary,
                    failed_at: Utc::now(),
                };
                self.store
                    .fail(job_id, failure.clone())
                    .await
                    .map_err(JobError::from_store)?;
                tracing::error!(
                    job_id = %job_id,
                    stage = %stage,
                    kind = %failure.kind,
                    error = %failure.summary,
                    "Stage failed"
                );
                progress.emit_status(JobStatus::Failed, failure.summary.clone());
                progress.close();
                Ok(StageResult::Failed { stage, failure })
            }
        }
    }

    async fn finish(
        &self,
        job_id: JobId,
        output_ref: Option<String>,
        progress: &JobProgress,
    ) -> Result<StageResult, JobError> {
        self.store
            .complete(job_id, output_ref.clone(), Utc::now())
            .await
            .map_err(JobError::from_store)?;
        tracing::info!(job_id = %job_id, output_ref = ?output_ref, "Job completed");
        progress.emit(JobStatus::Completed, 100.0, None, 0, 0, "Job completed");
        progress.close();
        Ok(StageResult::Completed { output_ref })
    }

    async fn execute(
        &self,
        stage: Stage,
        record: &JobRecord,
        input: StageInput<'_>,
        progress: StageProgress,
    ) -> Result<StageOutput, StageFailure> {
        let job_id = record.job_id;
        let spec = &record.spec;
        let progress = &progress;
        let retry = &self.config.retry;

        match (stage, input) {
            (Stage::Uploading, _) => {
                let stager = &*self.collaborators.stager;
                let staged = retry
                    .run(stage, move || stager.stage_media(job_id, spec, progress))
                    .await?;
                progress.finished(staged, format!("Staged {} media files", staged));
                Ok(StageOutput::Staged)
            }
            (Stage::Annotating, _) => {
                let annotator = &*self.collaborators.annotator;
                let manifest = retry
                    .run(stage, move || annotator.annotate(job_id, spec, progress))
                    .await?;
                manifest.validate()?;
                let total = manifest.assets.len() as u32;
                progress.finished(total, format!("Annotated {} assets", total));
                Ok(StageOutput::Checkpoint(CheckpointPayload::Manifest(manifest)))
            }
            (Stage::StyleExtracting, _) => {
                let reference = spec.reference_edit_id.as_deref().ok_or_else(|| StageFailure {
                    kind: FailureKind::Input,
                    summary: "style extraction needs a reference edit".to_string(),
                })?;
                let extractor = &*self.collaborators.style;
                let profile = retry
                    .run(stage, move || extractor.extract(job_id, reference, progress))
                    .await?;
                profile.validate()?;
                progress.finished(1, format!("Extracted style of {}", reference));
                Ok(StageOutput::Checkpoint(CheckpointPayload::StyleProfile(profile)))
            }
            (Stage::Planning, StageInput::Plan { manifest, style }) => {
                progress.started(1, "Planning timeline");
                let blueprint = TimelineSolver::new(self.config.planner.clone())
                    .with_ranker(self.collaborators.ranker.clone())
                    .with_frame_rate(spec.target_frame_rate)
                    .solve(manifest, style)?;
                progress.finished(
                    1,
                    format!(
                        "Planned {} clips over {:.3}s",
                        blueprint.clips.len(),
                        blueprint.total_duration
                    ),
                );
                Ok(StageOutput::Checkpoint(CheckpointPayload::Blueprint(blueprint)))
            }
            (Stage::Executing, StageInput::Export(blueprint)) => {
                let exporter = &*self.collaborators.exporter;
                let output_ref = retry
                    .run(stage, move || exporter.export(job_id, blueprint, progress))
                    .await?;
                progress.finished(1, format!("Exported to {}", output_ref));
                Ok(StageOutput::Exported(output_ref))
            }
            (stage, _) => Err(StageFailure {
                kind: FailureKind::Input,
                summary: format!("no input available for {}", stage),
            }),
        }
    }

    fn spawn_heartbeat(&self, job_id: JobId) -> HeartbeatGuard {
        let store = self.store.clone();
        let interval = self.config.heartbeat_interval();
        HeartbeatGuard(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The claim itself recorded the first heartbeat.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = store.heartbeat(job_id, Utc::now()).await {
                    tracing::warn!(job_id = %job_id, error = %e, "Heartbeat failed");
                }
            }
        }))
    }
}

fn stage_input<'a>(
    job_id: JobId,
    stage: Stage,
    checkpoints: &'a CheckpointSet,
) -> Result<StageInput<'a>, JobError> {
    match stage {
        Stage::Planning => Ok(StageInput::Plan {
            manifest: checkpoints.manifest().ok_or(JobError::MissingCheckpoint {
                job_id,
                stage,
                kind: "manifest",
            })?,
            style: checkpoints.style_profile(),
        }),
        Stage::Executing => Ok(StageInput::Export(checkpoints.blueprint().ok_or(
            JobError::MissingCheckpoint {
                job_id,
                stage,
                kind: "blueprint",
            },
        )?)),
        _ => Ok(StageInput::Fresh),
    }
}

fn floor_of(record: &JobRecord) -> f64 {
    record
        .completed_stage
        .map_or(0.0, |s| ProgressBand::for_stage(s).end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::stages::{AssetAnnotator, MediaStager, StyleExtractor, TimelineExporter};
    use crate::job::RetryPolicy;
    use crate::policy::PlannerConfig;
    use crate::progress::RecordingPublisher;
    use crate::store::InMemoryStore;
    use crate::types::{AssetKind, ClipAnnotation, InputError, RhythmAlignment, TimeRange};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn manifest() -> AssetManifest {
        AssetManifest::new(vec![
            ClipAnnotation::new("intro", AssetKind::Dialogue, 3.0)
                .with_valid_ranges(vec![TimeRange::new(0.0, 3.0)]),
            ClipAnnotation::new("outro", AssetKind::Dialogue, 3.0)
                .with_valid_ranges(vec![TimeRange::new(0.0, 3.0)]),
            ClipAnnotation::new("skyline", AssetKind::Broll, 4.0),
        ])
    }

    /// Scripted stand-in for every external stage.
    struct Scripted {
        manifest: Mutex<AssetManifest>,
        annotate_calls: AtomicU32,
        /// Unavailable errors to return before annotation succeeds.
        annotate_outages: AtomicU32,
        extract_calls: AtomicU32,
        reject_export: Mutex<bool>,
    }

    impl Scripted {
        fn new(manifest: AssetManifest) -> Arc<Self> {
            Arc::new(Self {
                manifest: Mutex::new(manifest),
                annotate_calls: AtomicU32::new(0),
                annotate_outages: AtomicU32::new(0),
                extract_calls: AtomicU32::new(0),
                reject_export: Mutex::new(false),
            })
        }
    }

    #[async_trait]
    impl MediaStager for Scripted {
        async fn stage_media(
            &self,
            _job_id: JobId,
            spec: &JobSpec,
            progress: &StageProgress,
        ) -> Result<u32, CollaboratorError> {
            let total = spec.media_ids.len() as u32;
            for (i, id) in spec.media_ids.iter().enumerate() {
                progress.item(id.as_str(), i as u32 + 1, total, "staged");
            }
            Ok(total)
        }
    }

    #[async_trait]
    impl AssetAnnotator for Scripted {
        async fn annotate(
            &self,
            _job_id: JobId,
            _spec: &JobSpec,
            progress: &StageProgress,
        ) -> Result<AssetManifest, CollaboratorError> {
            self.annotate_calls.fetch_add(1, Ordering::SeqCst);
            let outages = self.annotate_outages.load(Ordering::SeqCst);
            if outages > 0 {
                self.annotate_outages.store(outages - 1, Ordering::SeqCst);
                return Err(CollaboratorError::Unavailable("transcriber down".into()));
            }
            let manifest = self.manifest.lock().clone();
            let total = manifest.assets.len() as u32;
            for (i, asset) in manifest.assets.iter().enumerate() {
                progress.item(asset.asset_id.as_str(), i as u32 + 1, total, "annotated");
            }
            Ok(manifest)
        }
    }

    #[async_trait]
    impl StyleExtractor for Scripted {
        async fn extract(
            &self,
            _job_id: JobId,
            _reference_edit_id: &str,
            _progress: &StageProgress,
        ) -> Result<StyleProfile, CollaboratorError> {
            self.extract_calls.fetch_add(1, Ordering::SeqCst);
            Ok(StyleProfile::new(3.0, RhythmAlignment::None, 0.0))
        }
    }

    #[async_trait]
    impl TimelineExporter for Scripted {
        async fn export(
            &self,
            job_id: JobId,
            _blueprint: &Blueprint,
            _progress: &StageProgress,
        ) -> Result<String, CollaboratorError> {
            if *self.reject_export.lock() {
                return Err(CollaboratorError::Rejected("timeline schema mismatch".into()));
            }
            Ok(format!("exports/{}.xml", job_id))
        }
    }

    struct Harness {
        machine: JobStateMachine<InMemoryStore>,
        store: Arc<InMemoryStore>,
        recorder: Arc<RecordingPublisher>,
        scripted: Arc<Scripted>,
    }

    fn harness_with(manifest: AssetManifest, config: EngineConfig) -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let recorder = Arc::new(RecordingPublisher::new());
        let scripted = Scripted::new(manifest);
        let collaborators = Collaborators::new(
            scripted.clone(),
            scripted.clone(),
            scripted.clone(),
            scripted.clone(),
        );
        let machine = JobStateMachine::new(store.clone(), recorder.clone(), collaborators, config);
        Harness { machine, store, recorder, scripted }
    }

    fn fast_config() -> EngineConfig {
        EngineConfig {
            retry: RetryPolicy {
                initial_backoff_ms: 1,
                max_backoff_ms: 4,
                ..RetryPolicy::default()
            },
            ..EngineConfig::default()
        }
    }

    fn harness() -> Harness {
        harness_with(manifest(), fast_config())
    }

    fn spec() -> JobSpec {
        JobSpec::new("rough cut", vec!["intro".into(), "outro".into(), "skyline".into()])
    }

    #[tokio::test]
    async fn test_advance_runs_one_stage_per_call() {
        let h = harness();
        let job = h.machine.create(spec()).await.unwrap();

        let first = h.machine.advance(job.job_id).await.unwrap();
        assert_eq!(
            first,
            StageResult::Advanced { stage: Stage::Uploading, checkpoint_id: None, next: Some(Stage::Annotating) }
        );

        match h.machine.advance(job.job_id).await.unwrap() {
            StageResult::Advanced { stage, checkpoint_id, next } => {
                assert_eq!(stage, Stage::Annotating);
                assert!(checkpoint_id.is_some());
                assert_eq!(next, Some(Stage::Planning));
            }
            other => panic!("unexpected {:?}", other),
        }

        let record = h.machine.get(job.job_id).await.unwrap();
        assert_eq!(record.status, JobStatus::Annotating);
        assert_eq!(record.completed_stage, Some(Stage::Annotating));
        assert!(record.active_stage.is_none());
    }

    #[tokio::test]
    async fn test_run_to_completion() {
        let h = harness();
        let job = h.machine.create(spec()).await.unwrap();

        let result = h.machine.run(job.job_id).await.unwrap();
        let expected_ref = format!("exports/{}.xml", job.job_id);
        assert_eq!(result, StageResult::Completed { output_ref: Some(expected_ref.clone()) });

        let record = h.machine.get(job.job_id).await.unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.output_ref.as_deref(), Some(expected_ref.as_str()));
        // Manifest and blueprint; no style stage without a reference edit.
        assert_eq!(h.store.checkpoint_count(job.job_id), 2);
        assert_eq!(h.scripted.extract_calls.load(Ordering::SeqCst), 0);

        let events = h.recorder.events_for(job.job_id);
        assert!(events.windows(2).all(|w| w[0].progress_percent <= w[1].progress_percent));
        let last = events.last().unwrap();
        assert_eq!(last.stage, JobStatus::Completed);
        assert_eq!(last.progress_percent, 100.0);
    }

    #[tokio::test]
    async fn test_style_stage_runs_with_reference() {
        let h = harness();
        let job = h.machine.create(spec().with_reference("ref-edit")).await.unwrap();
        h.machine.run(job.job_id).await.unwrap();
        assert_eq!(h.scripted.extract_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.store.checkpoint_count(job.job_id), 3);
    }

    #[tokio::test]
    async fn test_resume_from_manifest_checkpoint_skips_annotation() {
        let h = harness();
        let job = h.machine.create(spec()).await.unwrap();
        h.store
            .put(job.job_id, Stage::Annotating, CheckpointPayload::Manifest(manifest()))
            .await
            .unwrap();

        let result = h.machine.resume(job.job_id).await.unwrap();
        assert!(matches!(result, StageResult::Advanced { stage: Stage::Planning, .. }));
        assert_eq!(h.scripted.annotate_calls.load(Ordering::SeqCst), 0);

        // Planning progress starts where annotation ended.
        let events = h.recorder.events_for(job.job_id);
        assert!(events
            .iter()
            .filter(|e| e.stage == JobStatus::Planning)
            .all(|e| e.progress_percent >= 60.0));
    }

    #[tokio::test]
    async fn test_transient_collaborator_failure_is_retried() {
        let h = harness();
        h.scripted.annotate_outages.store(2, Ordering::SeqCst);
        let job = h.machine.create(spec()).await.unwrap();

        h.machine.advance(job.job_id).await.unwrap();
        let result = h.machine.advance(job.job_id).await.unwrap();
        assert!(matches!(result, StageResult::Advanced { stage: Stage::Annotating, .. }));
        assert_eq!(h.scripted.annotate_calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail_then_resume() {
        let h = harness();
        h.scripted.annotate_outages.store(10, Ordering::SeqCst);
        let job = h.machine.create(spec()).await.unwrap();

        let result = h.machine.run(job.job_id).await.unwrap();
        let StageResult::Failed { stage, failure } = result else {
            panic!("expected failure, got {:?}", result);
        };
        assert_eq!(stage, Stage::Annotating);
        assert_eq!(failure.kind, FailureKind::Collaborator);

        let record = h.machine.get(job.job_id).await.unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.completed_stage, Some(Stage::Uploading));
        assert!(matches!(
            h.machine.advance(job.job_id).await,
            Err(JobError::Terminal { status: JobStatus::Failed, .. })
        ));

        let last = h.recorder.events_for(job.job_id).pop().unwrap();
        assert_eq!(last.stage, JobStatus::Failed);

        h.scripted.annotate_outages.store(0, Ordering::SeqCst);
        let resumed = h.machine.resume(job.job_id).await.unwrap();
        assert!(matches!(resumed, StageResult::Advanced { stage: Stage::Annotating, .. }));
        assert!(h.machine.get(job.job_id).await.unwrap().failure.is_none());
    }

    #[tokio::test]
    async fn test_input_failure_is_not_resumable() {
        let mut bad = manifest();
        bad.assets.push(ClipAnnotation::new("intro", AssetKind::Broll, 2.0));
        let h = harness_with(bad, fast_config());
        let job = h.machine.create(spec()).await.unwrap();

        let result = h.machine.run(job.job_id).await.unwrap();
        let StageResult::Failed { failure, .. } = result else {
            panic!("expected failure");
        };
        assert_eq!(failure.kind, FailureKind::Input);
        assert_eq!(
            failure.summary,
            InputError::DuplicateAsset("intro".into()).to_string()
        );
        assert!(matches!(
            h.machine.resume(job.job_id).await,
            Err(JobError::NotResumable { .. })
        ));
    }

    #[tokio::test]
    async fn test_no_solids_fails_planning() {
        let broll_only = AssetManifest::new(vec![ClipAnnotation::new("skyline", AssetKind::Broll, 4.0)]);
        let h = harness_with(broll_only, fast_config());
        let job = h.machine.create(spec()).await.unwrap();

        let result = h.machine.run(job.job_id).await.unwrap();
        let StageResult::Failed { stage, failure } = result else {
            panic!("expected failure");
        };
        assert_eq!(stage, Stage::Planning);
        assert_eq!(failure.kind, FailureKind::Planning);
        assert_eq!(failure.summary, PlanningError::NoValidSolids.to_string());
        // Manifest checkpoint survives the failure.
        assert_eq!(h.store.checkpoint_count(job.job_id), 1);
    }

    #[tokio::test]
    async fn test_planning_failure_resumes_only_under_new_config() {
        let dialogue_only = AssetManifest::new(vec![
            ClipAnnotation::new("intro", AssetKind::Dialogue, 3.0)
                .with_valid_ranges(vec![TimeRange::new(0.0, 3.0)]),
            ClipAnnotation::new("outro", AssetKind::Dialogue, 3.0)
                .with_valid_ranges(vec![TimeRange::new(0.0, 3.0)]),
        ]);
        let padded = |planner: PlannerConfig| EngineConfig {
            planner: PlannerConfig { solid_padding_ratio: 0.5, ..planner },
            ..fast_config()
        };
        let h = harness_with(dialogue_only, padded(PlannerConfig::strict()));
        let job = h.machine.create(spec().with_reference("ref-edit")).await.unwrap();

        let result = h.machine.run(job.job_id).await.unwrap();
        assert!(matches!(
            result,
            StageResult::Failed { stage: Stage::Planning, ref failure } if failure.kind == FailureKind::Planning
        ));

        // Same checkpoints, same planner: the failure repeats.
        assert!(matches!(
            h.machine.resume(job.job_id).await.unwrap(),
            StageResult::Failed { stage: Stage::Planning, .. }
        ));

        let relaxed = JobStateMachine::new(
            h.store.clone(),
            h.recorder.clone(),
            Collaborators::new(
                h.scripted.clone(),
                h.scripted.clone(),
                h.scripted.clone(),
                h.scripted.clone(),
            ),
            padded(PlannerConfig::default()),
        );
        assert!(matches!(
            relaxed.resume(job.job_id).await.unwrap(),
            StageResult::Advanced { stage: Stage::Planning, .. }
        ));
        let blueprint = h.store.checkpoint_set(job.job_id).await.unwrap().blueprint().cloned().unwrap();
        assert_eq!(blueprint.residual_gaps.len(), 1);
        assert_eq!(h.scripted.annotate_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_export_rejection_fails_job() {
        let h = harness();
        *h.scripted.reject_export.lock() = true;
        let job = h.machine.create(spec()).await.unwrap();
        let result = h.machine.run(job.job_id).await.unwrap();
        assert!(matches!(result, StageResult::Failed { stage: Stage::Executing, .. }));

        // Blueprint is kept; resume goes straight to export.
        *h.scripted.reject_export.lock() = false;
        let calls_before = h.scripted.annotate_calls.load(Ordering::SeqCst);
        let resumed = h.machine.resume(job.job_id).await.unwrap();
        assert!(matches!(resumed, StageResult::Completed { .. }));
        assert_eq!(h.scripted.annotate_calls.load(Ordering::SeqCst), calls_before);
    }

    #[tokio::test]
    async fn test_cancel_idle_job() {
        let h = harness();
        let job = h.machine.create(spec()).await.unwrap();
        h.machine.advance(job.job_id).await.unwrap();
        h.machine.advance(job.job_id).await.unwrap();

        let record = h.machine.cancel(job.job_id).await.unwrap();
        assert_eq!(record.status, JobStatus::Cancelled);
        assert!(matches!(
            h.machine.advance(job.job_id).await,
            Err(JobError::Terminal { status: JobStatus::Cancelled, .. })
        ));

        let events = h.recorder.events_for(job.job_id);
        assert!(events
            .windows(2)
            .all(|w| w[0].progress_percent <= w[1].progress_percent));
        let last = events.last().unwrap();
        assert_eq!(last.stage, JobStatus::Cancelled);
        assert_eq!(last.progress_percent, ProgressBand::for_stage(Stage::Annotating).end);
    }

    #[tokio::test]
    async fn test_stale_read_does_not_rerun_completed_stage() {
        let h = harness();
        let job = h.machine.create(spec()).await.unwrap();

        // Read before another worker finishes uploading.
        let stale = h.machine.get(job.job_id).await.unwrap();
        assert!(h.machine.advance(job.job_id).await.unwrap().is_advanced());

        assert_eq!(
            h.machine.step(stale).await,
            Err(JobError::StageCompleted { job_id: job.job_id, stage: Stage::Uploading })
        );
        let current = h.machine.get(job.job_id).await.unwrap();
        assert_eq!(current.completed_stage, Some(Stage::Uploading));
        assert!(current.active_stage.is_none());

        // The stale read lost; the job carries on from where it is.
        assert!(matches!(
            h.machine.run(job.job_id).await.unwrap(),
            StageResult::Completed { .. }
        ));
        assert_eq!(h.scripted.annotate_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.store.checkpoint_count(job.job_id), 2);
    }

    #[tokio::test]
    async fn test_stale_read_after_checkpoint_is_refused() {
        let h = harness();
        let job = h.machine.create(spec()).await.unwrap();
        h.machine.advance(job.job_id).await.unwrap();
        h.machine.advance(job.job_id).await.unwrap();

        // A worker that read the job before annotation finished.
        assert!(h
            .store
            .try_begin_stage(job.job_id, Stage::Annotating, Utc::now())
            .await
            .unwrap()
            .is_none());
        assert_eq!(h.scripted.annotate_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.store.checkpoint_count(job.job_id), 1);
    }

    #[tokio::test]
    async fn test_cancel_waits_for_stage_boundary() {
        let h = harness();
        let job = h.machine.create(spec()).await.unwrap();
        let now = Utc::now();
        h.store.try_begin_stage(job.job_id, Stage::Uploading, now).await.unwrap();

        let record = h.machine.cancel(job.job_id).await.unwrap();
        assert!(record.cancel_requested);
        assert_eq!(record.status, JobStatus::Uploading);

        h.store.finish_stage(job.job_id, Stage::Uploading, now).await.unwrap();
        assert_eq!(h.machine.advance(job.job_id).await.unwrap(), StageResult::Cancelled);
        assert_eq!(h.machine.get(job.job_id).await.unwrap().status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_live_claim_blocks_resume_stale_claim_does_not() {
        let h = harness();
        let job = h.machine.create(spec()).await.unwrap();

        h.store
            .try_begin_stage(job.job_id, Stage::Uploading, Utc::now())
            .await
            .unwrap();
        assert!(matches!(
            h.machine.resume(job.job_id).await,
            Err(JobError::StageInFlight { stage: Stage::Uploading, .. })
        ));

        h.store
            .heartbeat(job.job_id, Utc::now() - chrono::Duration::minutes(10))
            .await
            .unwrap();
        let result = h.machine.resume(job.job_id).await.unwrap();
        assert!(matches!(result, StageResult::Advanced { stage: Stage::Uploading, .. }));
    }

    #[tokio::test]
    async fn test_recover_interrupted_marks_failed_without_auto_resume() {
        let config = EngineConfig { auto_resume: false, ..fast_config() };
        let h = harness_with(manifest(), config);
        let job = h.machine.create(spec()).await.unwrap();
        let long_ago = Utc::now() - chrono::Duration::minutes(10);
        h.store.try_begin_stage(job.job_id, Stage::Uploading, long_ago).await.unwrap();

        let outcomes = h.machine.recover_interrupted().await.unwrap();
        assert_eq!(outcomes.len(), 1);
        let record = h.machine.get(job.job_id).await.unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.failure.unwrap().kind, FailureKind::Interrupted);

        // Interrupted failures resume.
        assert!(h.machine.resume(job.job_id).await.unwrap().is_advanced());
    }

    #[tokio::test]
    async fn test_recover_interrupted_auto_resumes() {
        let h = harness();
        let job = h.machine.create(spec()).await.unwrap();
        let long_ago = Utc::now() - chrono::Duration::minutes(10);
        h.store.try_begin_stage(job.job_id, Stage::Uploading, long_ago).await.unwrap();

        let outcomes = h.machine.recover_interrupted().await.unwrap();
        assert!(matches!(outcomes[0].1, Ok(StageResult::Completed { .. })));
    }
}
