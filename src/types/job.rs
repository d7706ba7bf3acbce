//! Job identity, stage ordering and persisted job records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a pipeline job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Create a job id from a UUID.
    pub fn new(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Generate a fresh random job id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse a job id from a UUID string.
    pub fn from_str(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }

    /// Get the inner UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

/// Executable pipeline stages, in their fixed order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Stage raw media for processing.
    Uploading,
    /// Annotate assets into a manifest.
    Annotating,
    /// Extract a style profile from the reference edit (optional).
    StyleExtracting,
    /// Solve the timeline.
    Planning,
    /// Hand the blueprint to the exporter.
    Executing,
}

impl Stage {
    /// Every stage in execution order.
    pub const ALL: [Stage; 5] = [
        Stage::Uploading,
        Stage::Annotating,
        Stage::StyleExtracting,
        Stage::Planning,
        Stage::Executing,
    ];

    /// Position in [`Stage::ALL`].
    pub fn index(self) -> usize {
        self as usize
    }

    /// Whether the stage runs for a job with this spec.
    pub fn applies_to(self, spec: &JobSpec) -> bool {
        match self {
            Stage::StyleExtracting => spec.reference_edit_id.is_some(),
            _ => true,
        }
    }

    /// The first applicable stage after `furthest` (or the first stage when `None`).
    ///
    /// Returns `None` when every applicable stage has completed.
    pub fn next_after(furthest: Option<Stage>, spec: &JobSpec) -> Option<Stage> {
        let from = furthest.map_or(0, |s| s.index() + 1);
        Stage::ALL[from.min(Stage::ALL.len())..]
            .iter()
            .copied()
            .find(|s| s.applies_to(spec))
    }

    /// Stable string name used in storage.
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Uploading => "uploading",
            Stage::Annotating => "annotating",
            Stage::StyleExtracting => "style_extracting",
            Stage::Planning => "planning",
            Stage::Executing => "executing",
        }
    }

    /// Parse a stored stage name.
    pub fn from_str(s: &str) -> Option<Self> {
        Stage::ALL.iter().copied().find(|stage| stage.as_str() == s)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Registered, nothing run yet.
    Created,
    /// Staging media.
    Uploading,
    /// Annotating assets.
    Annotating,
    /// Extracting style.
    StyleExtracting,
    /// Solving the timeline.
    Planning,
    /// Exporting.
    Executing,
    /// Finished successfully.
    Completed,
    /// Stopped on an error.
    Failed,
    /// Stopped by request.
    Cancelled,
}

impl JobStatus {
    /// Whether no further transitions happen automatically.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled)
    }

    /// The stage this status represents, if any.
    pub fn stage(self) -> Option<Stage> {
        match self {
            JobStatus::Uploading => Some(Stage::Uploading),
            JobStatus::Annotating => Some(Stage::Annotating),
            JobStatus::StyleExtracting => Some(Stage::StyleExtracting),
            JobStatus::Planning => Some(Stage::Planning),
            JobStatus::Executing => Some(Stage::Executing),
            _ => None,
        }
    }

    /// Stable string name used in storage.
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Created => "created",
            JobStatus::Uploading => "uploading",
            JobStatus::Annotating => "annotating",
            JobStatus::StyleExtracting => "style_extracting",
            JobStatus::Planning => "planning",
            JobStatus::Executing => "executing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Parse a stored status name.
    pub fn from_str(s: &str) -> Option<Self> {
        [
            JobStatus::Created,
            JobStatus::Uploading,
            JobStatus::Annotating,
            JobStatus::StyleExtracting,
            JobStatus::Planning,
            JobStatus::Executing,
            JobStatus::Completed,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ]
        .into_iter()
        .find(|status| status.as_str() == s)
    }
}

impl From<Stage> for JobStatus {
    fn from(stage: Stage) -> Self {
        match stage {
            Stage::Uploading => JobStatus::Uploading,
            Stage::Annotating => JobStatus::Annotating,
            Stage::StyleExtracting => JobStatus::StyleExtracting,
            Stage::Planning => JobStatus::Planning,
            Stage::Executing => JobStatus::Executing,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs a job is created with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    /// Human-readable name.
    pub name: String,
    /// External ids of raw media files.
    #[serde(default)]
    pub media_ids: Vec<String>,
    /// External id of a reference edit to learn style from.
    #[serde(default)]
    pub reference_edit_id: Option<String>,
    /// Output frame rate.
    #[serde(default = "default_frame_rate")]
    pub target_frame_rate: f64,
}

fn default_frame_rate() -> f64 {
    60.0
}

impl JobSpec {
    /// Create a spec without a reference edit.
    pub fn new(name: impl Into<String>, media_ids: Vec<String>) -> Self {
        Self {
            name: name.into(),
            media_ids,
            reference_edit_id: None,
            target_frame_rate: default_frame_rate(),
        }
    }

    /// Builder: learn style from a reference edit.
    pub fn with_reference(mut self, reference_edit_id: impl Into<String>) -> Self {
        self.reference_edit_id = Some(reference_edit_id.into());
        self
    }
}

/// Classification of a failure, which decides resumability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Malformed or missing input; needs a new job.
    Input,
    /// Solver could not satisfy invariants.
    Planning,
    /// External stage failed after retries.
    Collaborator,
    /// Process died mid-stage.
    Interrupted,
}

impl FailureKind {
    /// Whether `resume` may pick the job up again.
    pub fn is_resumable(self) -> bool {
        !matches!(self, FailureKind::Input)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Input => write!(f, "input"),
            FailureKind::Planning => write!(f, "planning"),
            FailureKind::Collaborator => write!(f, "collaborator"),
            FailureKind::Interrupted => write!(f, "interrupted"),
        }
    }
}

/// Why and where a job failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Failure classification.
    pub kind: FailureKind,
    /// Stage that failed.
    pub stage: Option<Stage>,
    /// Human-readable summary.
    pub summary: String,
    /// When the failure was recorded.
    pub failed_at: DateTime<Utc>,
}

/// Persisted state of a job (everything except checkpoint payloads).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Job id.
    pub job_id: JobId,
    /// Creation inputs.
    pub spec: JobSpec,
    /// Current status.
    pub status: JobStatus,
    /// Furthest stage that completed successfully.
    pub completed_stage: Option<Stage>,
    /// Stage currently claimed by a running worker.
    pub active_stage: Option<Stage>,
    /// Last liveness signal from the worker running `active_stage`.
    pub heartbeat_at: Option<DateTime<Utc>>,
    /// Set by an external cancel request; honoured at the next stage boundary.
    pub cancel_requested: bool,
    /// Failure details when `status == Failed`.
    pub failure: Option<FailureRecord>,
    /// Reference returned by the exporter.
    pub output_ref: Option<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification time.
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// A freshly created job.
    pub fn new(job_id: JobId, spec: JobSpec, now: DateTime<Utc>) -> Self {
        Self {
            job_id,
            spec,
            status: JobStatus::Created,
            completed_stage: None,
            active_stage: None,
            heartbeat_at: None,
            cancel_requested: false,
            failure: None,
            output_ref: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether a worker holds a stage whose heartbeat is older than `staleness`.
    pub fn is_interrupted(&self, now: DateTime<Utc>, staleness: chrono::Duration) -> bool {
        match (self.active_stage, self.heartbeat_at) {
            (Some(_), Some(beat)) => !self.status.is_terminal() && now - beat > staleness,
            (Some(_), None) => !self.status.is_terminal(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_order_is_index_order() {
        for (i, stage) in Stage::ALL.iter().enumerate() {
            assert_eq!(stage.index(), i);
        }
        assert!(Stage::Annotating < Stage::Planning);
    }

    #[test]
    fn test_next_after_skips_style_without_reference() {
        let spec = JobSpec::new("plain", vec![]);
        assert_eq!(Stage::next_after(None, &spec), Some(Stage::Uploading));
        assert_eq!(Stage::next_after(Some(Stage::Annotating), &spec), Some(Stage::Planning));
        assert_eq!(Stage::next_after(Some(Stage::Executing), &spec), None);
    }

    #[test]
    fn test_next_after_includes_style_with_reference() {
        let spec = JobSpec::new("styled", vec![]).with_reference("ref-1");
        assert_eq!(
            Stage::next_after(Some(Stage::Annotating), &spec),
            Some(Stage::StyleExtracting)
        );
    }

    #[test]
    fn test_status_round_trip_names() {
        for stage in Stage::ALL {
            let status = JobStatus::from(stage);
            assert_eq!(JobStatus::from_str(status.as_str()), Some(status));
            assert_eq!(Stage::from_str(stage.as_str()), Some(stage));
        }
    }

    #[test]
    fn test_input_failures_not_resumable() {
        assert!(!FailureKind::Input.is_resumable());
        assert!(FailureKind::Collaborator.is_resumable());
        assert!(FailureKind::Interrupted.is_resumable());
    }

    #[test]
    fn test_interrupted_detection() {
        let now = Utc::now();
        let mut record = JobRecord::new(JobId::generate(), JobSpec::new("j", vec![]), now);
        assert!(!record.is_interrupted(now, chrono::Duration::seconds(30)));

        record.active_stage = Some(Stage::Annotating);
        record.status = JobStatus::Annotating;
        record.heartbeat_at = Some(now - chrono::Duration::seconds(60));
        assert!(record.is_interrupted(now, chrono::Duration::seconds(30)));
        assert!(!record.is_interrupted(now, chrono::Duration::seconds(120)));
    }
}
