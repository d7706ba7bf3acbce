//! External stage collaborators.
//!
//! Every stage except planning is delegated to an external service behind one
//! of these traits. Implementations enforce nothing about retries; the state
//! machine retries retryable errors with bounded backoff.

use std::sync::Arc;

use async_trait::async_trait;

use crate::policy::{CandidateRanker, KeywordOverlapRanker};
use crate::progress::StageProgress;
use crate::types::{AssetManifest, Blueprint, InputError, JobId, JobSpec, Stage, StyleProfile};

/// Error reported by an external stage.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CollaboratorError {
    /// Service unreachable or temporarily failing.
    #[error("Collaborator unavailable: {0}")]
    Unavailable(String),
    /// Stage exceeded its time budget.
    #[error("Stage {stage} timed out after {after_ms}ms")]
    Timeout {
        /// Stage that timed out.
        stage: Stage,
        /// Budget in milliseconds.
        after_ms: u64,
    },
    /// Service refused the request.
    #[error("Collaborator rejected request: {0}")]
    Rejected(String),
    /// Service produced or was given malformed input.
    #[error(transparent)]
    Input(#[from] InputError),
}

impl CollaboratorError {
    /// Whether a retry may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout { .. })
    }
}

/// Uploading: makes raw media available to later stages.
#[async_trait]
pub trait MediaStager: Send + Sync {
    /// Stage every media file of the job; returns how many were staged.
    async fn stage_media(
        &self,
        job_id: JobId,
        spec: &JobSpec,
        progress: &StageProgress,
    ) -> Result<u32, CollaboratorError>;
}

/// Annotating: transcription, stability scoring and beat detection.
#[async_trait]
pub trait AssetAnnotator: Send + Sync {
    /// Produce the asset manifest.
    async fn annotate(
        &self,
        job_id: JobId,
        spec: &JobSpec,
        progress: &StageProgress,
    ) -> Result<AssetManifest, CollaboratorError>;
}

/// StyleExtracting: learns a style profile from a reference edit.
#[async_trait]
pub trait StyleExtractor: Send + Sync {
    /// Extract the profile of `reference_edit_id`.
    async fn extract(
        &self,
        job_id: JobId,
        reference_edit_id: &str,
        progress: &StageProgress,
    ) -> Result<StyleProfile, CollaboratorError>;
}

/// Executing: maps the blueprint onto an interchange timeline.
#[async_trait]
pub trait TimelineExporter: Send + Sync {
    /// Export the blueprint; returns a reference to the output.
    async fn export(
        &self,
        job_id: JobId,
        blueprint: &Blueprint,
        progress: &StageProgress,
    ) -> Result<String, CollaboratorError>;
}

/// Everything the state machine delegates to.
#[derive(Clone)]
pub struct Collaborators {
    /// Uploading stage.
    pub stager: Arc<dyn MediaStager>,
    /// Annotating stage.
    pub annotator: Arc<dyn AssetAnnotator>,
    /// StyleExtracting stage.
    pub style: Arc<dyn StyleExtractor>,
    /// Executing stage.
    pub exporter: Arc<dyn TimelineExporter>,
    /// Relevance ranking used by the solver.
    pub ranker: Arc<dyn CandidateRanker>,
}

impl Collaborators {
    /// Bundle stage collaborators with keyword-overlap ranking.
    pub fn new(
        stager: Arc<dyn MediaStager>,
        annotator: Arc<dyn AssetAnnotator>,
        style: Arc<dyn StyleExtractor>,
        exporter: Arc<dyn TimelineExporter>,
    ) -> Self {
        Self {
            stager,
            annotator,
            style,
            exporter,
            ranker: Arc::new(KeywordOverlapRanker::new()),
        }
    }

    /// Builder: replace the candidate ranker.
    pub fn with_ranker(mut self, ranker: Arc<dyn CandidateRanker>) -> Self {
        self.ranker = ranker;
        self
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(CollaboratorError::Unavailable("down".into()).is_retryable());
        assert!(CollaboratorError::Timeout { stage: Stage::Annotating, after_ms: 10 }.is_retryable());
        assert!(!CollaboratorError::Rejected("quota".into()).is_retryable());
        assert!(!CollaboratorError::Input(InputError::Malformed("x".into())).is_retryable());
    }
}
