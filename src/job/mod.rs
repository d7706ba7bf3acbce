//! Pipeline orchestration: the job state machine and its stage collaborators.

pub mod file_drop;
pub mod machine;
pub mod retry;
pub mod stages;

pub use file_drop::FileDrop;
pub use machine::{JobError, JobStateMachine, StageResult};
pub use retry::RetryPolicy;
pub use stages::{
    AssetAnnotator, CollaboratorError, Collaborators, MediaStager, StyleExtractor,
    TimelineExporter,
};

impl Collaborators {
    /// Every external stage served by one drop directory.
    pub fn file_drop(root: impl Into<std::path::PathBuf>) -> Self {
        let drop = std::sync::Arc::new(FileDrop::new(root));
        Self::new(drop.clone(), drop.clone(), drop.clone(), drop)
    }
}
