//! Progress records streamed to clients while a job runs.

use serde::{Deserialize, Serialize};

use super::job::{JobId, JobStatus, Stage};

/// One progress update.
///
/// Consumers must tolerate duplicates and out-of-order arrival.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Job the event belongs to.
    pub job_id: JobId,
    /// Status at the time of the event.
    pub stage: JobStatus,
    /// Overall percent in `[0, 100]`, non-decreasing per job.
    pub progress_percent: f64,
    /// Item currently being processed.
    pub current_item: Option<String>,
    /// Items in the current stage.
    pub total_items: u32,
    /// Items processed so far in the current stage.
    pub processed_items: u32,
    /// Free-form status text.
    pub message: String,
}

/// Slice of the overall percent range owned by a stage.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressBand {
    /// Percent at stage start.
    pub start: f64,
    /// Percent at stage end.
    pub end: f64,
}

impl ProgressBand {
    /// Band for a stage.
    pub fn for_stage(stage: Stage) -> Self {
        let (start, end) = match stage {
            Stage::Uploading => (0.0, 10.0),
            Stage::Annotating => (10.0, 60.0),
            Stage::StyleExtracting => (60.0, 65.0),
            Stage::Planning => (65.0, 80.0),
            Stage::Executing => (80.0, 100.0),
        };
        Self { start, end }
    }

    /// Percent after `processed` of `total` items.
    pub fn at(&self, processed: u32, total: u32) -> f64 {
        if total == 0 {
            return self.start;
        }
        let fraction = (processed.min(total) as f64) / (total as f64);
        self.start + (self.end - self.start) * fraction
    }
}
