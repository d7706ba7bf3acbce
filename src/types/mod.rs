//! Core types for the edit planning kernel.

pub mod asset;
pub mod beat;
pub mod style;
pub mod blueprint;
pub mod checkpoint;
pub mod job;
pub mod progress;

pub use asset::{
    AssetId, AssetKind, AssetManifest, ClipAnnotation, StabilityWindow, TimeRange,
    TranscriptSegment,
};
pub use beat::{AlignmentGrid, BeatGrid, RhythmAlignment, DEFAULT_BEATS_PER_BAR};
pub use style::{EffectiveStyle, StyleProfile};
pub use blueprint::{
    AudioBed, Blueprint, BlueprintViolation, ClipRole, PlacedClip, ResidualGap, ResidualReason,
};
pub use checkpoint::{Checkpoint, CheckpointId, CheckpointPayload, CheckpointSet};
pub use job::{FailureKind, FailureRecord, JobId, JobRecord, JobSpec, JobStatus, Stage};
pub use progress::{ProgressBand, ProgressEvent};

/// Malformed or missing planner input.
///
/// Input errors are fatal for a job and are never retried.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InputError {
    /// Asset duration is not a positive finite number.
    #[error("Asset {asset_id} has invalid duration {duration}")]
    InvalidDuration {
        /// Offending asset.
        asset_id: AssetId,
        /// Declared duration.
        duration: f64,
    },
    /// A range list breaks the ordering or bounds invariant.
    #[error("Asset {asset_id} has invalid {field}: {reason}")]
    InvalidRange {
        /// Offending asset.
        asset_id: AssetId,
        /// Field name.
        field: &'static str,
        /// What is wrong.
        reason: String,
    },
    /// Two assets share an id.
    #[error("Duplicate asset id: {0}")]
    DuplicateAsset(AssetId),
    /// Beat grid timestamps are not strictly increasing.
    #[error("Invalid beat grid {field}: {reason}")]
    InvalidBeatGrid {
        /// Field name.
        field: &'static str,
        /// What is wrong.
        reason: String,
    },
    /// Style profile field out of range.
    #[error("Invalid style profile: {0}")]
    InvalidStyleProfile(String),
    /// Input document could not be decoded.
    #[error("Malformed input document: {0}")]
    Malformed(String),
}
