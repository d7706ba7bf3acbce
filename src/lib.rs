//! # edit-plan-kernel
//!
//! Deterministic rough-cut planning for video edits, driven by a
//! checkpointed, resumable job pipeline.
//!
//! The kernel answers two questions:
//!
//! > Given annotated footage and a style, where does every clip go on the timeline?
//!
//! > Given a crash at any point, where does the job pick up again?
//!
//! ## Core Contract
//!
//! 1. Dialogue ("solids") keeps its order and speed; B-roll ("liquids") is
//!    time-warped into the gaps between them
//! 2. The same manifest, style and planner config produce a byte-identical
//!    blueprint with a stable fingerprint
//! 3. Every stage output is an append-only checkpoint; resume restarts at
//!    the first stage without one
//!
//! ## Architecture
//!
//! ```text
//! JobSpec → Uploading → Annotating → StyleExtracting → Planning → Executing
//!               ↓            ↓              ↓              ↓
//!        CheckpointStore (Postgres or Memory)     TimelineSolver
//!               ↓
//!        ProgressPublisher → subscribers
//! ```
//!
//! ## Determinism Guarantees
//!
//! - Same manifest + same style + same planner params → identical fingerprint
//! - Solids are placed in manifest order, then range order
//! - Checkpoint payloads carry a digest verified on every read

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod types;
pub mod policy;
pub mod solver;
pub mod store;
pub mod job;
pub mod progress;
pub mod config;
pub mod canonical;

#[cfg(feature = "service")]
pub mod service;

// Re-exports
pub use types::{
    AssetId, AssetKind, AssetManifest, BeatGrid, Blueprint, ClipAnnotation, ClipRole,
    InputError, PlacedClip, ResidualGap, ResidualReason, RhythmAlignment, StyleProfile, TimeRange,
};
pub use types::{
    Checkpoint, CheckpointId, CheckpointPayload, CheckpointSet, FailureKind, FailureRecord, JobId,
    JobRecord, JobSpec, JobStatus, ProgressEvent, Stage,
};
pub use policy::{CandidateRanker, KeywordOverlapRanker, PlannerConfig};
pub use solver::{PlanningError, TimelineSolver};
pub use store::{CheckpointStore, InMemoryStore, JobStore};
#[cfg(feature = "postgres")]
pub use store::PostgresStore;
pub use job::{Collaborators, FileDrop, JobError, JobStateMachine, RetryPolicy, StageResult};
pub use progress::{BroadcastPublisher, JobProgress, ProgressPublisher};
pub use config::EngineConfig;
pub use canonical::{canonical_hash, canonical_hash_hex, payload_digest, to_canonical_bytes};

// Service re-exports (when service feature is enabled)
#[cfg(feature = "service")]
pub use service::{create_router, ServiceState};

/// Schema version for blueprints and checkpoint payloads.
/// Increment on breaking changes to any schema type.
pub const EDIT_PLAN_SCHEMA_VERSION: &str = "1.0.0";

/// Default planner version identifier.
pub const DEFAULT_PLANNER_VERSION: &str = "planner_v1";

/// Tolerance for comparing timeline and source times, in seconds.
pub const TIME_EPSILON: f64 = 1e-6;
