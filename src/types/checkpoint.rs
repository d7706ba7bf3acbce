//! Checkpoints: immutable snapshots of a completed stage's output.
//!
//! Checkpoints are append-only per job. A newer checkpoint supersedes older
//! ones without deleting them; `sequence` increases monotonically per job.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::canonical::payload_digest;
use super::asset::AssetManifest;
use super::blueprint::Blueprint;
use super::job::{JobId, Stage};
use super::style::StyleProfile;

/// Identifier of a persisted checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckpointId(Uuid);

impl CheckpointId {
    /// Generate a fresh id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    pub fn new(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Get the inner UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stage output carried by a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum CheckpointPayload {
    /// Output of annotation.
    Manifest(AssetManifest),
    /// Output of style extraction.
    StyleProfile(StyleProfile),
    /// Output of planning.
    Blueprint(Blueprint),
}

impl CheckpointPayload {
    /// The stage that produces this payload kind.
    pub fn stage(&self) -> Stage {
        match self {
            CheckpointPayload::Manifest(_) => Stage::Annotating,
            CheckpointPayload::StyleProfile(_) => Stage::StyleExtracting,
            CheckpointPayload::Blueprint(_) => Stage::Planning,
        }
    }

    /// Short kind name.
    pub fn kind(&self) -> &'static str {
        match self {
            CheckpointPayload::Manifest(_) => "manifest",
            CheckpointPayload::StyleProfile(_) => "style_profile",
            CheckpointPayload::Blueprint(_) => "blueprint",
        }
    }

    /// SHA-256 digest of the canonical payload bytes.
    pub fn digest(&self) -> String {
        payload_digest(self)
    }
}

/// A persisted checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Checkpoint id.
    pub checkpoint_id: CheckpointId,
    /// Owning job.
    pub job_id: JobId,
    /// Stage whose completion this records.
    pub stage: Stage,
    /// Per-job sequence number, starting at 1.
    pub sequence: u64,
    /// Stage output.
    pub payload: CheckpointPayload,
    /// Digest of the payload at write time.
    pub digest: String,
    /// Write time.
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Whether the stored digest still matches the payload.
    pub fn verify_digest(&self) -> bool {
        self.payload.digest() == self.digest
    }
}

/// The checkpoint view the state machine resumes from.
///
/// Holds the newest checkpoint of every payload kind for one job.
#[derive(Debug, Clone, Default)]
pub struct CheckpointSet {
    /// Newest manifest checkpoint.
    pub manifest: Option<Checkpoint>,
    /// Newest style profile checkpoint.
    pub style_profile: Option<Checkpoint>,
    /// Newest blueprint checkpoint.
    pub blueprint: Option<Checkpoint>,
}

impl CheckpointSet {
    /// Build from checkpoints in any order; higher sequence wins per kind.
    pub fn from_checkpoints(checkpoints: impl IntoIterator<Item = Checkpoint>) -> Self {
        let mut set = CheckpointSet::default();
        for checkpoint in checkpoints {
            let slot = match checkpoint.payload {
                CheckpointPayload::Manifest(_) => &mut set.manifest,
                CheckpointPayload::StyleProfile(_) => &mut set.style_profile,
                CheckpointPayload::Blueprint(_) => &mut set.blueprint,
            };
            if slot.as_ref().map_or(true, |c| c.sequence < checkpoint.sequence) {
                *slot = Some(checkpoint);
            }
        }
        set
    }

    /// The furthest stage with a persisted checkpoint.
    pub fn furthest_stage(&self) -> Option<Stage> {
        [&self.manifest, &self.style_profile, &self.blueprint]
            .into_iter()
            .flatten()
            .map(|c| c.stage)
            .max()
    }

    /// Manifest payload, if checkpointed.
    pub fn manifest(&self) -> Option<&AssetManifest> {
        match self.manifest.as_ref().map(|c| &c.payload) {
            Some(CheckpointPayload::Manifest(m)) => Some(m),
            _ => None,
        }
    }

    /// Style profile payload, if checkpointed.
    pub fn style_profile(&self) -> Option<&StyleProfile> {
        match self.style_profile.as_ref().map(|c| &c.payload) {
            Some(CheckpointPayload::StyleProfile(p)) => Some(p),
            _ => None,
        }
    }

    /// Blueprint payload, if checkpointed.
    pub fn blueprint(&self) -> Option<&Blueprint> {
        match self.blueprint.as_ref().map(|c| &c.payload) {
            Some(CheckpointPayload::Blueprint(b)) => Some(b),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::beat::RhythmAlignment;

    fn checkpoint(sequence: u64, payload: CheckpointPayload) -> Checkpoint {
        Checkpoint {
            checkpoint_id: CheckpointId::generate(),
            job_id: JobId::new(Uuid::from_u128(7)),
            stage: payload.stage(),
            sequence,
            digest: payload.digest(),
            payload,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_payload_tagging() {
        let payload = CheckpointPayload::StyleProfile(StyleProfile::new(
            2.0,
            RhythmAlignment::Beat,
            0.3,
        ));
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["kind"], "style_profile");
        assert_eq!(payload.stage(), Stage::StyleExtracting);
    }

    #[test]
    fn test_set_keeps_newest_per_kind() {
        let older = checkpoint(1, CheckpointPayload::Manifest(AssetManifest::default()));
        let newer = checkpoint(3, CheckpointPayload::Manifest(AssetManifest::default()));
        let newer_id = newer.checkpoint_id;

        let set = CheckpointSet::from_checkpoints(vec![newer, older]);
        assert_eq!(set.manifest.as_ref().map(|c| c.checkpoint_id), Some(newer_id));
        assert_eq!(set.furthest_stage(), Some(Stage::Annotating));
        assert!(set.blueprint().is_none());
    }

    #[test]
    fn test_digest_detects_tampering() {
        let mut cp = checkpoint(1, CheckpointPayload::Manifest(AssetManifest::default()));
        assert!(cp.verify_digest());
        cp.digest = "00".to_string();
        assert!(!cp.verify_digest());
    }
}
