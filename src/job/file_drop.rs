//! Directory-backed collaborators.
//!
//! External annotation and style extraction services drop their JSON output
//! into a per-job directory; the exporter picks the blueprint up from there.
//!
//! ```text
//! <root>/<job_id>/media/              staged media files
//! <root>/<job_id>/manifest.json       AssetManifest
//! <root>/<job_id>/style_profile.json  StyleProfile
//! <root>/<job_id>/blueprint.json      written by export
//! ```

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use super::stages::{AssetAnnotator, CollaboratorError, MediaStager, StyleExtractor, TimelineExporter};
use crate::progress::StageProgress;
use crate::types::{AssetManifest, Blueprint, InputError, JobId, JobSpec, StyleProfile};

/// File name of the annotation output.
pub const MANIFEST_FILE: &str = "manifest.json";
/// File name of the style extraction output.
pub const STYLE_PROFILE_FILE: &str = "style_profile.json";
/// File name of the exported blueprint.
pub const BLUEPRINT_FILE: &str = "blueprint.json";
/// Directory holding staged media.
pub const MEDIA_DIR: &str = "media";

/// Collaborator that reads and writes a drop directory.
#[derive(Debug, Clone)]
pub struct FileDrop {
    root: PathBuf,
}

impl FileDrop {
    /// Use `root` as the drop directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of one job.
    pub fn job_dir(&self, job_id: JobId) -> PathBuf {
        self.root.join(job_id.to_string())
    }

    async fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<T, CollaboratorError> {
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            CollaboratorError::Unavailable(format!("{}: {}", path.display(), e))
        })?;
        serde_json::from_slice(&bytes).map_err(|e| {
            CollaboratorError::Input(InputError::Malformed(format!("{}: {}", path.display(), e)))
        })
    }
}

#[async_trait]
impl MediaStager for FileDrop {
    async fn stage_media(
        &self,
        job_id: JobId,
        spec: &JobSpec,
        progress: &StageProgress,
    ) -> Result<u32, CollaboratorError> {
        let dir = self.job_dir(job_id).join(MEDIA_DIR);
        let mut entries = tokio::fs::read_dir(&dir).await.map_err(|e| {
            CollaboratorError::Unavailable(format!("{}: {}", dir.display(), e))
        })?;

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| CollaboratorError::Unavailable(e.to_string()))?
        {
            let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
            if is_file {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();

        for media_id in &spec.media_ids {
            if !names.iter().any(|name| name.starts_with(media_id.as_str())) {
                return Err(CollaboratorError::Input(InputError::Malformed(format!(
                    "media {} not found in {}",
                    media_id,
                    dir.display()
                ))));
            }
        }

        let total = names.len() as u32;
        progress.started(total, format!("Staging {} media files", total));
        for (i, name) in names.iter().enumerate() {
            progress.item(name.as_str(), i as u32 + 1, total, format!("Staged {}", name));
        }
        Ok(total)
    }
}

#[async_trait]
impl AssetAnnotator for FileDrop {
    async fn annotate(
        &self,
        job_id: JobId,
        _spec: &JobSpec,
        progress: &StageProgress,
    ) -> Result<AssetManifest, CollaboratorError> {
        progress.started(0, "Reading annotations");
        let manifest: AssetManifest = self.read_json(&self.job_dir(job_id).join(MANIFEST_FILE)).await?;
        let total = manifest.assets.len() as u32;
        for (i, asset) in manifest.assets.iter().enumerate() {
            progress.item(
                asset.asset_id.as_str(),
                i as u32 + 1,
                total,
                format!("Annotated {}", asset.asset_id),
            );
        }
        Ok(manifest)
    }
}

#[async_trait]
impl StyleExtractor for FileDrop {
    async fn extract(
        &self,
        job_id: JobId,
        reference_edit_id: &str,
        progress: &StageProgress,
    ) -> Result<StyleProfile, CollaboratorError> {
        progress.started(1, format!("Reading style of {}", reference_edit_id));
        self.read_json(&self.job_dir(job_id).join(STYLE_PROFILE_FILE)).await
    }
}

#[async_trait]
impl TimelineExporter for FileDrop {
    async fn export(
        &self,
        job_id: JobId,
        blueprint: &Blueprint,
        progress: &StageProgress,
    ) -> Result<String, CollaboratorError> {
        let dir = self.job_dir(job_id);
        let path = dir.join(BLUEPRINT_FILE);
        let bytes = serde_json::to_vec_pretty(blueprint)
            .map_err(|e| CollaboratorError::Rejected(e.to_string()))?;

        progress.started(1, "Writing blueprint");
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| CollaboratorError::Unavailable(format!("{}: {}", dir.display(), e)))?;
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| CollaboratorError::Unavailable(format!("{}: {}", path.display(), e)))?;

        Ok(path.display().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::{JobProgress, RecordingPublisher};
    use crate::types::{AssetKind, ClipAnnotation, RhythmAlignment, Stage, TimeRange};
    use std::sync::Arc;
    use uuid::Uuid;

    fn job() -> JobId {
        JobId::new(Uuid::from_u128(5))
    }

    fn stage(stage: Stage) -> (Arc<RecordingPublisher>, StageProgress) {
        let recorder = Arc::new(RecordingPublisher::new());
        let progress = JobProgress::new(job(), recorder.clone(), 0.0);
        (recorder, progress.stage(stage))
    }

    #[tokio::test]
    async fn test_reads_manifest_and_reports_items() {
        let dir = tempfile::tempdir().unwrap();
        let drop = FileDrop::new(dir.path());
        let manifest = AssetManifest::new(vec![
            ClipAnnotation::new("talk", AssetKind::Dialogue, 4.0)
                .with_valid_ranges(vec![TimeRange::new(0.0, 4.0)]),
            ClipAnnotation::new("city", AssetKind::Broll, 6.0),
        ]);
        std::fs::create_dir_all(drop.job_dir(job())).unwrap();
        std::fs::write(
            drop.job_dir(job()).join(MANIFEST_FILE),
            serde_json::to_vec(&manifest).unwrap(),
        )
        .unwrap();

        let (recorder, progress) = stage(Stage::Annotating);
        let read = drop.annotate(job(), &JobSpec::new("j", vec![]), &progress).await.unwrap();
        assert_eq!(read, manifest);
        let events = recorder.events();
        assert_eq!(events.last().unwrap().processed_items, 2);
        assert_eq!(events.last().unwrap().current_item.as_deref(), Some("city"));
    }

    #[tokio::test]
    async fn test_missing_manifest_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let drop = FileDrop::new(dir.path());
        let (_, progress) = stage(Stage::Annotating);
        let err = drop.annotate(job(), &JobSpec::new("j", vec![]), &progress).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_malformed_style_is_input_error() {
        let dir = tempfile::tempdir().unwrap();
        let drop = FileDrop::new(dir.path());
        std::fs::create_dir_all(drop.job_dir(job())).unwrap();
        std::fs::write(drop.job_dir(job()).join(STYLE_PROFILE_FILE), b"{not json").unwrap();

        let (_, progress) = stage(Stage::StyleExtracting);
        let err = drop.extract(job(), "ref", &progress).await.unwrap_err();
        assert!(matches!(err, CollaboratorError::Input(InputError::Malformed(_))));
        assert!(!err.is_retryable());

        let profile = StyleProfile::new(2.0, RhythmAlignment::Beat, 0.25);
        std::fs::write(
            drop.job_dir(job()).join(STYLE_PROFILE_FILE),
            serde_json::to_vec(&profile).unwrap(),
        )
        .unwrap();
        assert_eq!(drop.extract(job(), "ref", &progress).await.unwrap(), profile);
    }

    #[tokio::test]
    async fn test_stage_media_counts_files() {
        let dir = tempfile::tempdir().unwrap();
        let drop = FileDrop::new(dir.path());
        let media = drop.job_dir(job()).join(MEDIA_DIR);
        std::fs::create_dir_all(&media).unwrap();
        std::fs::write(media.join("a-roll.mov"), b"").unwrap();
        std::fs::write(media.join("b-roll.mov"), b"").unwrap();

        let (_, progress) = stage(Stage::Uploading);
        let spec = JobSpec::new("j", vec!["a-roll".to_string()]);
        assert_eq!(drop.stage_media(job(), &spec, &progress).await.unwrap(), 2);

        let missing = JobSpec::new("j", vec!["c-roll".to_string()]);
        assert!(drop.stage_media(job(), &missing, &progress).await.is_err());
    }
}
