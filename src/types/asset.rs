//! Asset manifest types produced by the external annotation stage.
//!
//! The manifest is consumed read-only by the planner. Every range is expressed
//! in seconds of source media time.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::beat::BeatGrid;
use super::InputError;

/// Identifier of a raw asset (file id, path or any stable external key).
///
/// Implements `Ord` so candidate pools and reuse bookkeeping iterate deterministically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetId(String);

impl AssetId {
    /// Create a new asset id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AssetId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Kind of raw asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    /// Footage with speech; becomes solids.
    Dialogue,
    /// Cutaway footage; becomes liquids.
    Broll,
    /// Music bed; carries the beat grid.
    Audio,
}

impl AssetKind {
    /// Parse an asset kind from string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "dialogue" | "talking_head" => Some(Self::Dialogue),
            "broll" | "b-roll" | "b_roll" => Some(Self::Broll),
            "audio" | "music" => Some(Self::Audio),
            _ => None,
        }
    }
}

impl fmt::Display for AssetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dialogue => write!(f, "dialogue"),
            Self::Broll => write!(f, "broll"),
            Self::Audio => write!(f, "audio"),
        }
    }
}

/// Half-open interval `[start, end)` in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeRange {
    /// Inclusive start.
    pub start: f64,
    /// Exclusive end.
    pub end: f64,
}

impl TimeRange {
    /// Create a new range.
    pub fn new(start: f64, end: f64) -> Self {
        Self { start, end }
    }

    /// Length of the range.
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    /// Whether two ranges share any time.
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Whether `t` falls inside the range.
    pub fn contains(&self, t: f64) -> bool {
        t >= self.start && t < self.end
    }
}

/// A window of steady, sharp footage with its stability score in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StabilityWindow {
    /// Window start in source seconds.
    pub start: f64,
    /// Window end in source seconds.
    pub end: f64,
    /// Stability score (higher is steadier).
    pub score: f64,
}

impl StabilityWindow {
    /// Create a new stability window.
    pub fn new(start: f64, end: f64, score: f64) -> Self {
        Self { start, end, score }
    }

    /// The window as a plain range.
    pub fn range(&self) -> TimeRange {
        TimeRange::new(self.start, self.end)
    }
}

/// A transcribed span of speech.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    /// Transcribed text.
    pub text: String,
    /// Segment start in source seconds.
    pub start: f64,
    /// Segment end in source seconds.
    pub end: f64,
}

/// Annotation for one raw asset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipAnnotation {
    /// Asset identifier.
    pub asset_id: AssetId,
    /// Asset kind.
    pub kind: AssetKind,
    /// Native duration in seconds.
    pub duration: f64,
    /// Speech-present, non-silent sub-ranges (dialogue only).
    #[serde(default)]
    pub valid_ranges: Vec<TimeRange>,
    /// Stability windows from visual scoring.
    #[serde(default)]
    pub stability_windows: Vec<StabilityWindow>,
    /// Optional transcript.
    #[serde(default)]
    pub transcript_segments: Vec<TranscriptSegment>,
    /// Beat grid for audio assets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub beat_grid: Option<BeatGrid>,
}

impl ClipAnnotation {
    /// Create an annotation with no ranges, windows or transcript.
    pub fn new(asset_id: impl Into<AssetId>, kind: AssetKind, duration: f64) -> Self {
        Self {
            asset_id: asset_id.into(),
            kind,
            duration,
            valid_ranges: Vec::new(),
            stability_windows: Vec::new(),
            transcript_segments: Vec::new(),
            beat_grid: None,
        }
    }

    /// Builder: set valid ranges.
    pub fn with_valid_ranges(mut self, ranges: Vec<TimeRange>) -> Self {
        self.valid_ranges = ranges;
        self
    }

    /// Builder: set stability windows.
    pub fn with_stability_windows(mut self, windows: Vec<StabilityWindow>) -> Self {
        self.stability_windows = windows;
        self
    }

    /// Builder: set transcript segments.
    pub fn with_transcript(mut self, segments: Vec<TranscriptSegment>) -> Self {
        self.transcript_segments = segments;
        self
    }

    /// Builder: attach a beat grid.
    pub fn with_beat_grid(mut self, grid: BeatGrid) -> Self {
        self.beat_grid = Some(grid);
        self
    }

    /// Text of transcript segments overlapping `range`.
    pub fn transcript_within<'a>(
        &'a self,
        range: &'a TimeRange,
    ) -> impl Iterator<Item = &'a str> + 'a {
        self.transcript_segments
            .iter()
            .filter(move |s| TimeRange::new(s.start, s.end).overlaps(range))
            .map(|s| s.text.as_str())
    }

    /// Validate the annotation's range invariants.
    pub fn validate(&self) -> Result<(), InputError> {
        if !self.duration.is_finite() || self.duration <= 0.0 {
            return Err(InputError::InvalidDuration {
                asset_id: self.asset_id.clone(),
                duration: self.duration,
            });
        }

        check_ranges(&self.asset_id, "valid_ranges", self.duration, &self.valid_ranges)?;

        let windows: Vec<TimeRange> = self.stability_windows.iter().map(|w| w.range()).collect();
        check_ranges(&self.asset_id, "stability_windows", self.duration, &windows)?;

        for window in &self.stability_windows {
            if !(0.0..=1.0).contains(&window.score) {
                return Err(InputError::InvalidRange {
                    asset_id: self.asset_id.clone(),
                    field: "stability_windows",
                    reason: format!("score {} outside [0, 1]", window.score),
                });
            }
        }

        if let Some(grid) = &self.beat_grid {
            grid.validate()?;
        }
        Ok(())
    }
}

/// Ranges must lie within `[0, duration)`, be non-empty, ordered and non-overlapping.
fn check_ranges(
    asset_id: &AssetId,
    field: &'static str,
    duration: f64,
    ranges: &[TimeRange],
) -> Result<(), InputError> {
    let mut previous_end = f64::NEG_INFINITY;
    for range in ranges {
        let reason = if !range.start.is_finite() || !range.end.is_finite() {
            Some("non-finite bound".to_string())
        } else if range.start < 0.0 || range.end > duration {
            Some(format!(
                "[{:.3}, {:.3}) outside [0, {:.3})",
                range.start, range.end, duration
            ))
        } else if range.end <= range.start {
            Some(format!("empty range [{:.3}, {:.3})", range.start, range.end))
        } else if range.start < previous_end {
            Some(format!("range starting at {:.3} overlaps or is out of order", range.start))
        } else {
            None
        };

        if let Some(reason) = reason {
            return Err(InputError::InvalidRange {
                asset_id: asset_id.clone(),
                field,
                reason,
            });
        }
        previous_end = range.end;
    }
    Ok(())
}

/// Complete manifest of annotated assets, in original narrative order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AssetManifest {
    /// Annotated assets in source order.
    pub assets: Vec<ClipAnnotation>,
}

impl AssetManifest {
    /// Create a manifest from annotations.
    pub fn new(assets: Vec<ClipAnnotation>) -> Self {
        Self { assets }
    }

    /// Validate every annotation and asset id uniqueness.
    pub fn validate(&self) -> Result<(), InputError> {
        let mut seen = std::collections::BTreeSet::new();
        for asset in &self.assets {
            if !seen.insert(&asset.asset_id) {
                return Err(InputError::DuplicateAsset(asset.asset_id.clone()));
            }
            asset.validate()?;
        }
        Ok(())
    }

    /// Assets of a given kind, in manifest order.
    pub fn of_kind(&self, kind: AssetKind) -> impl Iterator<Item = &ClipAnnotation> {
        self.assets.iter().filter(move |a| a.kind == kind)
    }

    /// Look up an asset by id.
    pub fn get(&self, id: &AssetId) -> Option<&ClipAnnotation> {
        self.assets.iter().find(|a| &a.asset_id == id)
    }

    /// The first beat grid carried by an audio asset, if any.
    pub fn beat_grid(&self) -> Option<&BeatGrid> {
        self.of_kind(AssetKind::Audio)
            .find_map(|a| a.beat_grid.as_ref())
    }

    /// The first audio asset carrying a beat grid (the music bed).
    pub fn music_bed(&self) -> Option<&ClipAnnotation> {
        self.of_kind(AssetKind::Audio)
            .find(|a| a.beat_grid.is_some())
    }

    /// Total native duration across all assets.
    pub fn total_duration(&self) -> f64 {
        self.assets.iter().map(|a| a.duration).sum()
    }

    /// Count of assets per kind as `(dialogue, broll, audio)`.
    pub fn kind_counts(&self) -> (usize, usize, usize) {
        self.assets.iter().fold((0, 0, 0), |(d, b, a), asset| match asset.kind {
            AssetKind::Dialogue => (d + 1, b, a),
            AssetKind::Broll => (d, b + 1, a),
            AssetKind::Audio => (d, b, a + 1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dialogue(id: &str, ranges: Vec<(f64, f64)>) -> ClipAnnotation {
        ClipAnnotation::new(id, AssetKind::Dialogue, 10.0)
            .with_valid_ranges(ranges.into_iter().map(|(s, e)| TimeRange::new(s, e)).collect())
    }

    #[test]
    fn test_valid_manifest_passes() {
        let manifest = AssetManifest::new(vec![
            dialogue("a", vec![(0.0, 3.0), (4.0, 6.0)]),
            ClipAnnotation::new("b", AssetKind::Broll, 5.0)
                .with_stability_windows(vec![StabilityWindow::new(0.0, 5.0, 0.9)]),
        ]);
        assert!(manifest.validate().is_ok());
    }

    #[test]
    fn test_range_outside_duration_rejected() {
        let manifest = AssetManifest::new(vec![dialogue("a", vec![(8.0, 11.0)])]);
        let err = manifest.validate().unwrap_err();
        assert!(matches!(err, InputError::InvalidRange { field: "valid_ranges", .. }));
    }

    #[test]
    fn test_overlapping_ranges_rejected() {
        let manifest = AssetManifest::new(vec![dialogue("a", vec![(0.0, 3.0), (2.0, 4.0)])]);
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_unordered_ranges_rejected() {
        let manifest = AssetManifest::new(vec![dialogue("a", vec![(4.0, 5.0), (0.0, 1.0)])]);
        assert!(manifest.validate().is_err());
    }

    #[test]
    fn test_duplicate_asset_rejected() {
        let manifest = AssetManifest::new(vec![
            dialogue("a", vec![(0.0, 1.0)]),
            dialogue("a", vec![(0.0, 1.0)]),
        ]);
        assert!(matches!(manifest.validate(), Err(InputError::DuplicateAsset(_))));
    }

    #[test]
    fn test_transcript_within_range() {
        let clip = ClipAnnotation::new("talk", AssetKind::Dialogue, 10.0).with_transcript(vec![
            TranscriptSegment { text: "hello there".into(), start: 0.0, end: 2.0 },
            TranscriptSegment { text: "city lights".into(), start: 4.0, end: 6.0 },
        ]);
        let range = TimeRange::new(3.0, 5.0);
        let words: Vec<&str> = clip.transcript_within(&range).collect();
        assert_eq!(words, vec!["city lights"]);
    }

    #[test]
    fn test_kind_parsing() {
        assert_eq!(AssetKind::from_str("B-Roll"), Some(AssetKind::Broll));
        assert_eq!(AssetKind::from_str("music"), Some(AssetKind::Audio));
        assert_eq!(AssetKind::from_str("unknown"), None);
    }

    #[test]
    fn test_manifest_json_shape() {
        let json = r#"{"assets":[{"asset_id":"clip-1","kind":"dialogue","duration":4.0,
            "valid_ranges":[{"start":0.5,"end":3.5}]}]}"#;
        let manifest: AssetManifest = serde_json::from_str(json).unwrap();
        assert_eq!(manifest.assets[0].asset_id.as_str(), "clip-1");
        assert!(manifest.assets[0].stability_windows.is_empty());
        assert!(manifest.validate().is_ok());
    }
}
