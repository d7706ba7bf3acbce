//! Timeline blueprint: the solver's fully resolved output.
//!
//! ## Invariants
//!
//! - Placed clips are ordered by `timeline_start` and never overlap
//! - `total_duration` equals the end of the last placed clip
//! - Solids play at `speed_factor == 1.0`
//! - Liquids satisfy `source_duration / speed_factor == timeline_duration`
//!   with `min_speed <= speed_factor <= max_speed`
//!
//! The exporter relies on these holding; it never re-derives gaps.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::canonical::canonical_hash_hex;
use crate::TIME_EPSILON;
use super::asset::{AssetId, AssetManifest};

/// Role of a clip on the timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClipRole {
    /// Fixed-duration dialogue clip.
    Solid,
    /// Time-warpable b-roll clip.
    Liquid,
}

impl fmt::Display for ClipRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Solid => write!(f, "solid"),
            Self::Liquid => write!(f, "liquid"),
        }
    }
}

/// One clip instance on the output timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacedClip {
    /// Source asset.
    pub source_asset_id: AssetId,
    /// Solid or liquid.
    pub role: ClipRole,
    /// Selected source in-point (seconds).
    pub source_in: f64,
    /// Selected source out-point (seconds).
    pub source_out: f64,
    /// Position on the output timeline.
    pub timeline_start: f64,
    /// Played-back duration on the output timeline.
    pub timeline_duration: f64,
    /// Playback speed; 1.0 for solids.
    pub speed_factor: f64,
}

impl PlacedClip {
    /// Place a solid: source range played at normal speed.
    pub fn solid(asset_id: AssetId, source_in: f64, source_out: f64, timeline_start: f64) -> Self {
        Self {
            source_asset_id: asset_id,
            role: ClipRole::Solid,
            source_in,
            source_out,
            timeline_start,
            timeline_duration: source_out - source_in,
            speed_factor: 1.0,
        }
    }

    /// Place a liquid whose speed makes the source range fill `timeline_duration`.
    pub fn liquid(
        asset_id: AssetId,
        source_in: f64,
        source_out: f64,
        timeline_start: f64,
        timeline_duration: f64,
    ) -> Self {
        Self {
            source_asset_id: asset_id,
            role: ClipRole::Liquid,
            source_in,
            source_out,
            timeline_start,
            timeline_duration,
            speed_factor: (source_out - source_in) / timeline_duration,
        }
    }

    /// Source seconds consumed.
    pub fn source_duration(&self) -> f64 {
        self.source_out - self.source_in
    }

    /// End position on the timeline.
    pub fn timeline_end(&self) -> f64 {
        self.timeline_start + self.timeline_duration
    }
}

/// Why part of the timeline carries no liquid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResidualReason {
    /// The gap was shorter than the minimum fill threshold.
    BelowMinimumFill,
    /// No candidate (single, split or reused) could fill the span.
    CandidatesExhausted,
    /// Hold inserted so the following liquid starts on an alignment point.
    AlignmentHold,
    /// An unfilled gap after the last solid, trimmed off the timeline end.
    TailTrimmed,
}

impl fmt::Display for ResidualReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BelowMinimumFill => write!(f, "below_minimum_fill"),
            Self::CandidatesExhausted => write!(f, "candidates_exhausted"),
            Self::AlignmentHold => write!(f, "alignment_hold"),
            Self::TailTrimmed => write!(f, "tail_trimmed"),
        }
    }
}

/// A span of a gap deliberately left empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResidualGap {
    /// Start on the timeline.
    pub start: f64,
    /// End on the timeline.
    pub end: f64,
    /// Why it was left empty.
    pub reason: ResidualReason,
}

impl ResidualGap {
    /// Length of the residual span.
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }
}

/// Music bed laid under the whole timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioBed {
    /// Audio asset.
    pub asset_id: AssetId,
    /// Source in-point.
    pub source_in: f64,
    /// Source out-point (clamped to the shorter of track and timeline).
    pub source_out: f64,
    /// Timeline position (always 0).
    pub timeline_start: f64,
}

/// Ordered, fully resolved timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Blueprint {
    /// Placed clips in timeline order.
    pub clips: Vec<PlacedClip>,
    /// Spans intentionally left empty.
    pub residual_gaps: Vec<ResidualGap>,
    /// Optional music bed.
    pub audio_bed: Option<AudioBed>,
    /// End of the last placed clip.
    pub total_duration: f64,
    /// Output frame rate forwarded to the exporter.
    pub frame_rate: f64,
    /// Hash of the planner parameters that produced this blueprint.
    pub params_hash: String,
    /// Schema version.
    pub schema_version: String,
}

/// Blueprint invariant violation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BlueprintViolation {
    /// Blueprint has no clips.
    #[error("Blueprint contains no clips")]
    Empty,
    /// Clip `index` starts before the previous clip ends.
    #[error("Clip #{index} overlaps its predecessor ({start:.6} < {previous_end:.6})")]
    Overlap {
        /// Clip index.
        index: usize,
        /// Clip start.
        start: f64,
        /// Previous clip end.
        previous_end: f64,
    },
    /// Clip has a non-positive or non-finite duration.
    #[error("Clip #{index} has invalid timeline duration {duration}")]
    InvalidDuration {
        /// Clip index.
        index: usize,
        /// Offending duration.
        duration: f64,
    },
    /// A solid was time-warped or trimmed inconsistently.
    #[error("Solid #{index} must play at speed 1.0 over its source range")]
    WarpedSolid {
        /// Clip index.
        index: usize,
    },
    /// A liquid speed is out of bounds.
    #[error("Liquid #{index} speed {speed:.6} outside [{min}, {max}]")]
    SpeedOutOfBounds {
        /// Clip index.
        index: usize,
        /// Speed factor.
        speed: f64,
        /// Lower bound.
        min: f64,
        /// Upper bound.
        max: f64,
    },
    /// A liquid's played duration does not match its slot.
    #[error("Liquid #{index} plays {played:.9}s in a {slot:.9}s slot")]
    ElasticMismatch {
        /// Clip index.
        index: usize,
        /// Source duration divided by speed.
        played: f64,
        /// Timeline duration.
        slot: f64,
    },
    /// A source range falls outside the asset.
    #[error("Clip #{index} source range [{source_in:.3}, {source_out:.3}) outside asset {asset_id}")]
    SourceOutOfBounds {
        /// Clip index.
        index: usize,
        /// Asset.
        asset_id: AssetId,
        /// In-point.
        source_in: f64,
        /// Out-point.
        source_out: f64,
    },
    /// `total_duration` disagrees with the last clip end.
    #[error("Total duration {total:.6} differs from last clip end {last_end:.6}")]
    TotalDuration {
        /// Declared total.
        total: f64,
        /// Actual last end.
        last_end: f64,
    },
}

impl Blueprint {
    /// Check every blueprint invariant.
    ///
    /// When a manifest is supplied, source ranges are also checked against
    /// asset durations.
    pub fn validate(
        &self,
        min_speed: f64,
        max_speed: f64,
        manifest: Option<&AssetManifest>,
    ) -> Result<(), BlueprintViolation> {
        if self.clips.is_empty() {
            return Err(BlueprintViolation::Empty);
        }

        let mut previous_end = f64::NEG_INFINITY;
        for (index, clip) in self.clips.iter().enumerate() {
            if !clip.timeline_duration.is_finite() || clip.timeline_duration <= 0.0 {
                return Err(BlueprintViolation::InvalidDuration {
                    index,
                    duration: clip.timeline_duration,
                });
            }
            if clip.timeline_start < previous_end - TIME_EPSILON {
                return Err(BlueprintViolation::Overlap {
                    index,
                    start: clip.timeline_start,
                    previous_end,
                });
            }

            match clip.role {
                ClipRole::Solid => {
                    if clip.speed_factor != 1.0
                        || (clip.source_duration() - clip.timeline_duration).abs() > TIME_EPSILON
                    {
                        return Err(BlueprintViolation::WarpedSolid { index });
                    }
                }
                ClipRole::Liquid => {
                    if clip.speed_factor < min_speed - TIME_EPSILON
                        || clip.speed_factor > max_speed + TIME_EPSILON
                    {
                        return Err(BlueprintViolation::SpeedOutOfBounds {
                            index,
                            speed: clip.speed_factor,
                            min: min_speed,
                            max: max_speed,
                        });
                    }
                    let played = clip.source_duration() / clip.speed_factor;
                    if (played - clip.timeline_duration).abs() > TIME_EPSILON {
                        return Err(BlueprintViolation::ElasticMismatch {
                            index,
                            played,
                            slot: clip.timeline_duration,
                        });
                    }
                }
            }

            if let Some(manifest) = manifest {
                let within = manifest
                    .get(&clip.source_asset_id)
                    .map(|asset| {
                        clip.source_in >= -TIME_EPSILON
                            && clip.source_out <= asset.duration + TIME_EPSILON
                            && clip.source_out > clip.source_in
                    })
                    .unwrap_or(false);
                if !within {
                    return Err(BlueprintViolation::SourceOutOfBounds {
                        index,
                        asset_id: clip.source_asset_id.clone(),
                        source_in: clip.source_in,
                        source_out: clip.source_out,
                    });
                }
            }

            previous_end = clip.timeline_end();
        }

        if (self.total_duration - previous_end).abs() > TIME_EPSILON {
            return Err(BlueprintViolation::TotalDuration {
                total: self.total_duration,
                last_end: previous_end,
            });
        }
        Ok(())
    }

    /// Deterministic fingerprint of the blueprint content.
    pub fn fingerprint(&self) -> String {
        canonical_hash_hex(self)
    }

    /// Placed clips with a given role.
    pub fn clips_with_role(&self, role: ClipRole) -> impl Iterator<Item = &PlacedClip> {
        self.clips.iter().filter(move |c| c.role == role)
    }

    /// Number of solids.
    pub fn solid_count(&self) -> usize {
        self.clips_with_role(ClipRole::Solid).count()
    }

    /// Number of liquids.
    pub fn liquid_count(&self) -> usize {
        self.clips_with_role(ClipRole::Liquid).count()
    }

    /// Fraction of timeline time covered by liquids.
    pub fn liquid_ratio(&self) -> f64 {
        if self.total_duration <= 0.0 {
            return 0.0;
        }
        let liquid: f64 = self
            .clips_with_role(ClipRole::Liquid)
            .map(|c| c.timeline_duration)
            .sum();
        liquid / self.total_duration
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blueprint(clips: Vec<PlacedClip>) -> Blueprint {
        let total = clips.last().map(|c| c.timeline_end()).unwrap_or(0.0);
        Blueprint {
            clips,
            residual_gaps: vec![],
            audio_bed: None,
            total_duration: total,
            frame_rate: 30.0,
            params_hash: "test".to_string(),
            schema_version: crate::EDIT_PLAN_SCHEMA_VERSION.to_string(),
        }
    }

    #[test]
    fn test_liquid_speed_from_slot() {
        let clip = PlacedClip::liquid(AssetId::from("b"), 1.0, 4.0, 3.0, 2.0);
        assert!((clip.speed_factor - 1.5).abs() < 1e-12);
        assert!((clip.source_duration() / clip.speed_factor - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_valid_blueprint() {
        let bp = blueprint(vec![
            PlacedClip::solid(AssetId::from("a"), 0.0, 3.0, 0.0),
            PlacedClip::liquid(AssetId::from("b"), 0.0, 2.0, 3.0, 2.0),
            PlacedClip::solid(AssetId::from("c"), 1.0, 4.0, 5.0),
        ]);
        assert!(bp.validate(0.5, 2.0, None).is_ok());
        assert_eq!(bp.solid_count(), 2);
        assert_eq!(bp.liquid_count(), 1);
        assert!((bp.liquid_ratio() - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_overlap_detected() {
        let bp = blueprint(vec![
            PlacedClip::solid(AssetId::from("a"), 0.0, 3.0, 0.0),
            PlacedClip::solid(AssetId::from("c"), 0.0, 3.0, 2.0),
        ]);
        assert!(matches!(
            bp.validate(0.5, 2.0, None),
            Err(BlueprintViolation::Overlap { index: 1, .. })
        ));
    }

    #[test]
    fn test_speed_bounds_enforced() {
        let bp = blueprint(vec![PlacedClip::liquid(AssetId::from("b"), 0.0, 6.0, 0.0, 2.0)]);
        assert!(matches!(
            bp.validate(0.5, 2.0, None),
            Err(BlueprintViolation::SpeedOutOfBounds { .. })
        ));
    }

    #[test]
    fn test_total_duration_checked() {
        let mut bp = blueprint(vec![PlacedClip::solid(AssetId::from("a"), 0.0, 3.0, 0.0)]);
        bp.total_duration = 4.0;
        assert!(matches!(
            bp.validate(0.5, 2.0, None),
            Err(BlueprintViolation::TotalDuration { .. })
        ));
    }

    #[test]
    fn test_fingerprint_stable() {
        let bp = blueprint(vec![PlacedClip::solid(AssetId::from("a"), 0.0, 3.0, 0.0)]);
        assert_eq!(bp.fingerprint(), bp.clone().fingerprint());
    }
}
