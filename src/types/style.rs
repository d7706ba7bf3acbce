//! Style profile learned from a reference edit.

use serde::{Deserialize, Serialize};

use super::beat::RhythmAlignment;
use super::InputError;

/// Stylistic constraints extracted from a reference edit.
///
/// All fields are advisory inputs to the planner; `constraints` never bind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StyleProfile {
    /// Target shot duration in seconds (> 0).
    pub target_shot_duration: f64,
    /// Which timing reference cuts should land on.
    #[serde(default)]
    pub rhythm_alignment: RhythmAlignment,
    /// Fraction of timeline time expected to be liquid, in `[0, 1]`.
    #[serde(default)]
    pub broll_interleave_ratio: f64,
    /// Free-text advisory notes.
    #[serde(default)]
    pub constraints: Vec<String>,
}

impl StyleProfile {
    /// Create a profile with no free-text constraints.
    pub fn new(
        target_shot_duration: f64,
        rhythm_alignment: RhythmAlignment,
        broll_interleave_ratio: f64,
    ) -> Self {
        Self {
            target_shot_duration,
            rhythm_alignment,
            broll_interleave_ratio,
            constraints: Vec::new(),
        }
    }

    /// Validate ranges of every numeric field.
    pub fn validate(&self) -> Result<(), InputError> {
        if !self.target_shot_duration.is_finite() || self.target_shot_duration <= 0.0 {
            return Err(InputError::InvalidStyleProfile(format!(
                "target_shot_duration must be > 0, got {}",
                self.target_shot_duration
            )));
        }
        if !(0.0..=1.0).contains(&self.broll_interleave_ratio) {
            return Err(InputError::InvalidStyleProfile(format!(
                "broll_interleave_ratio must be within [0, 1], got {}",
                self.broll_interleave_ratio
            )));
        }
        Ok(())
    }
}

/// Parameters the planner derives from an optional profile.
///
/// Absence of a profile means no alignment and zero interleave bias.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EffectiveStyle {
    /// Shot target, if a profile was given.
    pub target_shot_duration: Option<f64>,
    /// Alignment mode.
    pub rhythm_alignment: RhythmAlignment,
    /// Interleave ratio.
    pub broll_interleave_ratio: f64,
}

impl EffectiveStyle {
    /// Resolve a profile (or its absence) into planner parameters.
    pub fn resolve(profile: Option<&StyleProfile>) -> Self {
        match profile {
            Some(p) => Self {
                target_shot_duration: Some(p.target_shot_duration),
                rhythm_alignment: p.rhythm_alignment,
                broll_interleave_ratio: p.broll_interleave_ratio,
            },
            None => Self {
                target_shot_duration: None,
                rhythm_alignment: RhythmAlignment::None,
                broll_interleave_ratio: 0.0,
            },
        }
    }
}
