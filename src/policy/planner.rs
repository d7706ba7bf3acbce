//! Planner configuration: speed bounds, fill thresholds and fallback policy.
//!
//! ## Float Normalization for Deterministic Hashing
//!
//! Floats are quantized to integer microseconds before hashing so the
//! `params_hash` recorded on every blueprint is stable across platforms.

use serde::{Deserialize, Serialize};

use crate::canonical::{canonical_hash_hex, quantize_seconds};
use crate::DEFAULT_PLANNER_VERSION;

/// Quantized planner parameters for deterministic hashing.
#[derive(Debug, Clone, Serialize)]
struct QuantizedPlannerParams {
    version: String,
    min_speed: i64,
    max_speed: i64,
    min_fill: i64,
    snap_tolerance: i64,
    stability_threshold: i64,
    solid_padding_ratio: i64,
    max_gap: i64,
    edge_gaps: bool,
    allow_residual_gaps: bool,
    allow_reuse: bool,
}

/// Planner configuration.
///
/// ## Parameters
///
/// - `min_speed` / `max_speed`: time-warp bounds for liquids
/// - `min_fill`: gaps shorter than this stay empty
/// - `snap_tolerance`: max distance a cut may move to land on an alignment point
/// - `stability_threshold`: minimum window score to prefer a window
/// - `solid_padding_ratio`: padding between solids as a fraction of the shot target
/// - `max_gap`: upper bound on a single interleave gap
/// - `edge_gaps`: allow liquids before the first and after the last solid
/// - `allow_residual_gaps`: leave unfillable gaps empty instead of failing
/// - `allow_reuse`: reuse consumed liquids (non-overlapping ranges) once the pool is exhausted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Planner version identifier.
    pub version: String,
    /// Slowest allowed liquid playback.
    pub min_speed: f64,
    /// Fastest allowed liquid playback.
    pub max_speed: f64,
    /// Minimum gap duration worth filling (seconds).
    pub min_fill: f64,
    /// Alignment snap tolerance (seconds).
    pub snap_tolerance: f64,
    /// Minimum stability score for a preferred window.
    pub stability_threshold: f64,
    /// Padding between solids as a fraction of `target_shot_duration`.
    pub solid_padding_ratio: f64,
    /// Maximum length of one interleave gap (seconds).
    pub max_gap: f64,
    /// Whether lead-in and tail gaps exist.
    pub edge_gaps: bool,
    /// Whether unfillable gaps are recorded instead of failing.
    pub allow_residual_gaps: bool,
    /// Whether exhausted pools may reuse liquids.
    pub allow_reuse: bool,
}

impl PlannerConfig {
    /// Get the planner version id.
    pub fn planner_id(&self) -> &str {
        &self.version
    }

    /// The playback speed a liquid uses when it has source to spare.
    ///
    /// Normal speed, pulled into `[min_speed, max_speed]` when the bounds exclude it.
    pub fn natural_speed(&self) -> f64 {
        1.0_f64.clamp(self.min_speed, self.max_speed)
    }

    /// Check bounds and orderings.
    pub fn validate(&self) -> Result<(), String> {
        if !(self.min_speed > 0.0 && self.min_speed.is_finite()) {
            return Err(format!("min_speed must be > 0, got {}", self.min_speed));
        }
        if !(self.max_speed >= self.min_speed && self.max_speed.is_finite()) {
            return Err(format!(
                "max_speed ({}) must be finite and >= min_speed ({})",
                self.max_speed, self.min_speed
            ));
        }
        for (name, value) in [
            ("min_fill", self.min_fill),
            ("snap_tolerance", self.snap_tolerance),
            ("solid_padding_ratio", self.solid_padding_ratio),
            ("max_gap", self.max_gap),
        ] {
            if !(value >= 0.0 && value.is_finite()) {
                return Err(format!("{} must be a finite non-negative number, got {}", name, value));
            }
        }
        if !(0.0..=1.0).contains(&self.stability_threshold) {
            return Err(format!(
                "stability_threshold must be within [0, 1], got {}",
                self.stability_threshold
            ));
        }
        Ok(())
    }

    /// Hash of the quantized parameters.
    pub fn params_hash(&self) -> String {
        canonical_hash_hex(&self.to_quantized())
    }

    fn to_quantized(&self) -> QuantizedPlannerParams {
        QuantizedPlannerParams {
            version: self.version.clone(),
            min_speed: quantize_seconds(self.min_speed),
            max_speed: quantize_seconds(self.max_speed),
            min_fill: quantize_seconds(self.min_fill),
            snap_tolerance: quantize_seconds(self.snap_tolerance),
            stability_threshold: quantize_seconds(self.stability_threshold),
            solid_padding_ratio: quantize_seconds(self.solid_padding_ratio),
            max_gap: quantize_seconds(self.max_gap),
            edge_gaps: self.edge_gaps,
            allow_residual_gaps: self.allow_residual_gaps,
            allow_reuse: self.allow_reuse,
        }
    }

    /// Strict variant: unfillable gaps fail planning.
    pub fn strict() -> Self {
        Self {
            allow_residual_gaps: false,
            ..Self::default()
        }
    }
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            version: DEFAULT_PLANNER_VERSION.to_string(),
            min_speed: 0.5,
            max_speed: 2.0,
            min_fill: 0.5,
            snap_tolerance: 0.25,
            stability_threshold: 0.5,
            solid_padding_ratio: 0.0,
            max_gap: 30.0,
            edge_gaps: false,
            allow_residual_gaps: true,
            allow_reuse: true,
        }
    }
}
