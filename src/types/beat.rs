//! Musical timing references used for rhythm-aligned cut placement.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::InputError;

/// Default number of beats per bar (4/4 time).
pub const DEFAULT_BEATS_PER_BAR: u32 = 4;

fn default_beats_per_bar() -> u32 {
    DEFAULT_BEATS_PER_BAR
}

/// Which timing reference liquid cut points should land on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RhythmAlignment {
    /// Snap to beats.
    Beat,
    /// Snap to bar boundaries (every `beats_per_bar` beats).
    Bar,
    /// Snap to transient onsets.
    Onset,
    /// No alignment.
    #[default]
    None,
}

impl RhythmAlignment {
    /// Parse an alignment mode from string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "beat" => Some(Self::Beat),
            "bar" => Some(Self::Bar),
            "onset" => Some(Self::Onset),
            "none" | "" => Some(Self::None),
            _ => None,
        }
    }
}

impl fmt::Display for RhythmAlignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Beat => write!(f, "beat"),
            Self::Bar => write!(f, "bar"),
            Self::Onset => write!(f, "onset"),
            Self::None => write!(f, "none"),
        }
    }
}

/// Beat timestamps plus onsets, all strictly increasing.
///
/// Bars are derived: every `beats_per_bar`-th beat starting at the first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeatGrid {
    /// Beat timestamps in seconds.
    pub beats: Vec<f64>,
    /// Onset timestamps in seconds.
    #[serde(default)]
    pub onsets: Vec<f64>,
    /// Beats per bar.
    #[serde(default = "default_beats_per_bar")]
    pub beats_per_bar: u32,
}

impl BeatGrid {
    /// Create a grid from beats and onsets with 4 beats per bar.
    pub fn new(beats: Vec<f64>, onsets: Vec<f64>) -> Self {
        Self {
            beats,
            onsets,
            beats_per_bar: DEFAULT_BEATS_PER_BAR,
        }
    }

    /// Evenly spaced beats from `0` up to (excluding) `until`.
    pub fn uniform(interval: f64, until: f64) -> Self {
        let count = if interval > 0.0 { (until / interval).ceil() as usize } else { 0 };
        let beats = (0..count)
            .map(|i| i as f64 * interval)
            .filter(|t| *t < until)
            .collect();
        Self::new(beats, Vec::new())
    }

    /// Derived bar boundaries.
    pub fn bars(&self) -> Vec<f64> {
        let step = self.beats_per_bar.max(1) as usize;
        self.beats.iter().step_by(step).copied().collect()
    }

    /// Alignment points for a mode, in increasing order.
    pub fn points(&self, alignment: RhythmAlignment) -> Vec<f64> {
        match alignment {
            RhythmAlignment::Beat => self.beats.clone(),
            RhythmAlignment::Bar => self.bars(),
            RhythmAlignment::Onset => self.onsets.clone(),
            RhythmAlignment::None => Vec::new(),
        }
    }

    /// Validate strictly increasing, finite, non-negative timestamps.
    pub fn validate(&self) -> Result<(), InputError> {
        check_increasing("beats", &self.beats)?;
        check_increasing("onsets", &self.onsets)?;
        if self.beats_per_bar == 0 {
            return Err(InputError::InvalidBeatGrid {
                field: "beats_per_bar",
                reason: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

fn check_increasing(field: &'static str, times: &[f64]) -> Result<(), InputError> {
    let mut previous = f64::NEG_INFINITY;
    for (i, &t) in times.iter().enumerate() {
        if !t.is_finite() || t < 0.0 {
            return Err(InputError::InvalidBeatGrid {
                field,
                reason: format!("timestamp #{} ({}) is not a finite non-negative time", i, t),
            });
        }
        if t <= previous {
            return Err(InputError::InvalidBeatGrid {
                field,
                reason: format!("timestamp #{} ({:.4}) is not strictly increasing", i, t),
            });
        }
        previous = t;
    }
    Ok(())
}

/// Sorted alignment points with nearest-neighbour snapping.
#[derive(Debug, Clone, Default)]
pub struct AlignmentGrid {
    points: Vec<f64>,
    tolerance: f64,
}

impl AlignmentGrid {
    /// Build from a beat grid; an absent grid or `None` alignment yields an empty grid.
    pub fn new(grid: Option<&BeatGrid>, alignment: RhythmAlignment, tolerance: f64) -> Self {
        Self {
            points: grid.map(|g| g.points(alignment)).unwrap_or_default(),
            tolerance: tolerance.max(0.0),
        }
    }

    /// Whether snapping can ever happen.
    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Snap tolerance in seconds.
    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    /// Nearest point to `t` within tolerance whose value lies in `[lo, hi]`.
    ///
    /// Ties between two equidistant points resolve to the earlier one.
    pub fn snap_within(&self, t: f64, lo: f64, hi: f64) -> Option<f64> {
        let from = self.points.partition_point(|&p| p < (t - self.tolerance).max(lo));
        let mut best: Option<f64> = None;
        for &p in &self.points[from..] {
            if p > t + self.tolerance || p > hi {
                break;
            }
            let better = match best {
                Some(b) => (p - t).abs() < (b - t).abs(),
                None => true,
            };
            if better {
                best = Some(p);
            }
        }
        best
    }

    /// Nearest point to `t` within tolerance, unconstrained.
    pub fn snap(&self, t: f64) -> Option<f64> {
        self.snap_within(t, f64::NEG_INFINITY, f64::INFINITY)
    }

    /// Whether `t` lies on an alignment point (within `epsilon`).
    pub fn is_aligned(&self, t: f64, epsilon: f64) -> bool {
        let i = self.points.partition_point(|&p| p < t - epsilon);
        self.points.get(i).map_or(false, |&p| (p - t).abs() <= epsilon)
    }
}
