//! Elastic time fitting of liquids into gaps.
//!
//! A liquid plays `source_out - source_in` seconds of footage in a slot of
//! `timeline_duration` seconds, so `speed_factor = source / slot`. With footage
//! to spare the liquid plays at the natural speed and is trimmed; otherwise it
//! is slowed down, never below `min_speed`.

use crate::policy::PlannerConfig;
use crate::types::{ClipAnnotation, StabilityWindow, TimeRange};
use crate::TIME_EPSILON;

/// Source range and speed chosen for one slot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ElasticFit {
    /// Source in-point.
    pub source_in: f64,
    /// Source out-point.
    pub source_out: f64,
    /// Playback speed.
    pub speed: f64,
}

/// Pick the source region a liquid is cut from.
///
/// Among stability windows at least `required` long: the best-scoring one at
/// or above the threshold, else the highest-scoring one. Equal scores keep
/// the earliest window. Without any usable window the whole clip is used.
pub fn select_region(asset: &ClipAnnotation, threshold: f64, required: f64) -> TimeRange {
    let usable = || {
        asset
            .stability_windows
            .iter()
            .filter(move |w| w.end - w.start >= required - TIME_EPSILON)
    };

    let best = |above: bool| {
        usable()
            .filter(|w| !above || w.score >= threshold)
            .fold(None, |best: Option<&StabilityWindow>, w| match best {
                Some(b) if b.score >= w.score => Some(b),
                _ => Some(w),
            })
    };

    best(true)
        .or_else(|| best(false))
        .map(|w| w.range())
        .unwrap_or_else(|| TimeRange::new(0.0, asset.duration))
}

/// Fit `region` into a slot of `slot` seconds.
///
/// Returns `None` when even `min_speed` cannot stretch the region over the slot.
pub fn fit(region: TimeRange, slot: f64, config: &PlannerConfig) -> Option<ElasticFit> {
    if slot <= TIME_EPSILON || region.duration() <= TIME_EPSILON {
        return None;
    }
    let natural = config.natural_speed();
    let available = region.duration();

    if available >= natural * slot - TIME_EPSILON {
        let source_out = (region.start + natural * slot).min(region.end);
        return Some(ElasticFit {
            source_in: region.start,
            source_out,
            speed: (source_out - region.start) / slot,
        });
    }

    let speed = available / slot;
    if speed >= config.min_speed - TIME_EPSILON {
        Some(ElasticFit {
            source_in: region.start,
            source_out: region.end,
            speed,
        })
    } else {
        None
    }
}

/// Longest slot a region can cover, at the slowest allowed speed.
pub fn max_cover(region: TimeRange, config: &PlannerConfig) -> f64 {
    region.duration() / config.min_speed
}

/// Largest sub-range of `[0, duration)` not overlapping any of `taken`.
///
/// Equal lengths keep the earliest range.
pub fn largest_free_range(duration: f64, taken: &[TimeRange]) -> Option<TimeRange> {
    let mut sorted: Vec<TimeRange> = taken.to_vec();
    sorted.sort_by(|a, b| a.start.total_cmp(&b.start));

    let mut best: Option<TimeRange> = None;
    let mut cursor = 0.0_f64;
    let consider = |range: TimeRange, best: &mut Option<TimeRange>| {
        if range.duration() > TIME_EPSILON
            && best.map_or(true, |b| range.duration() > b.duration() + TIME_EPSILON)
        {
            *best = Some(range);
        }
    };

    for range in &sorted {
        consider(TimeRange::new(cursor, range.start.min(duration)), &mut best);
        cursor = cursor.max(range.end);
    }
    consider(TimeRange::new(cursor, duration), &mut best);
    best
}
