//! Solid placement and gap layout.
//!
//! Solids are laid down in manifest order, back to back, separated by a
//! uniform spacing derived from the style. Each gap end (the next solid's
//! start) may be pushed onto an alignment point; solids never move backwards
//! and never change length.

use crate::policy::PlannerConfig;
use crate::types::{AlignmentGrid, AssetKind, AssetManifest, ClipAnnotation, EffectiveStyle, TimeRange};
use crate::TIME_EPSILON;

/// Interleave ratios are clamped below 1 so the spacing stays finite.
const MAX_INTERLEAVE_RATIO: f64 = 0.95;

/// A timeline interval between solids, available for liquids.
///
/// Derived on every planning run and never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct Gap {
    /// Position in timeline order.
    pub index: usize,
    /// Timeline start.
    pub start: f64,
    /// Timeline end.
    pub end: f64,
    /// Index of the solid ending at `start`.
    pub before: Option<usize>,
    /// Index of the solid starting at `end`.
    pub after: Option<usize>,
}

impl Gap {
    /// Create a gap with no neighbouring solids recorded.
    pub fn new(index: usize, start: f64, end: f64) -> Self {
        Self { index, start, end, before: None, after: None }
    }

    /// Gap length.
    pub fn duration(&self) -> f64 {
        self.end - self.start
    }

    /// Whether nothing follows the gap.
    pub fn is_tail(&self) -> bool {
        self.after.is_none() && self.before.is_some()
    }
}

/// A dialogue range chosen as a solid, before placement.
#[derive(Debug, Clone, Copy)]
pub struct SolidSource<'a> {
    /// Dialogue asset.
    pub asset: &'a ClipAnnotation,
    /// Valid range played verbatim.
    pub range: TimeRange,
}

/// A solid with its timeline position.
#[derive(Debug, Clone, Copy)]
pub struct PlacedSolid<'a> {
    /// What is played.
    pub source: SolidSource<'a>,
    /// Where it starts on the timeline.
    pub timeline_start: f64,
}

impl PlacedSolid<'_> {
    /// Timeline end.
    pub fn timeline_end(&self) -> f64 {
        self.timeline_start + self.source.range.duration()
    }
}

/// Solids and gaps of one planning run.
#[derive(Debug, Clone, Default)]
pub struct Layout<'a> {
    /// Solids in timeline order.
    pub solids: Vec<PlacedSolid<'a>>,
    /// Gaps in timeline order.
    pub gaps: Vec<Gap>,
}

/// One solid per valid range of each dialogue asset, manifest order then range order.
pub fn collect_solids(manifest: &AssetManifest) -> Vec<SolidSource<'_>> {
    manifest
        .of_kind(AssetKind::Dialogue)
        .flat_map(|asset| {
            asset
                .valid_ranges
                .iter()
                .filter(|r| r.duration() > TIME_EPSILON)
                .map(move |range| SolidSource { asset, range: *range })
        })
        .collect()
}

/// Uniform spacing between solids.
///
/// The larger of the style padding (`target_shot_duration * solid_padding_ratio`)
/// and the interleave share, which spreads `ratio / (1 - ratio)` of the total
/// solid time evenly over the available slots. Capped at `max_gap`.
pub fn gap_length(
    solids: &[SolidSource<'_>],
    style: &EffectiveStyle,
    config: &PlannerConfig,
) -> f64 {
    let padding = style
        .target_shot_duration
        .map_or(0.0, |target| target * config.solid_padding_ratio);

    let slots = solids.len().saturating_sub(1) + if config.edge_gaps { 2 } else { 0 };
    let ratio = style.broll_interleave_ratio.clamp(0.0, MAX_INTERLEAVE_RATIO);
    let share = if slots > 0 && ratio > 0.0 {
        let solid_total: f64 = solids.iter().map(|s| s.range.duration()).sum();
        ratio / (1.0 - ratio) * solid_total / slots as f64
    } else {
        0.0
    };

    padding.max(share).min(config.max_gap)
}

/// Place solids and derive gaps.
pub fn layout<'a>(
    solids: &[SolidSource<'a>],
    spacing: f64,
    edge_gaps: bool,
    align: &AlignmentGrid,
) -> Layout<'a> {
    let mut out = Layout::default();
    if solids.is_empty() {
        return out;
    }
    let spaced = spacing > TIME_EPSILON;
    let mut cursor = 0.0;

    if spaced && edge_gaps {
        let end = snap_gap_end(align, cursor, spacing);
        out.gaps.push(Gap { index: 0, start: cursor, end, before: None, after: Some(0) });
        cursor = end;
    }

    for (i, source) in solids.iter().enumerate() {
        if i > 0 && spaced {
            let end = snap_gap_end(align, cursor, spacing);
            out.gaps.push(Gap {
                index: out.gaps.len(),
                start: cursor,
                end,
                before: Some(i - 1),
                after: Some(i),
            });
            cursor = end;
        }
        out.solids.push(PlacedSolid { source: *source, timeline_start: cursor });
        cursor += source.range.duration();
    }

    if spaced && edge_gaps {
        let end = snap_gap_end(align, cursor, spacing);
        out.gaps.push(Gap {
            index: out.gaps.len(),
            start: cursor,
            end,
            before: Some(solids.len() - 1),
            after: None,
        });
    }
    out
}

/// End of a gap starting at `start`, nudged onto an alignment point within tolerance.
fn snap_gap_end(align: &AlignmentGrid, start: f64, spacing: f64) -> f64 {
    let nominal = start + spacing;
    align
        .snap_within(nominal, start + TIME_EPSILON, f64::INFINITY)
        .unwrap_or(nominal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BeatGrid, RhythmAlignment};

    fn talk(id: &str, ranges: &[(f64, f64)]) -> ClipAnnotation {
        ClipAnnotation::new(id, AssetKind::Dialogue, 10.0)
            .with_valid_ranges(ranges.iter().map(|&(s, e)| TimeRange::new(s, e)).collect())
    }

    fn style(ratio: f64) -> EffectiveStyle {
        EffectiveStyle {
            target_shot_duration: Some(2.0),
            rhythm_alignment: RhythmAlignment::Beat,
            broll_interleave_ratio: ratio,
        }
    }

    #[test]
    fn test_solids_follow_manifest_then_range_order() {
        let manifest = AssetManifest::new(vec![
            talk("b", &[(5.0, 6.0)]),
            ClipAnnotation::new("x", AssetKind::Broll, 4.0),
            talk("a", &[(0.0, 1.0), (2.0, 4.0)]),
        ]);
        let solids = collect_solids(&manifest);
        let order: Vec<(&str, f64)> = solids
            .iter()
            .map(|s| (s.asset.asset_id.as_str(), s.range.start))
            .collect();
        assert_eq!(order, vec![("b", 5.0), ("a", 0.0), ("a", 2.0)]);
    }

    #[test]
    fn test_back_to_back_without_spacing() {
        let manifest = AssetManifest::new(vec![talk("a", &[(0.0, 3.0)]), talk("b", &[(1.0, 4.0)])]);
        let solids = collect_solids(&manifest);
        let out = layout(&solids, 0.0, true, &AlignmentGrid::default());
        assert!(out.gaps.is_empty());
        assert_eq!(out.solids[1].timeline_start, 3.0);
    }

    #[test]
    fn test_interleave_share() {
        let manifest = AssetManifest::new(vec![talk("a", &[(0.0, 3.0)]), talk("b", &[(0.0, 3.0)])]);
        let solids = collect_solids(&manifest);
        let spacing = gap_length(&solids, &style(0.25), &PlannerConfig::default());
        assert!((spacing - 2.0).abs() < 1e-9);

        let out = layout(&solids, spacing, false, &AlignmentGrid::default());
        assert_eq!(out.gaps.len(), 1);
        assert_eq!(out.gaps[0].before, Some(0));
        assert_eq!(out.gaps[0].after, Some(1));
        assert!((out.solids[1].timeline_start - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_spacing_capped_by_max_gap() {
        let manifest = AssetManifest::new(vec![talk("a", &[(0.0, 9.0)]), talk("b", &[(0.0, 9.0)])]);
        let solids = collect_solids(&manifest);
        let mut config = PlannerConfig::default();
        config.max_gap = 4.0;
        assert_eq!(gap_length(&solids, &style(0.9), &config), 4.0);
    }

    #[test]
    fn test_gap_end_snaps_forward_to_beat() {
        let manifest = AssetManifest::new(vec![talk("a", &[(0.0, 2.9)]), talk("b", &[(0.0, 3.0)])]);
        let solids = collect_solids(&manifest);
        let grid = BeatGrid::uniform(0.5, 60.0);
        let align = AlignmentGrid::new(Some(&grid), RhythmAlignment::Beat, 0.25);
        let out = layout(&solids, 2.0, false, &align);
        // Nominal end 4.9 snaps to 5.0.
        assert!((out.gaps[0].end - 5.0).abs() < 1e-9);
        assert!((out.solids[1].timeline_start - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_edge_gaps() {
        let manifest = AssetManifest::new(vec![talk("a", &[(0.0, 3.0)])]);
        let solids = collect_solids(&manifest);
        let out = layout(&solids, 1.0, true, &AlignmentGrid::default());
        assert_eq!(out.gaps.len(), 2);
        assert_eq!(out.gaps[0].before, None);
        assert!(out.gaps[1].is_tail());
        assert_eq!(out.solids[0].timeline_start, 1.0);
    }
}
