//! Deterministic timeline solver.
//!
//! Places solids in manifest order, derives gaps between them and pours
//! time-warped liquids into each gap. The solver is a pure, synchronous
//! function of its inputs: no I/O, no randomness, no shared state.
//!
//! ## Algorithm
//!
//! 1. One solid per valid dialogue range, manifest order then range order
//! 2. Uniform spacing from the style (padding or interleave share), each gap
//!    end nudged onto an alignment point within tolerance
//! 3. For each gap, in timeline order:
//!    - shorter than `min_fill`: left empty
//!    - liquid start snapped forward onto an alignment point (the sliver is a hold)
//!    - first ranked unused candidate that fits within speed bounds
//!    - else split across two unused candidates
//!    - else reuse a consumed candidate on a non-overlapping source range
//!    - else record a residual gap (or fail in strict mode)
//! 4. Validate every blueprint invariant before returning

pub mod elastic;
pub mod gaps;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::policy::{AdjacentSolid, CandidateRanker, GapContext, KeywordOverlapRanker, PlannerConfig};
use crate::types::{
    AlignmentGrid, AssetId, AssetKind, AssetManifest, AudioBed, Blueprint, BlueprintViolation,
    ClipAnnotation, EffectiveStyle, InputError, PlacedClip, ResidualGap, ResidualReason,
    StyleProfile, TimeRange,
};
use crate::{EDIT_PLAN_SCHEMA_VERSION, TIME_EPSILON};

pub use elastic::ElasticFit;
pub use gaps::{Gap, Layout, PlacedSolid, SolidSource};

/// Default output frame rate.
pub const DEFAULT_FRAME_RATE: f64 = 60.0;

/// Error type for planning.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PlanningError {
    /// No dialogue asset has a valid range.
    #[error("Manifest has no dialogue asset with a valid range")]
    NoValidSolids,
    /// A gap could not be filled and residual gaps are disabled.
    #[error("Gap #{index} [{start:.3}, {end:.3}) cannot be filled by any candidate")]
    UnfillableGap {
        /// Gap index.
        index: usize,
        /// Gap start.
        start: f64,
        /// Gap end.
        end: f64,
    },
    /// The assembled blueprint broke an invariant.
    #[error("Blueprint invariant violated: {0}")]
    InvariantViolation(#[from] BlueprintViolation),
    /// Manifest or style profile failed validation.
    #[error("Invalid planner input: {0}")]
    Input(#[from] InputError),
    /// Planner configuration is inconsistent.
    #[error("Invalid planner configuration: {0}")]
    InvalidConfig(String),
}

/// Timeline solver.
///
/// Cheap to clone; the ranker is shared.
#[derive(Clone)]
pub struct TimelineSolver {
    config: PlannerConfig,
    ranker: Arc<dyn CandidateRanker>,
    frame_rate: f64,
}

impl std::fmt::Debug for TimelineSolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimelineSolver")
            .field("config", &self.config)
            .field("frame_rate", &self.frame_rate)
            .finish_non_exhaustive()
    }
}

impl TimelineSolver {
    /// Create a solver with keyword-overlap ranking.
    pub fn new(config: PlannerConfig) -> Self {
        Self {
            config,
            ranker: Arc::new(KeywordOverlapRanker::new()),
            frame_rate: DEFAULT_FRAME_RATE,
        }
    }

    /// Builder: replace the candidate ranker.
    pub fn with_ranker(mut self, ranker: Arc<dyn CandidateRanker>) -> Self {
        self.ranker = ranker;
        self
    }

    /// Builder: set the output frame rate recorded on the blueprint.
    pub fn with_frame_rate(mut self, frame_rate: f64) -> Self {
        self.frame_rate = frame_rate;
        self
    }

    /// Get the planner configuration.
    pub fn config(&self) -> &PlannerConfig {
        &self.config
    }

    /// Plan a blueprint.
    ///
    /// Identical inputs produce byte-identical blueprints.
    pub fn solve(
        &self,
        manifest: &AssetManifest,
        style: Option<&StyleProfile>,
    ) -> Result<Blueprint, PlanningError> {
        self.config.validate().map_err(PlanningError::InvalidConfig)?;
        manifest.validate()?;
        if let Some(profile) = style {
            profile.validate()?;
        }

        let solids = gaps::collect_solids(manifest);
        if solids.is_empty() {
            return Err(PlanningError::NoValidSolids);
        }

        let effective = EffectiveStyle::resolve(style);
        let align = AlignmentGrid::new(
            manifest.beat_grid(),
            effective.rhythm_alignment,
            self.config.snap_tolerance,
        );
        let spacing = gaps::gap_length(&solids, &effective, &self.config);
        let layout = gaps::layout(&solids, spacing, self.config.edge_gaps, &align);

        tracing::debug!(
            solids = layout.solids.len(),
            gaps = layout.gaps.len(),
            spacing,
            alignment = %effective.rhythm_alignment,
            "Solids placed"
        );

        let mut pour = Pour {
            config: &self.config,
            align: &align,
            candidates: manifest.of_kind(AssetKind::Broll).collect(),
            used: BTreeMap::new(),
            liquids: Vec::new(),
            residuals: Vec::new(),
        };
        for gap in &layout.gaps {
            let context = GapContext {
                gap,
                before: gap.before.map(|i| adjacent(&layout, i)),
                after: gap.after.map(|i| adjacent(&layout, i)),
            };
            let ranked = self.ranked(&context, &pour.candidates);
            pour.fill(gap, &ranked)?;
        }

        let blueprint = self.assemble(manifest, &layout, pour.liquids, pour.residuals);
        blueprint.validate(self.config.min_speed, self.config.max_speed, Some(manifest))?;

        tracing::info!(
            solids = blueprint.solid_count(),
            liquids = blueprint.liquid_count(),
            residual_gaps = blueprint.residual_gaps.len(),
            total_duration = blueprint.total_duration,
            "Blueprint planned"
        );
        Ok(blueprint)
    }

    /// Ranker output with out-of-range and repeated indices removed.
    fn ranked(&self, context: &GapContext<'_>, candidates: &[&ClipAnnotation]) -> Vec<usize> {
        let mut seen = BTreeSet::new();
        self.ranker
            .rank(context, candidates)
            .into_iter()
            .filter(|&i| i < candidates.len() && seen.insert(i))
            .collect()
    }

    fn assemble(
        &self,
        manifest: &AssetManifest,
        layout: &Layout<'_>,
        liquids: Vec<PlacedClip>,
        mut residual_gaps: Vec<ResidualGap>,
    ) -> Blueprint {
        let mut clips: Vec<PlacedClip> = layout
            .solids
            .iter()
            .map(|s| {
                PlacedClip::solid(
                    s.source.asset.asset_id.clone(),
                    s.source.range.start,
                    s.source.range.end,
                    s.timeline_start,
                )
            })
            .chain(liquids)
            .collect();
        clips.sort_by(|a, b| a.timeline_start.total_cmp(&b.timeline_start));
        residual_gaps.sort_by(|a, b| a.start.total_cmp(&b.start));

        let total_duration = clips.last().map_or(0.0, PlacedClip::timeline_end);
        let audio_bed = manifest.music_bed().map(|track| AudioBed {
            asset_id: track.asset_id.clone(),
            source_in: 0.0,
            source_out: track.duration.min(total_duration),
            timeline_start: 0.0,
        });

        Blueprint {
            clips,
            residual_gaps,
            audio_bed,
            total_duration,
            frame_rate: self.frame_rate,
            params_hash: self.config.params_hash(),
            schema_version: EDIT_PLAN_SCHEMA_VERSION.to_string(),
        }
    }
}

fn adjacent<'a>(layout: &Layout<'a>, index: usize) -> AdjacentSolid<'a> {
    let solid = &layout.solids[index];
    AdjacentSolid {
        asset: solid.source.asset,
        range: solid.source.range,
    }
}

/// Mutable state of one pouring pass.
struct Pour<'a> {
    config: &'a PlannerConfig,
    align: &'a AlignmentGrid,
    candidates: Vec<&'a ClipAnnotation>,
    /// Source ranges already placed, per asset.
    used: BTreeMap<AssetId, Vec<TimeRange>>,
    liquids: Vec<PlacedClip>,
    residuals: Vec<ResidualGap>,
}

impl<'a> Pour<'a> {
    fn fill(&mut self, gap: &Gap, ranked: &[usize]) -> Result<(), PlanningError> {
        let min_fill = self.config.min_fill;
        if gap.duration() < min_fill - TIME_EPSILON {
            let reason = if gap.is_tail() {
                ResidualReason::TailTrimmed
            } else {
                ResidualReason::BelowMinimumFill
            };
            self.residual(gap.start, gap.end, reason);
            return Ok(());
        }

        let start = self
            .align
            .snap_within(gap.start, gap.start, gap.end - min_fill)
            .unwrap_or(gap.start);
        let slot = gap.end - start;

        let placed = self
            .single(ranked, start, slot)
            .map(|clip| vec![clip])
            .or_else(|| self.split(ranked, start, gap.end))
            .or_else(|| self.reuse(ranked, start, slot).map(|clip| vec![clip]));

        match placed {
            Some(clips) => {
                if start > gap.start + TIME_EPSILON {
                    self.residual(gap.start, start, ResidualReason::AlignmentHold);
                }
                tracing::debug!(
                    gap = gap.index,
                    start,
                    end = gap.end,
                    liquids = clips.len(),
                    "Gap filled"
                );
                for clip in clips {
                    self.used
                        .entry(clip.source_asset_id.clone())
                        .or_default()
                        .push(TimeRange::new(clip.source_in, clip.source_out));
                    self.liquids.push(clip);
                }
                Ok(())
            }
            None if gap.is_tail() => {
                self.residual(gap.start, gap.end, ResidualReason::TailTrimmed);
                Ok(())
            }
            None if !self.config.allow_residual_gaps => Err(PlanningError::UnfillableGap {
                index: gap.index,
                start: gap.start,
                end: gap.end,
            }),
            None => {
                tracing::debug!(gap = gap.index, start = gap.start, end = gap.end, "Candidates exhausted");
                self.residual(gap.start, gap.end, ResidualReason::CandidatesExhausted);
                Ok(())
            }
        }
    }

    fn residual(&mut self, start: f64, end: f64, reason: ResidualReason) {
        self.residuals.push(ResidualGap { start, end, reason });
    }

    fn is_used(&self, candidate: &ClipAnnotation) -> bool {
        self.used.contains_key(&candidate.asset_id)
    }

    fn unused(&self, ranked: &[usize]) -> Vec<&'a ClipAnnotation> {
        ranked
            .iter()
            .map(|&i| self.candidates[i])
            .filter(|c| !self.is_used(c))
            .collect()
    }

    /// Best-ranked unused candidate that fills the slot alone.
    fn single(&self, ranked: &[usize], start: f64, slot: f64) -> Option<PlacedClip> {
        self.unused(ranked)
            .into_iter()
            .find_map(|candidate| self.place(candidate, start, slot))
    }

    fn place(&self, candidate: &ClipAnnotation, start: f64, slot: f64) -> Option<PlacedClip> {
        let region = elastic::select_region(
            candidate,
            self.config.stability_threshold,
            self.config.min_speed * slot,
        );
        let fit = elastic::fit(region, slot, self.config)?;
        Some(liquid(candidate, fit, start, slot))
    }

    /// Two unused candidates sharing the span `[start, end)`.
    ///
    /// The first covers as much as its footage allows at `min_speed`, the cut
    /// between them is pulled back onto an alignment point when one is near.
    fn split(&self, ranked: &[usize], start: f64, end: f64) -> Option<Vec<PlacedClip>> {
        let unused = self.unused(ranked);
        if unused.len() < 2 {
            return None;
        }
        let min_fill = self.config.min_fill;
        let span = end - start;

        for first in &unused {
            let region = elastic::select_region(
                first,
                self.config.stability_threshold,
                self.config.min_speed * min_fill,
            );
            let cover = elastic::max_cover(region, self.config).min(span - min_fill);
            if cover < min_fill - TIME_EPSILON {
                continue;
            }
            let nominal = start + cover;
            let cut = self
                .align
                .snap_within(nominal, start + min_fill, nominal)
                .unwrap_or(nominal);

            let Some(fit_first) = elastic::fit(region, cut - start, self.config) else {
                continue;
            };
            let second = unused
                .iter()
                .filter(|c| c.asset_id != first.asset_id)
                .find_map(|c| self.place(c, cut, end - cut));
            if let Some(second) = second {
                return Some(vec![liquid(first, fit_first, start, cut - start), second]);
            }
        }
        None
    }

    /// A consumed candidate cut from footage it has not used yet.
    fn reuse(&self, ranked: &[usize], start: f64, slot: f64) -> Option<PlacedClip> {
        if !self.config.allow_reuse {
            return None;
        }
        ranked
            .iter()
            .map(|&i| self.candidates[i])
            .filter_map(|c| self.used.get(&c.asset_id).map(|taken| (c, taken)))
            .find_map(|(candidate, taken)| {
                let free = elastic::largest_free_range(candidate.duration, taken)?;
                let fit = elastic::fit(free, slot, self.config)?;
                Some(liquid(candidate, fit, start, slot))
            })
    }
}

fn liquid(candidate: &ClipAnnotation, fit: ElasticFit, start: f64, slot: f64) -> PlacedClip {
    PlacedClip::liquid(candidate.asset_id.clone(), fit.source_in, fit.source_out, start, slot)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{ManifestOrderRanker, PrecomputedRanking};
    use crate::types::{BeatGrid, ClipRole, RhythmAlignment, StabilityWindow};

    fn talk(id: &str, start: f64, end: f64) -> ClipAnnotation {
        ClipAnnotation::new(id, AssetKind::Dialogue, 10.0)
            .with_valid_ranges(vec![TimeRange::new(start, end)])
    }

    fn broll(id: &str, duration: f64) -> ClipAnnotation {
        ClipAnnotation::new(id, AssetKind::Broll, duration)
            .with_stability_windows(vec![StabilityWindow::new(0.0, duration, 0.8)])
    }

    fn music() -> ClipAnnotation {
        ClipAnnotation::new("music", AssetKind::Audio, 120.0)
            .with_beat_grid(BeatGrid::uniform(0.5, 120.0))
    }

    fn interleaved(ratio: f64) -> StyleProfile {
        StyleProfile::new(2.0, RhythmAlignment::Beat, ratio)
    }

    fn solver() -> TimelineSolver {
        TimelineSolver::new(PlannerConfig::default()).with_ranker(Arc::new(ManifestOrderRanker))
    }

    #[test]
    fn test_no_dialogue_fails() {
        let manifest = AssetManifest::new(vec![broll("b1", 5.0)]);
        assert_eq!(solver().solve(&manifest, None), Err(PlanningError::NoValidSolids));
    }

    #[test]
    fn test_without_profile_solids_are_back_to_back() {
        let manifest = AssetManifest::new(vec![talk("a", 0.0, 3.0), talk("b", 2.0, 4.0), broll("x", 5.0)]);
        let bp = solver().solve(&manifest, None).unwrap();
        assert_eq!(bp.liquid_count(), 0);
        assert_eq!(bp.clips[1].timeline_start, 3.0);
        assert_eq!(bp.total_duration, 5.0);
    }

    #[test]
    fn test_liquid_fills_interleave_gap() {
        let manifest = AssetManifest::new(vec![
            talk("a", 0.0, 3.0),
            talk("b", 0.0, 3.0),
            broll("b1", 6.0),
            music(),
        ]);
        let bp = solver().solve(&manifest, Some(&interleaved(0.25))).unwrap();

        let roles: Vec<ClipRole> = bp.clips.iter().map(|c| c.role).collect();
        assert_eq!(roles, vec![ClipRole::Solid, ClipRole::Liquid, ClipRole::Solid]);
        let liquid = &bp.clips[1];
        assert_eq!(liquid.timeline_start, 3.0);
        assert!((liquid.timeline_duration - 2.0).abs() < 1e-9);
        assert_eq!(liquid.speed_factor, 1.0);
        assert_eq!(bp.audio_bed.as_ref().map(|a| a.source_out), Some(8.0));
    }

    #[test]
    fn test_short_footage_is_slowed_down() {
        let manifest = AssetManifest::new(vec![
            talk("a", 0.0, 3.0),
            talk("b", 0.0, 3.0),
            broll("short", 1.5),
        ]);
        let bp = solver().solve(&manifest, Some(&interleaved(0.25))).unwrap();
        let liquid = &bp.clips[1];
        assert!((liquid.speed_factor - 0.75).abs() < 1e-9);
        assert!((liquid.source_duration() / liquid.speed_factor - liquid.timeline_duration).abs() < 1e-6);
    }

    #[test]
    fn test_split_across_two_candidates() {
        let manifest = AssetManifest::new(vec![
            talk("a", 0.0, 3.0),
            talk("b", 0.0, 3.0),
            broll("b1", 0.6),
            broll("b2", 0.6),
        ]);
        // 2s gap, each candidate covers at most 1.2s at half speed.
        let bp = solver().solve(&manifest, Some(&interleaved(0.25))).unwrap();
        assert_eq!(bp.liquid_count(), 2);
        assert!(bp.residual_gaps.is_empty());
        let liquids: Vec<&PlacedClip> = bp.clips_with_role(ClipRole::Liquid).collect();
        assert!((liquids[0].timeline_end() - liquids[1].timeline_start).abs() < 1e-9);
        assert!((liquids[1].timeline_end() - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_exhausted_candidates_leave_residual() {
        let manifest = AssetManifest::new(vec![
            talk("a", 0.0, 3.0),
            talk("b", 0.0, 3.0),
            broll("tiny", 0.2),
        ]);
        let bp = solver().solve(&manifest, Some(&interleaved(0.25))).unwrap();
        assert_eq!(bp.liquid_count(), 0);
        assert_eq!(bp.residual_gaps.len(), 1);
        assert_eq!(bp.residual_gaps[0].reason, ResidualReason::CandidatesExhausted);
        assert!(bp.validate(0.5, 2.0, Some(&manifest)).is_ok());
    }

    #[test]
    fn test_strict_mode_fails_on_unfillable_gap() {
        let manifest = AssetManifest::new(vec![
            talk("a", 0.0, 3.0),
            talk("b", 0.0, 3.0),
            broll("tiny", 0.2),
        ]);
        let strict = TimelineSolver::new(PlannerConfig::strict());
        assert!(matches!(
            strict.solve(&manifest, Some(&interleaved(0.25))),
            Err(PlanningError::UnfillableGap { index: 0, .. })
        ));
    }

    #[test]
    fn test_reuse_takes_unused_footage() {
        let manifest = AssetManifest::new(vec![
            talk("a", 0.0, 3.0),
            talk("b", 0.0, 3.0),
            talk("c", 0.0, 3.0),
            broll("only", 10.0),
        ]);
        let bp = solver().solve(&manifest, Some(&interleaved(0.25))).unwrap();
        let liquids: Vec<&PlacedClip> = bp.clips_with_role(ClipRole::Liquid).collect();
        assert_eq!(liquids.len(), 2);
        let first = TimeRange::new(liquids[0].source_in, liquids[0].source_out);
        let second = TimeRange::new(liquids[1].source_in, liquids[1].source_out);
        assert!(!first.overlaps(&second));
    }

    #[test]
    fn test_reuse_disabled_leaves_residual() {
        let manifest = AssetManifest::new(vec![
            talk("a", 0.0, 3.0),
            talk("b", 0.0, 3.0),
            talk("c", 0.0, 3.0),
            broll("only", 10.0),
        ]);
        let mut config = PlannerConfig::default();
        config.allow_reuse = false;
        let bp = TimelineSolver::new(config)
            .solve(&manifest, Some(&interleaved(0.25)))
            .unwrap();
        assert_eq!(bp.liquid_count(), 1);
        assert_eq!(bp.residual_gaps[0].reason, ResidualReason::CandidatesExhausted);
    }

    #[test]
    fn test_precomputed_ranking_is_honoured() {
        let manifest = AssetManifest::new(vec![
            talk("a", 0.0, 3.0),
            talk("b", 0.0, 3.0),
            broll("first", 6.0),
            broll("second", 6.0),
        ]);
        let ranking = PrecomputedRanking::new().with_gap(0, vec![AssetId::from("second")]);
        let bp = TimelineSolver::new(PlannerConfig::default())
            .with_ranker(Arc::new(ranking))
            .solve(&manifest, Some(&interleaved(0.25)))
            .unwrap();
        assert_eq!(bp.clips[1].source_asset_id.as_str(), "second");
    }

    #[test]
    fn test_tail_gap_trimmed_when_unfilled() {
        let manifest = AssetManifest::new(vec![talk("a", 0.0, 3.0), talk("b", 0.0, 3.0), broll("b1", 1.0)]);
        let mut config = PlannerConfig::default();
        config.edge_gaps = true;
        let bp = TimelineSolver::new(config)
            .solve(&manifest, Some(&interleaved(0.25)))
            .unwrap();
        let last = bp.residual_gaps.last().unwrap();
        assert_eq!(last.reason, ResidualReason::TailTrimmed);
        assert!((bp.total_duration - last.start).abs() < 1e-9);
    }

    #[test]
    fn test_invalid_manifest_is_input_error() {
        let manifest = AssetManifest::new(vec![talk("a", 0.0, 30.0)]);
        assert!(matches!(solver().solve(&manifest, None), Err(PlanningError::Input(_))));
    }

    #[test]
    fn test_solve_is_deterministic() {
        let manifest = AssetManifest::new(vec![
            talk("a", 0.0, 3.0),
            talk("b", 1.0, 3.5),
            broll("b1", 4.0),
            broll("b2", 1.0),
            music(),
        ]);
        let style = interleaved(0.3);
        let first = solver().solve(&manifest, Some(&style)).unwrap();
        let second = solver().solve(&manifest, Some(&style)).unwrap();
        assert_eq!(
            crate::canonical::to_canonical_bytes(&first),
            crate::canonical::to_canonical_bytes(&second)
        );
    }
}
