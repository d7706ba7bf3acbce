//! Relevance ranking of liquid candidates per gap.
//!
//! The solver is agnostic to how relevance is scored: it asks a
//! [`CandidateRanker`] for an ordering and takes the first feasible candidate.
//! Ties must resolve to manifest order so planning stays deterministic.

use std::collections::{BTreeMap, BTreeSet};

use regex_lite::Regex;

use crate::solver::Gap;
use crate::types::{AssetId, ClipAnnotation, TimeRange};

/// A solid adjacent to a gap.
#[derive(Debug, Clone, Copy)]
pub struct AdjacentSolid<'a> {
    /// The dialogue asset.
    pub asset: &'a ClipAnnotation,
    /// The source range the solid plays.
    pub range: TimeRange,
}

/// What a ranker sees about a gap.
#[derive(Debug, Clone, Copy)]
pub struct GapContext<'a> {
    /// The gap being filled.
    pub gap: &'a Gap,
    /// Solid ending where the gap starts.
    pub before: Option<AdjacentSolid<'a>>,
    /// Solid starting where the gap ends.
    pub after: Option<AdjacentSolid<'a>>,
}

/// Orders liquid candidates for one gap.
///
/// Returns indices into `candidates`, best first. Indices may be omitted to
/// exclude a candidate from this gap; duplicates are ignored by the solver.
pub trait CandidateRanker: Send + Sync {
    /// Rank candidates for a gap.
    fn rank(&self, context: &GapContext<'_>, candidates: &[&ClipAnnotation]) -> Vec<usize>;
}

/// Keeps manifest order.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManifestOrderRanker;

impl CandidateRanker for ManifestOrderRanker {
    fn rank(&self, _context: &GapContext<'_>, candidates: &[&ClipAnnotation]) -> Vec<usize> {
        (0..candidates.len()).collect()
    }
}

/// Words too common to signal relevance.
const STOPWORDS: &[&str] = &[
    "the", "and", "for", "are", "but", "not", "you", "all", "can", "her", "was", "one", "our",
    "out", "his", "has", "had", "have", "this", "that", "with", "they", "from", "what", "there",
    "were", "been", "just", "like", "really", "going", "about", "know", "think", "then", "than",
    "mp4", "mov", "clip", "broll",
];

/// Scores candidates by keyword overlap with the adjacent solids' speech.
///
/// Candidate keywords come from its transcript and its asset id (b-roll
/// filenames are usually descriptive). Ties keep manifest order.
#[derive(Debug, Clone)]
pub struct KeywordOverlapRanker {
    word: Regex,
}

impl KeywordOverlapRanker {
    /// Create a ranker.
    pub fn new() -> Self {
        Self {
            // Pattern is a literal and known to compile.
            word: Regex::new(r"[a-z0-9]+").unwrap_or_else(|_| unreachable!()),
        }
    }

    /// Lowercased keywords of a text, minus stopwords and short tokens.
    pub fn keywords(&self, text: &str) -> BTreeSet<String> {
        let lowered = text.to_lowercase();
        self.word
            .find_iter(&lowered)
            .map(|m| m.as_str())
            .filter(|w| w.len() >= 3 && !STOPWORDS.contains(w))
            .map(str::to_string)
            .collect()
    }

    fn context_keywords(&self, context: &GapContext<'_>) -> BTreeSet<String> {
        let mut words = BTreeSet::new();
        for solid in [context.before, context.after].into_iter().flatten() {
            for text in solid.asset.transcript_within(&solid.range) {
                words.extend(self.keywords(text));
            }
        }
        words
    }

    fn candidate_keywords(&self, candidate: &ClipAnnotation) -> BTreeSet<String> {
        let mut words = self.keywords(candidate.asset_id.as_str());
        for segment in &candidate.transcript_segments {
            words.extend(self.keywords(&segment.text));
        }
        words
    }
}

impl Default for KeywordOverlapRanker {
    fn default() -> Self {
        Self::new()
    }
}

impl CandidateRanker for KeywordOverlapRanker {
    fn rank(&self, context: &GapContext<'_>, candidates: &[&ClipAnnotation]) -> Vec<usize> {
        let wanted = self.context_keywords(context);
        let mut scored: Vec<(usize, usize)> = candidates
            .iter()
            .enumerate()
            .map(|(i, c)| (i, self.candidate_keywords(c).intersection(&wanted).count()))
            .collect();
        // Stable sort keeps manifest order among equal scores.
        scored.sort_by(|a, b| b.1.cmp(&a.1));
        scored.into_iter().map(|(i, _)| i).collect()
    }
}

/// Externally supplied ranking, keyed by gap index.
///
/// Gaps without an entry fall back to manifest order. Asset ids not present
/// among the candidates are skipped.
#[derive(Debug, Clone, Default)]
pub struct PrecomputedRanking {
    per_gap: BTreeMap<usize, Vec<AssetId>>,
}

impl PrecomputedRanking {
    /// Create an empty ranking.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: set the ranked list for a gap.
    pub fn with_gap(mut self, gap_index: usize, ranked: Vec<AssetId>) -> Self {
        self.per_gap.insert(gap_index, ranked);
        self
    }
}

impl CandidateRanker for PrecomputedRanking {
    fn rank(&self, context: &GapContext<'_>, candidates: &[&ClipAnnotation]) -> Vec<usize> {
        match self.per_gap.get(&context.gap.index) {
            Some(ranked) => ranked
                .iter()
                .filter_map(|id| candidates.iter().position(|c| &c.asset_id == id))
                .collect(),
            None => (0..candidates.len()).collect(),
        }
    }
}
