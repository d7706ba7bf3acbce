//! Planner policy: configuration and candidate ranking.

pub mod planner;
pub mod ranking;

pub use planner::PlannerConfig;
pub use ranking::{
    AdjacentSolid, CandidateRanker, GapContext, KeywordOverlapRanker, ManifestOrderRanker,
    PrecomputedRanking,
};
