//! Evaluator output types: completion scoring, gaps, and refinements.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::plan::SourceKind;

/// Qualitative band of a completion score. Always derived from the
/// numeric score — the model's self-reported level is not trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionLevel {
    Insufficient,
    Partial,
    Adequate,
    Comprehensive,
}

impl CompletionLevel {
    pub fn from_score(overall: f64) -> Self {
        if overall < 0.4 {
            Self::Insufficient
        } else if overall < 0.7 {
            Self::Partial
        } else if overall < 0.9 {
            Self::Adequate
        } else {
            Self::Comprehensive
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Insufficient => "insufficient",
            Self::Partial => "partial",
            Self::Adequate => "adequate",
            Self::Comprehensive => "comprehensive",
        }
    }
}

/// The evaluator's estimate of how well accumulated evidence answers the query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionScore {
    /// Overall completeness in [0,1].
    pub overall: f64,
    pub level: CompletionLevel,
    /// Per-area coverage in [0,1]. BTreeMap keeps serialisation deterministic.
    pub coverage: BTreeMap<String, f64>,
    pub confidence: f64,
    pub reasoning: String,
}

impl CompletionScore {
    /// Build a score from a raw overall value, deriving the level.
    pub fn from_overall(
        overall: f64,
        coverage: BTreeMap<String, f64>,
        confidence: f64,
        reasoning: String,
    ) -> Self {
        let overall = overall.clamp(0.0, 1.0);
        Self {
            overall,
            level: CompletionLevel::from_score(overall),
            coverage,
            confidence: confidence.clamp(0.0, 1.0),
            reasoning,
        }
    }

    /// Conservative fallback used when the evaluator response cannot be
    /// parsed or the model call fails. Never fatal.
    pub fn parse_fallback() -> Self {
        Self::from_overall(0.5, BTreeMap::new(), 0.5, "parse_fallback".to_string())
    }

    /// Score for a run with no evidence at all. No model call needed.
    pub fn no_evidence() -> Self {
        Self::from_overall(
            0.2,
            BTreeMap::new(),
            0.9,
            "No evidence collected yet.".to_string(),
        )
    }
}

/// A named deficiency in coverage, with a follow-up suggestion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InformationGap {
    pub gap_type: String,
    pub description: String,
    /// 1 (low) .. 5 (high).
    pub priority: u8,
    pub suggested_query: String,
}

/// A follow-up sub-query generated to close a gap; executed next iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefinementQuery {
    pub text: String,
    pub gap_addressed: String,
    /// 1 (low) .. 5 (high).
    pub priority: u8,
    pub expected_sources: Vec<SourceKind>,
}
