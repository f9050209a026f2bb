//! Research plans: the decomposed search intents a run executes.

use serde::{Deserialize, Serialize};

use crate::evaluation::RefinementQuery;

/// Origin class of a sub-query or evidence item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    Web,
    News,
    Academic,
    Document,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Web => "web",
            Self::News => "news",
            Self::Academic => "academic",
            Self::Document => "document",
        }
    }

    /// Lenient parse — unknown source strings from provider JSON are
    /// dropped by callers, not treated as errors.
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "web" => Some(Self::Web),
            "news" => Some(Self::News),
            "academic" => Some(Self::Academic),
            "document" => Some(Self::Document),
            _ => None,
        }
    }

    /// True for kinds the searcher can serve directly.
    pub fn searchable(self) -> bool {
        !matches!(self, Self::Document)
    }
}

/// One decomposed search intent. IDs are unique within a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubQuery {
    pub id: String,
    pub text: String,
    pub sources: Vec<SourceKind>,
}

impl SubQuery {
    /// True when at least one source kind can be searched.
    pub fn is_searchable(&self) -> bool {
        self.sources.iter().any(|s| s.searchable())
    }
}

/// The full decomposition of a research query. Created once per task;
/// refinement rounds are wrapped into fresh plans via [`Plan::from_refinements`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub main_query: String,
    pub sub_queries: Vec<SubQuery>,
}

impl Plan {
    /// Wrap refinement queries from iteration `generated_in` into a plan.
    /// IDs are `refinement_<iter>_<n>`, fresh within the run.
    pub fn from_refinements(
        main_query: &str,
        generated_in: u32,
        refinements: &[RefinementQuery],
    ) -> Self {
        let sub_queries = refinements
            .iter()
            .enumerate()
            .map(|(i, rq)| SubQuery {
                id: format!("refinement_{generated_in}_{}", i + 1),
                text: rq.text.clone(),
                sources: if rq.expected_sources.is_empty() {
                    vec![SourceKind::Web]
                } else {
                    rq.expected_sources.clone()
                },
            })
            .collect();

        Self {
            main_query: main_query.to_string(),
            sub_queries,
        }
    }
}
