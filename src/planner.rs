//! Query decomposition: one operations-tier model call per task.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Deserialize;

use crate::error::ResearchError;
use crate::model::{extract_json, CompletionRequest, ModelBackend};
use crate::plan::{Plan, SourceKind, SubQuery};

/// Ceiling on sub-queries accepted from the model; the researcher enforces
/// the same cap per iteration.
pub const MAX_PLAN_SUB_QUERIES: usize = 12;

pub struct Planner {
    model: Arc<ModelBackend>,
    model_name: String,
}

/// Wire shape of one planned sub-query in the model response.
#[derive(Deserialize)]
struct RawSubQuery {
    #[serde(default)]
    id: String,
    #[serde(default)]
    query: String,
    #[serde(default)]
    sources: Vec<String>,
}

impl Planner {
    pub fn new(model: Arc<ModelBackend>, model_name: impl Into<String>) -> Self {
        Self {
            model,
            model_name: model_name.into(),
        }
    }

    /// Decompose a query into a plan. Parse failures yield the generic
    /// fallback plan; model failures propagate — planning is the one phase
    /// whose errors fail the task.
    pub async fn plan(&self, query: &str) -> Result<Plan, ResearchError> {
        let req = CompletionRequest::new(&self.model_name, build_prompt(query))
            .with_max_tokens(1500)
            .with_temperature(0.3);

        let response = self.model.complete(&req).await?;

        let sub_queries = match parse_response(&response.content) {
            Some(parsed) if !parsed.is_empty() => parsed,
            _ => {
                tracing::warn!(
                    model = self.model_name,
                    "plan response unparseable, using fallback plan"
                );
                fallback_sub_queries(query)
            }
        };

        let mut plan = Plan {
            main_query: query.to_string(),
            sub_queries,
        };
        dedupe_ids(&mut plan.sub_queries);
        plan.sub_queries.truncate(MAX_PLAN_SUB_QUERIES);

        tracing::info!(
            sub_queries = plan.sub_queries.len(),
            "research plan created"
        );
        Ok(plan)
    }
}

impl std::fmt::Debug for Planner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Planner")
            .field("model", &self.model_name)
            .finish()
    }
}

fn build_prompt(query: &str) -> String {
    format!(
        r#"You are a research planner. Decompose the research query below into 3 to 6 focused sub-queries that together cover the topic.

Respond with ONLY a JSON array, one object per sub-query:
[{{"id": "short_snake_case_id", "query": "the search query text", "sources": ["web", "news", "academic"]}}]

Allowed sources: web, news, academic, document. Pick the sources that fit each sub-query.

Research query: "{query}"
"#
    )
}

/// Parse the strict JSON array shape; None on any structural failure.
fn parse_response(content: &str) -> Option<Vec<SubQuery>> {
    let payload = extract_json(content);
    let raw: Vec<RawSubQuery> = serde_json::from_str(payload).ok()?;

    let sub_queries: Vec<SubQuery> = raw
        .into_iter()
        .filter(|r| !r.query.trim().is_empty())
        .map(|r| {
            let mut sources: Vec<SourceKind> = r
                .sources
                .iter()
                .filter_map(|s| SourceKind::parse(s))
                .collect();
            sources.dedup();
            if sources.is_empty() {
                sources.push(SourceKind::Web);
            }
            SubQuery {
                id: if r.id.trim().is_empty() {
                    "sub_query".to_string()
                } else {
                    r.id.trim().to_string()
                },
                text: r.query.trim().to_string(),
                sources,
            }
        })
        .collect();

    Some(sub_queries)
}

/// Three generic sub-queries derived from the original query.
fn fallback_sub_queries(query: &str) -> Vec<SubQuery> {
    vec![
        SubQuery {
            id: "overview".to_string(),
            text: format!("{query} overview and current state"),
            sources: vec![SourceKind::Web],
        },
        SubQuery {
            id: "context".to_string(),
            text: format!("{query} competitors and market context"),
            sources: vec![SourceKind::Web, SourceKind::News],
        },
        SubQuery {
            id: "recent".to_string(),
            text: format!("{query} recent developments"),
            sources: vec![SourceKind::News],
        },
    ]
}

/// Rename colliding ids `id#2`, `id#3`, … keeping first occurrences intact.
fn dedupe_ids(sub_queries: &mut [SubQuery]) {
    let mut seen: HashSet<String> = HashSet::new();
    for sq in sub_queries.iter_mut() {
        if seen.insert(sq.id.clone()) {
            continue;
        }
        let mut n = 2;
        loop {
            let candidate = format!("{}#{n}", sq.id);
            if seen.insert(candidate.clone()) {
                sq.id = candidate;
                break;
            }
            n += 1;
        }
    }
}
