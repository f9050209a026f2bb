//! Research completeness evaluation: scoring, gap analysis, refinement.
//!
//! All three operations run on the analytical tier at low temperature.
//! None of them is allowed to fail a run: parse and provider failures
//! degrade to a conservative score or an empty list.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::Deserialize;

use crate::evaluation::{CompletionScore, InformationGap, RefinementQuery};
use crate::evidence::{cap_chars, Evidence};
use crate::model::{extract_json, CompletionRequest, ModelBackend};
use crate::plan::SourceKind;

/// Most gaps kept from one analysis pass.
pub const MAX_GAPS: usize = 6;

/// Items shown in full in the evidence summary; the rest is a count tail.
const SUMMARY_ITEMS: usize = 10;

/// Excerpt preview length inside the summary.
const SUMMARY_EXCERPT_CHARS: usize = 150;

pub struct Evaluator {
    model: Arc<ModelBackend>,
    model_name: String,
}

#[derive(Deserialize)]
struct RawScore {
    overall_score: Option<f64>,
    #[serde(default)]
    coverage_areas: BTreeMap<String, f64>,
    confidence: Option<f64>,
    #[serde(default)]
    reasoning: String,
}

#[derive(Deserialize)]
struct RawGap {
    #[serde(default)]
    gap_type: String,
    #[serde(default)]
    description: String,
    priority: Option<i64>,
    #[serde(default)]
    suggested_query: String,
}

#[derive(Deserialize)]
struct RawRefinement {
    #[serde(default)]
    query: String,
    #[serde(default)]
    gap_addressed: String,
    priority: Option<i64>,
    #[serde(default)]
    expected_sources: Vec<String>,
}

impl Evaluator {
    pub fn new(model: Arc<ModelBackend>, model_name: impl Into<String>) -> Self {
        Self {
            model,
            model_name: model_name.into(),
        }
    }

    /// Score how completely the evidence answers the query.
    /// Empty evidence short-circuits; failures fall back conservatively.
    pub async fn score(&self, query: &str, evidence: &[Evidence]) -> CompletionScore {
        if evidence.is_empty() {
            return CompletionScore::no_evidence();
        }

        let prompt = build_score_prompt(query, evidence);
        let req = CompletionRequest::new(&self.model_name, prompt)
            .with_max_tokens(1000)
            .with_temperature(0.3);

        let content = match self.model.complete(&req).await {
            Ok(resp) => resp.content,
            Err(e) => {
                tracing::warn!("completeness evaluation failed: {}", e.user_message());
                return CompletionScore::parse_fallback();
            }
        };

        parse_score(&content).unwrap_or_else(|| {
            tracing::warn!(model = self.model_name, "score response unparseable");
            CompletionScore::parse_fallback()
        })
    }

    /// Identify up to [`MAX_GAPS`] coverage gaps, highest priority first.
    /// Failures yield an empty list.
    pub async fn gaps(&self, query: &str, evidence: &[Evidence]) -> Vec<InformationGap> {
        let prompt = build_gaps_prompt(query, evidence);
        let req = CompletionRequest::new(&self.model_name, prompt)
            .with_max_tokens(1200)
            .with_temperature(0.3);

        let content = match self.model.complete(&req).await {
            Ok(resp) => resp.content,
            Err(e) => {
                tracing::warn!("gap analysis failed: {}", e.user_message());
                return Vec::new();
            }
        };

        let mut gaps = parse_gaps(&content).unwrap_or_default();
        gaps.sort_by(|a, b| b.priority.cmp(&a.priority));
        gaps.truncate(MAX_GAPS);
        gaps
    }

    /// Generate at most one refinement query per gap. Failures yield an
    /// empty list — the orchestrator treats that as "no productive work".
    pub async fn refine(
        &self,
        gaps: &[InformationGap],
        original_query: &str,
    ) -> Vec<RefinementQuery> {
        if gaps.is_empty() {
            return Vec::new();
        }

        let prompt = build_refine_prompt(gaps, original_query);
        let req = CompletionRequest::new(&self.model_name, prompt)
            .with_max_tokens(1200)
            .with_temperature(0.3);

        let content = match self.model.complete(&req).await {
            Ok(resp) => resp.content,
            Err(e) => {
                tracing::warn!("refinement generation failed: {}", e.user_message());
                return Vec::new();
            }
        };

        let mut refinements = parse_refinements(&content).unwrap_or_default();
        refinements.truncate(gaps.len());
        refinements
    }
}

impl std::fmt::Debug for Evaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Evaluator")
            .field("model", &self.model_name)
            .finish()
    }
}

/// Compact evidence digest: first [`SUMMARY_ITEMS`] items plus a count tail.
pub fn summarize_evidence(evidence: &[Evidence]) -> String {
    if evidence.is_empty() {
        return "No evidence collected yet.".to_string();
    }

    let mut lines: Vec<String> = evidence
        .iter()
        .take(SUMMARY_ITEMS)
        .map(|ev| {
            let origin = ev
                .tags
                .first()
                .map(|t| t.as_str())
                .unwrap_or("unknown");
            format!(
                "- {} ({origin}): {}",
                ev.source.title,
                cap_chars(&ev.excerpt, SUMMARY_EXCERPT_CHARS)
            )
        })
        .collect();

    if evidence.len() > SUMMARY_ITEMS {
        lines.push(format!(
            "... and {} more evidence items",
            evidence.len() - SUMMARY_ITEMS
        ));
    }

    lines.join("\n")
}

fn build_score_prompt(query: &str, evidence: &[Evidence]) -> String {
    format!(
        r#"Rate how completely the collected evidence answers the research query.

Respond with ONLY a JSON object:
{{"overall_score": 0.0, "completion_level": "insufficient|partial|adequate|comprehensive", "coverage_areas": {{"area_name": 0.0}}, "confidence": 0.0, "reasoning": "one or two sentences"}}

All numeric values are in [0, 1].

Research query: "{query}"

Evidence collected:
{}
"#,
        summarize_evidence(evidence)
    )
}

fn build_gaps_prompt(query: &str, evidence: &[Evidence]) -> String {
    format!(
        r#"Identify the most important information gaps in the collected evidence relative to the research query — missing areas such as competitor data, regulations, financials, or recent developments.

Respond with ONLY a JSON array, at most {MAX_GAPS} entries:
[{{"gap_type": "short_snake_case_name", "description": "what is missing", "priority": 1, "suggested_query": "a search query to close the gap"}}]

Priority is an integer from 1 (low) to 5 (high).

Research query: "{query}"

Evidence collected:
{}
"#,
        summarize_evidence(evidence)
    )
}

fn build_refine_prompt(gaps: &[InformationGap], original_query: &str) -> String {
    let gap_lines: Vec<String> = gaps
        .iter()
        .map(|g| {
            format!(
                "- {} (priority {}): {} — suggested: {}",
                g.gap_type, g.priority, g.description, g.suggested_query
            )
        })
        .collect();

    format!(
        r#"Generate refinement queries to close the gaps below, at most one per gap.

Respond with ONLY a JSON array:
[{{"query": "the refined search query", "gap_addressed": "gap_type it closes", "priority": 1, "expected_sources": ["web", "news", "academic"]}}]

Priority is an integer from 1 (low) to 5 (high). Allowed sources: web, news, academic.

Original research query: "{original_query}"

Gaps:
{}
"#,
        gap_lines.join("\n")
    )
}

fn parse_score(content: &str) -> Option<CompletionScore> {
    let raw: RawScore = serde_json::from_str(extract_json(content)).ok()?;
    let overall = raw.overall_score?;
    Some(CompletionScore::from_overall(
        overall,
        raw.coverage_areas
            .into_iter()
            .map(|(k, v)| (k, v.clamp(0.0, 1.0)))
            .collect(),
        raw.confidence.unwrap_or(0.5),
        if raw.reasoning.is_empty() {
            "no reasoning provided".to_string()
        } else {
            raw.reasoning
        },
    ))
}

fn parse_gaps(content: &str) -> Option<Vec<InformationGap>> {
    let raw: Vec<RawGap> = serde_json::from_str(extract_json(content)).ok()?;
    Some(
        raw.into_iter()
            .filter(|g| !g.gap_type.is_empty() || !g.description.is_empty())
            .map(|g| InformationGap {
                gap_type: g.gap_type,
                description: g.description,
                priority: clamp_priority(g.priority),
                suggested_query: g.suggested_query,
            })
            .collect(),
    )
}

fn parse_refinements(content: &str) -> Option<Vec<RefinementQuery>> {
    let raw: Vec<RawRefinement> = serde_json::from_str(extract_json(content)).ok()?;
    Some(
        raw.into_iter()
            .filter(|r| !r.query.trim().is_empty())
            .map(|r| {
                let mut sources: Vec<SourceKind> = r
                    .expected_sources
                    .iter()
                    .filter_map(|s| SourceKind::parse(s))
                    .filter(|s| s.searchable())
                    .collect();
                sources.dedup();
                if sources.is_empty() {
                    sources.push(SourceKind::Web);
                }
                RefinementQuery {
                    text: r.query.trim().to_string(),
                    gap_addressed: r.gap_addressed,
                    priority: clamp_priority(r.priority),
                    expected_sources: sources,
                }
            })
            .collect(),
    )
}

fn clamp_priority(p: Option<i64>) -> u8 {
    p.unwrap_or(3).clamp(1, 5) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluation::CompletionLevel;
    use crate::evidence::EvidenceSource;
    use crate::model::mock::{MockModel, PromptKind};
    use chrono::Utc;

    fn ev(n: usize) -> Evidence {
        Evidence {
            id: format!("ev_{n}"),
            source: EvidenceSource {
                url: format!("https://example.com/{n}"),
                title: format!("Source {n}"),
                fetched_at: Utc::now(),
            },
            excerpt: format!("excerpt {n}"),
            content_hash: None,
            score: Some(0.8),
            tags: vec!["web".to_string(), "sq_1".to_string()],
            cit_key: None,
            produced_by: "sq_1".to_string(),
        }
    }

    fn evaluator_with(mock: MockModel) -> Evaluator {
        Evaluator::new(Arc::new(ModelBackend::Mock(mock)), "mock-analyst")
    }

    #[tokio::test]
    async fn score_parses_and_rederives_level() {
        let mock = MockModel::new();
        // Model claims "comprehensive" but the numeric score says adequate.
        mock.script(
            PromptKind::Score,
            r#"{"overall_score": 0.75, "completion_level": "comprehensive",
                "coverage_areas": {"market": 0.8}, "confidence": 0.85,
                "reasoning": "Good coverage"}"#,
        );
        let score = evaluator_with(mock).score("q", &[ev(1)]).await;

        assert!((score.overall - 0.75).abs() < f64::EPSILON);
        assert_eq!(score.level, CompletionLevel::Adequate);
        assert_eq!(score.coverage.get("market"), Some(&0.8));
    }

    #[tokio::test]
    async fn score_parse_failure_falls_back() {
        let mock = MockModel::new();
        mock.script(PromptKind::Score, "This is not valid JSON {[");
        let score = evaluator_with(mock).score("q", &[ev(1)]).await;

        assert!((score.overall - 0.5).abs() < f64::EPSILON);
        assert_eq!(score.level, CompletionLevel::Partial);
        assert_eq!(score.reasoning, "parse_fallback");
    }

    #[tokio::test]
    async fn score_provider_failure_falls_back() {
        let mock = MockModel::new();
        mock.script_failure(PromptKind::Score, "500");
        let score = evaluator_with(mock).score("q", &[ev(1)]).await;
        assert_eq!(score.reasoning, "parse_fallback");
    }

    #[tokio::test]
    async fn empty_evidence_scores_insufficient_without_model_call() {
        let mock = MockModel::new();
        let evaluator = evaluator_with(mock);
        let score = evaluator.score("q", &[]).await;

        assert!(score.overall <= 0.4);
        assert_eq!(score.level, CompletionLevel::Insufficient);
        assert!(!score.reasoning.is_empty());
        if let ModelBackend::Mock(mock) = evaluator.model.as_ref() {
            assert_eq!(mock.calls(PromptKind::Score), 0);
        }
    }

    #[tokio::test]
    async fn gaps_sorted_by_priority_and_capped() {
        let mock = MockModel::new();
        let many: Vec<String> = (1..=8)
            .map(|i| {
                format!(
                    r#"{{"gap_type": "gap_{i}", "description": "d", "priority": {}, "suggested_query": "s"}}"#,
                    (i % 5) + 1
                )
            })
            .collect();
        mock.script(PromptKind::Gaps, &format!("[{}]", many.join(",")));
        let gaps = evaluator_with(mock).gaps("q", &[ev(1)]).await;

        assert_eq!(gaps.len(), MAX_GAPS);
        for pair in gaps.windows(2) {
            assert!(pair[0].priority >= pair[1].priority);
        }
    }

    #[tokio::test]
    async fn gaps_parse_failure_is_empty() {
        let mock = MockModel::new();
        mock.script(PromptKind::Gaps, "Not valid JSON");
        assert!(evaluator_with(mock).gaps("q", &[ev(1)]).await.is_empty());
    }

    #[tokio::test]
    async fn refine_filters_sources_and_caps_per_gap() {
        let mock = MockModel::new();
        mock.script(
            PromptKind::Refine,
            r#"[{"query": "banking regulations CNBV", "gap_addressed": "missing_regulations",
                 "priority": 5, "expected_sources": ["web", "government", "news"]},
                {"query": "second", "gap_addressed": "a", "priority": 2, "expected_sources": []},
                {"query": "third surplus", "gap_addressed": "b", "priority": 1, "expected_sources": ["web"]}]"#,
        );
        let gaps = vec![
            InformationGap {
                gap_type: "missing_regulations".into(),
                description: "d".into(),
                priority: 5,
                suggested_query: "s".into(),
            },
            InformationGap {
                gap_type: "a".into(),
                description: "d".into(),
                priority: 2,
                suggested_query: "s".into(),
            },
        ];
        let refinements = evaluator_with(mock).refine(&gaps, "q").await;

        // At most one refinement per gap.
        assert_eq!(refinements.len(), 2);
        // Unknown source "government" dropped.
        assert_eq!(
            refinements[0].expected_sources,
            vec![SourceKind::Web, SourceKind::News]
        );
        // Empty sources default to web.
        assert_eq!(refinements[1].expected_sources, vec![SourceKind::Web]);
    }

    #[tokio::test]
    async fn refine_with_no_gaps_skips_model() {
        let evaluator = evaluator_with(MockModel::new());
        assert!(evaluator.refine(&[], "q").await.is_empty());
        if let ModelBackend::Mock(mock) = evaluator.model.as_ref() {
            assert_eq!(mock.calls(PromptKind::Refine), 0);
        }
    }

    #[test]
    fn summary_caps_at_ten_with_tail() {
        let evidence: Vec<Evidence> = (0..15).map(ev).collect();
        let summary = summarize_evidence(&evidence);
        assert!(summary.contains("Source 9"));
        assert!(!summary.contains("Source 14"));
        assert!(summary.contains("and 5 more evidence items"));
    }

    #[test]
    fn summary_empty_case() {
        assert_eq!(summarize_evidence(&[]), "No evidence collected yet.");
    }
}
