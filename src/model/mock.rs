//! Mock model backend.
//!
//! Serves two purposes: the offline fallback when no API key is configured
//! (canned, schema-valid responses so the whole pipeline still runs), and a
//! scripted deterministic backend for tests. Scripted responses are queued
//! per prompt kind and consumed in order; when a queue is empty the canned
//! response for that kind is returned.

use std::collections::HashMap;
use std::sync::Mutex;

use super::{CompletionRequest, CompletionResponse};
use crate::error::ResearchError;

/// Which agent a prompt came from, inferred from stable prompt markers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PromptKind {
    Plan,
    Score,
    Gaps,
    Refine,
    Report,
}

/// Classify a request by the markers each agent embeds in its prompt.
/// Order matters: the refinement prompt also mentions gaps.
pub fn classify(req: &CompletionRequest) -> PromptKind {
    let content = req.last_user_content();
    if content.contains("refinement queries") {
        PromptKind::Refine
    } else if content.contains("information gaps") {
        PromptKind::Gaps
    } else if content.contains("overall_score") {
        PromptKind::Score
    } else if content.contains("sub-queries") {
        PromptKind::Plan
    } else {
        PromptKind::Report
    }
}

#[derive(Default)]
struct MockState {
    /// Scripted responses per kind; Err(msg) simulates an upstream failure.
    scripts: HashMap<PromptKind, Vec<Result<String, String>>>,
    /// Completed calls per kind.
    calls: HashMap<PromptKind, u32>,
}

#[derive(Default)]
pub struct MockModel {
    state: Mutex<MockState>,
}

impl MockModel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a scripted response for the given prompt kind.
    pub fn script(&self, kind: PromptKind, content: &str) {
        if let Ok(mut state) = self.state.lock() {
            state
                .scripts
                .entry(kind)
                .or_default()
                .push(Ok(content.to_string()));
        }
    }

    /// Queue a scripted provider failure for the given prompt kind.
    pub fn script_failure(&self, kind: PromptKind, message: &str) {
        if let Ok(mut state) = self.state.lock() {
            state
                .scripts
                .entry(kind)
                .or_default()
                .push(Err(message.to_string()));
        }
    }

    /// How many calls of the given kind this mock has served.
    pub fn calls(&self, kind: PromptKind) -> u32 {
        self.state
            .lock()
            .map(|state| state.calls.get(&kind).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    pub async fn complete(
        &self,
        req: &CompletionRequest,
    ) -> Result<CompletionResponse, ResearchError> {
        let kind = classify(req);

        let scripted = {
            let mut state = self.state.lock().map_err(|_| {
                ResearchError::InvariantViolation("mock model state poisoned".to_string())
            })?;
            *state.calls.entry(kind).or_insert(0) += 1;
            let queue = state.scripts.entry(kind).or_default();
            if queue.is_empty() {
                None
            } else {
                Some(queue.remove(0))
            }
        };

        let content = match scripted {
            Some(Ok(content)) => content,
            Some(Err(message)) => {
                return Err(ResearchError::Upstream {
                    provider: "mock".to_string(),
                    message,
                    status: Some(500),
                });
            }
            None => canned(kind, req),
        };

        Ok(CompletionResponse {
            raw: serde_json::json!({ "model": req.model, "mock": true }),
            content,
            model: req.model.clone(),
        })
    }
}

impl std::fmt::Debug for MockModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockModel").finish()
    }
}

/// Schema-valid canned response per prompt kind. Deterministic — identical
/// inputs always produce identical pipeline output. The research query is
/// lifted out of the prompt so canned plans and reports track the actual
/// topic instead of a fixed placeholder.
fn canned(kind: PromptKind, req: &CompletionRequest) -> String {
    let prompt = req.last_user_content();
    match kind {
        PromptKind::Plan => {
            let topic = quoted_after(prompt, "Research query: \"").unwrap_or("the research topic");
            serde_json::json!([
                {"id": "overview", "query": format!("{topic} overview and current state"), "sources": ["web"]},
                {"id": "competitors", "query": format!("{topic} main competitors and market context"), "sources": ["web", "news"]},
                {"id": "recent", "query": format!("{topic} recent developments"), "sources": ["news"]}
            ])
            .to_string()
        }
        PromptKind::Score => r#"{
  "overall_score": 0.75,
  "completion_level": "adequate",
  "coverage_areas": {"overview": 0.8, "context": 0.7},
  "confidence": 0.8,
  "reasoning": "Canned evaluation: adequate coverage across the main areas."
}"#
        .to_string(),
        PromptKind::Gaps => r#"[
  {"gap_type": "missing_recent_data", "description": "No data newer than the initial pass", "priority": 3, "suggested_query": "latest developments"}
]"#
        .to_string(),
        PromptKind::Refine => "[]".to_string(),
        PromptKind::Report => {
            let topic = quoted_after(prompt, "User Query: \"").unwrap_or("Research Report");
            format!(
                "# {topic}\n\n\
## Executive Summary\nCanned summary of the collected evidence.\n\n\
## Key Findings\n- Canned finding one\n- Canned finding two\n\n\
## Detailed Analysis\nCanned analysis referencing the gathered sources.\n\n\
## Conclusions\nCanned conclusions.\n\n\
## Sources\n- (mock mode: no live sources)\n"
            )
        }
    }
}

/// First quoted value following `marker` in the prompt.
fn quoted_after<'a>(prompt: &'a str, marker: &str) -> Option<&'a str> {
    let start = prompt.find(marker)? + marker.len();
    let rest = &prompt[start..];
    let end = rest.find('"')?;
    Some(&rest[..end]).filter(|s| !s.is_empty())
}
