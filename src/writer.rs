//! Report synthesis: RAG recall plus one analytical-tier completion.

use std::sync::Arc;

use crate::evidence::{self, Evidence};
use crate::model::{CompletionRequest, ModelBackend};
use crate::store::StoreBackend;

/// Stored items recalled semantically to enrich the writer's context.
const RAG_RECALL_LIMIT: usize = 10;

pub struct Writer {
    model: Arc<ModelBackend>,
    store: Arc<StoreBackend>,
    model_name: String,
}

impl Writer {
    pub fn new(
        model: Arc<ModelBackend>,
        store: Arc<StoreBackend>,
        model_name: impl Into<String>,
    ) -> Self {
        Self {
            model,
            store,
            model_name: model_name.into(),
        }
    }

    /// Produce the cited markdown report. Never fails: any provider error
    /// degrades to a minimal "report unavailable" document.
    pub async fn write(&self, query: &str, evidence: &[Evidence], collection: &str) -> String {
        let merged = self.recall_and_merge(query, evidence, collection).await;

        let req = CompletionRequest::new(&self.model_name, build_prompt(query, &merged))
            .with_max_tokens(3000)
            .with_temperature(0.7);

        match self.model.complete(&req).await {
            Ok(resp) if !resp.content.trim().is_empty() => resp.content,
            Ok(_) => {
                tracing::warn!("writer returned empty report");
                unavailable_report(query)
            }
            Err(e) => {
                tracing::warn!("report generation failed: {}", e.user_message());
                unavailable_report(query)
            }
        }
    }

    /// RAG recall: semantically similar stored evidence, merged after the
    /// caller's items with id/content-hash dedupe (originals win).
    async fn recall_and_merge(
        &self,
        query: &str,
        evidence: &[Evidence],
        collection: &str,
    ) -> Vec<Evidence> {
        let recalled = match self.store.similar(collection, query, RAG_RECALL_LIMIT).await {
            Ok(recalled) => recalled,
            Err(e) => {
                tracing::warn!(collection, "RAG recall failed: {e}");
                Vec::new()
            }
        };

        let mut merged = evidence.to_vec();
        let before = merged.len();
        evidence::merge_dedupe(&mut merged, recalled);
        tracing::debug!(
            original = before,
            recalled = merged.len() - before,
            "writer context assembled"
        );
        merged
    }
}

impl std::fmt::Debug for Writer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Writer")
            .field("model", &self.model_name)
            .finish()
    }
}

fn build_prompt(query: &str, evidence: &[Evidence]) -> String {
    let evidence_str: Vec<String> = evidence
        .iter()
        .map(|ev| {
            format!(
                "Source: {}\nTitle: {}\nExcerpt: {}",
                ev.source.url, ev.source.title, ev.excerpt
            )
        })
        .collect();

    format!(
        r#"Based on the user query and the collected evidence, write a comprehensive markdown report.
Cite evidence by referencing the source URL in the format [Source](URL).

Use this structure:
# {query}

## Executive Summary
[Brief summary of key findings]

## Key Findings
[Main insights from the research]

## Detailed Analysis
[In-depth analysis with citations]

## Conclusions
[Summary of conclusions and implications]

## Sources
[Bibliography of all sources used]

User Query: "{query}"

Evidence:
---
{}
---

Markdown Report:
"#,
        evidence_str.join("\n\n")
    )
}

/// Minimal document returned when synthesis fails. Always contains the
/// query and an unavailability notice.
fn unavailable_report(query: &str) -> String {
    format!(
        "# {query}\n\n_Report unavailable: the synthesis model could not be reached. \
         Collected evidence is preserved for a later retry._\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::{content_hash, EvidenceSource};
    use crate::model::mock::{MockModel, PromptKind};
    use crate::store::{MemoryStore, StoreBackend};
    use chrono::Utc;

    fn ev(id: &str, excerpt: &str) -> Evidence {
        Evidence {
            id: id.to_string(),
            source: EvidenceSource {
                url: format!("https://example.com/{id}"),
                title: format!("Title {id}"),
                fetched_at: Utc::now(),
            },
            excerpt: excerpt.to_string(),
            content_hash: Some(content_hash(excerpt)),
            score: Some(0.8),
            tags: vec!["web".to_string()],
            cit_key: None,
            produced_by: "sq_1".to_string(),
        }
    }

    fn writer_with(mock: MockModel, store: Arc<StoreBackend>) -> Writer {
        Writer::new(Arc::new(ModelBackend::Mock(mock)), store, "mock-writer")
    }

    #[tokio::test]
    async fn report_comes_from_model() {
        let store = Arc::new(StoreBackend::Memory(MemoryStore::new()));
        let mock = MockModel::new();
        mock.script(PromptKind::Report, "# Report\n\n## Executive Summary\nDone.");
        let writer = writer_with(mock, store);

        let report = writer.write("q", &[ev("ev_1", "alpha")], "c1").await;
        assert!(report.contains("## Executive Summary"));
    }

    #[tokio::test]
    async fn model_failure_yields_minimal_report() {
        let store = Arc::new(StoreBackend::Memory(MemoryStore::new()));
        let mock = MockModel::new();
        mock.script_failure(PromptKind::Report, "down");
        let writer = writer_with(mock, store);

        let report = writer.write("fintech research", &[], "c1").await;
        assert!(report.contains("fintech research"));
        assert!(report.contains("Report unavailable"));
    }

    #[tokio::test]
    async fn rag_recall_enriches_without_duplicates() {
        let mem = MemoryStore::new();
        // One item already known to the caller, one only in the store.
        let shared = ev("ev_shared", "orchestration loop details");
        let stored_only = ev("ev_stored", "extra orchestration background");
        mem.insert("c1", &shared).unwrap();
        mem.insert("c1", &stored_only).unwrap();
        let store = Arc::new(StoreBackend::Memory(mem));

        let writer = writer_with(MockModel::new(), store);
        let merged = writer
            .recall_and_merge("orchestration", &[shared.clone()], "c1")
            .await;

        let ids: Vec<&str> = merged.iter().map(|e| e.id.as_str()).collect();
        // Original first, recalled extras appended, no duplicate of ev_shared.
        assert_eq!(ids[0], "ev_shared");
        assert!(ids.contains(&"ev_stored"));
        assert_eq!(ids.len(), 2);
    }
}
