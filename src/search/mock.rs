//! Mock search backend: deterministic synthetic results for offline runs
//! and scripted behaviour (explicit hits, failures, latency) for tests.

use std::sync::Mutex;
use std::time::Duration;

use super::{hits_to_evidence, SearchHit, SearchOptions};
use crate::error::ResearchError;
use crate::evidence::Evidence;
use crate::plan::SourceKind;

#[derive(Default)]
struct MockSearchState {
    /// Scripted hits keyed by query substring; first match wins.
    scripted: Vec<(String, Vec<SearchHit>)>,
    /// Query substrings that fail with `SearchFailed`.
    failing: Vec<String>,
}

pub struct MockSearcher {
    state: Mutex<MockSearchState>,
    default_hits: usize,
    delay: Option<Duration>,
}

impl Default for MockSearcher {
    fn default() -> Self {
        Self::new()
    }
}

impl MockSearcher {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockSearchState::default()),
            default_hits: 3,
            delay: None,
        }
    }

    /// Number of synthetic hits returned when nothing is scripted.
    pub fn with_default_hits(mut self, n: usize) -> Self {
        self.default_hits = n;
        self
    }

    /// Sleep this long before answering any search. Lets tests exercise
    /// cancellation mid-research.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Script explicit hits for queries containing `query_part`.
    pub fn hits_for(&self, query_part: &str, hits: Vec<SearchHit>) {
        if let Ok(mut state) = self.state.lock() {
            state.scripted.push((query_part.to_string(), hits));
        }
    }

    /// Make searches whose query contains `query_part` fail.
    pub fn fail_for(&self, query_part: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.failing.push(query_part.to_string());
        }
    }

    pub async fn search(
        &self,
        query: &str,
        origin: SourceKind,
        max_results: usize,
        opts: &SearchOptions,
    ) -> Result<Vec<Evidence>, ResearchError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let hits = {
            let state = self.state.lock().map_err(|_| {
                ResearchError::InvariantViolation("mock searcher state poisoned".to_string())
            })?;

            if state.failing.iter().any(|part| query.contains(part.as_str())) {
                return Err(ResearchError::SearchFailed {
                    provider: "mock".to_string(),
                    message: format!("scripted failure for query: {query}"),
                });
            }

            state
                .scripted
                .iter()
                .find(|(part, _)| query.contains(part.as_str()))
                .map(|(_, hits)| hits.clone())
        };

        let hits = hits.unwrap_or_else(|| synthetic_hits(query, origin, self.default_hits));
        let hits = hits.into_iter().take(max_results).collect();
        Ok(hits_to_evidence(hits, origin, opts))
    }

    /// Synthetic page content for extract calls.
    pub fn extract(&self, url: &str) -> Option<String> {
        Some(format!("extracted content for {url}"))
    }
}

impl std::fmt::Debug for MockSearcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockSearcher")
            .field("default_hits", &self.default_hits)
            .finish()
    }
}

/// Deterministic synthetic hits derived from the query and origin —
/// identical inputs always yield identical results (needed for the
/// determinism property of mock-backed runs).
fn synthetic_hits(query: &str, origin: SourceKind, count: usize) -> Vec<SearchHit> {
    let slug: String = query
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .take(40)
        .collect();

    (0..count)
        .map(|i| SearchHit {
            url: format!("https://{}.example.com/{slug}/{i}", origin.as_str()),
            title: format!("Result {} for {query}", i + 1),
            content: format!(
                "Synthetic {} evidence #{} about: {query}. \
                 Stable filler text for relevance ranking.",
                origin.as_str(),
                i + 1
            ),
            score: Some(0.9 - 0.1 * i as f64),
        })
        .collect()
}
