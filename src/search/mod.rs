pub mod mock;
pub mod tavily;

use chrono::Utc;
use serde::Deserialize;

use crate::error::ResearchError;
use crate::evidence::{self, Evidence, EvidenceSource, MAX_EXCERPT_CHARS};
use crate::plan::SourceKind;
use mock::MockSearcher;
use tavily::TavilyClient;

/// Default result count per sub-query search.
pub const DEFAULT_MAX_RESULTS: usize = 10;

/// Per-call context the searcher threads into evidence identity.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    /// Sub-query (or `refinement_*`) id that issued this search.
    pub sub_query_id: String,
}

impl SearchOptions {
    pub fn for_sub_query(id: impl Into<String>) -> Self {
        Self {
            sub_query_id: id.into(),
        }
    }
}

/// One raw result from a search provider, before evidence conversion.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchHit {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub content: String,
    pub score: Option<f64>,
}

/// Convert provider hits into evidence: canonical URL, capped excerpt,
/// deterministic id, origin + sub-query tags, citation key.
pub fn hits_to_evidence(
    hits: Vec<SearchHit>,
    origin: SourceKind,
    opts: &SearchOptions,
) -> Vec<Evidence> {
    hits.into_iter()
        .enumerate()
        .map(|(i, hit)| {
            let url = evidence::canonicalize_url(&hit.url);
            let excerpt = evidence::cap_chars(&hit.content, MAX_EXCERPT_CHARS);
            Evidence {
                id: evidence::fingerprint(origin.as_str(), &url, &opts.sub_query_id, i),
                source: EvidenceSource {
                    url,
                    title: hit.title,
                    fetched_at: Utc::now(),
                },
                content_hash: Some(evidence::content_hash(&excerpt)),
                excerpt,
                score: hit.score,
                tags: vec![origin.as_str().to_string(), opts.sub_query_id.clone()],
                cit_key: Some(format!("SearchResult{}", i + 1)),
                produced_by: opts.sub_query_id.clone(),
            }
        })
        .collect()
}

/// Search backend, selected once at process init.
pub enum SearchBackend {
    Tavily(TavilyClient),
    Mock(MockSearcher),
}

impl SearchBackend {
    /// General web search.
    pub async fn search(
        &self,
        query: &str,
        max_results: usize,
        opts: &SearchOptions,
    ) -> Result<Vec<Evidence>, ResearchError> {
        match self {
            Self::Tavily(client) => client.search(query, max_results, opts).await,
            Self::Mock(mock) => mock.search(query, SourceKind::Web, max_results, opts).await,
        }
    }

    /// News search (recency-weighted).
    pub async fn search_news(
        &self,
        query: &str,
        max_results: usize,
        opts: &SearchOptions,
    ) -> Result<Vec<Evidence>, ResearchError> {
        match self {
            Self::Tavily(client) => client.search_news(query, max_results, opts).await,
            Self::Mock(mock) => mock.search(query, SourceKind::News, max_results, opts).await,
        }
    }

    /// Academic search (query augmented with scholarly site filters).
    pub async fn search_academic(
        &self,
        query: &str,
        max_results: usize,
        opts: &SearchOptions,
    ) -> Result<Vec<Evidence>, ResearchError> {
        match self {
            Self::Tavily(client) => client.search_academic(query, max_results, opts).await,
            Self::Mock(mock) => {
                mock.search(query, SourceKind::Academic, max_results, opts)
                    .await
            }
        }
    }

    /// Dispatch on origin kind. `Document` is not searchable here.
    pub async fn search_kind(
        &self,
        kind: SourceKind,
        query: &str,
        max_results: usize,
        opts: &SearchOptions,
    ) -> Result<Vec<Evidence>, ResearchError> {
        match kind {
            SourceKind::Web => self.search(query, max_results, opts).await,
            SourceKind::News => self.search_news(query, max_results, opts).await,
            SourceKind::Academic => self.search_academic(query, max_results, opts).await,
            SourceKind::Document => Ok(Vec::new()),
        }
    }

    /// Full-content extraction for a URL, when the provider supports it.
    pub async fn extract(&self, url: &str) -> Result<Option<String>, ResearchError> {
        match self {
            Self::Tavily(client) => client.extract(url).await,
            Self::Mock(mock) => Ok(mock.extract(url)),
        }
    }

    /// Lightweight availability probe. Never errors.
    pub async fn health(&self) -> bool {
        match self {
            Self::Tavily(client) => client.health().await,
            Self::Mock(_) => true,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Tavily(_) => "tavily",
            Self::Mock(_) => "mock",
        }
    }
}

impl std::fmt::Debug for SearchBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchBackend")
            .field("backend", &self.name())
            .finish()
    }
}
