//! Tavily search client.
//!
//! Plain JSON POST endpoints (no streaming): `/search` for web, news, and
//! academic queries, `/extract` for full-page content. Errors surface as
//! `SearchFailed` — the researcher isolates them per sub-query.

use std::time::{Duration, Instant};

use reqwest::Client;
use serde::Deserialize;

use super::{hits_to_evidence, SearchHit, SearchOptions};
use crate::error::ResearchError;
use crate::evidence::Evidence;
use crate::plan::SourceKind;

const TAVILY_BASE_URL: &str = "https://api.tavily.com";

/// Single request ceiling; search calls are small and should fail fast.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct TavilyClient {
    client: Client,
    base_url: String,
    api_key: String,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchHit>,
}

#[derive(Deserialize)]
struct ExtractResponse {
    #[serde(default)]
    results: Vec<ExtractResult>,
}

#[derive(Deserialize)]
struct ExtractResult {
    #[serde(default)]
    raw_content: Option<String>,
    #[serde(default)]
    content: Option<String>,
}

impl TavilyClient {
    pub fn new(api_key: impl Into<String>, connect_timeout: Duration) -> Self {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: TAVILY_BASE_URL.to_string(),
            api_key: api_key.into(),
        }
    }

    /// Override the endpoint (tests point this at a local stub).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub async fn search(
        &self,
        query: &str,
        max_results: usize,
        opts: &SearchOptions,
    ) -> Result<Vec<Evidence>, ResearchError> {
        let hits = self.search_raw(query, max_results, None).await?;
        Ok(hits_to_evidence(hits, SourceKind::Web, opts))
    }

    pub async fn search_news(
        &self,
        query: &str,
        max_results: usize,
        opts: &SearchOptions,
    ) -> Result<Vec<Evidence>, ResearchError> {
        let hits = self.search_raw(query, max_results, Some("news")).await?;
        Ok(hits_to_evidence(hits, SourceKind::News, opts))
    }

    /// Academic search: the same endpoint with scholarly site filters
    /// appended to the query.
    pub async fn search_academic(
        &self,
        query: &str,
        max_results: usize,
        opts: &SearchOptions,
    ) -> Result<Vec<Evidence>, ResearchError> {
        let academic_query = format!(
            "{query} site:arxiv.org OR site:scholar.google.com OR site:pubmed.ncbi.nlm.nih.gov"
        );
        let hits = self.search_raw(&academic_query, max_results, None).await?;
        Ok(hits_to_evidence(hits, SourceKind::Academic, opts))
    }

    async fn search_raw(
        &self,
        query: &str,
        max_results: usize,
        topic: Option<&str>,
    ) -> Result<Vec<SearchHit>, ResearchError> {
        let mut body = serde_json::json!({
            "api_key": self.api_key,
            "query": query,
            "search_depth": "advanced",
            "max_results": max_results,
        });
        if let Some(topic) = topic {
            body["topic"] = serde_json::json!(topic);
        }

        let start = Instant::now();
        let send = self
            .client
            .post(format!("{}/search", self.base_url))
            .json(&body)
            .send();

        let response = tokio::time::timeout(REQUEST_TIMEOUT, send)
            .await
            .map_err(|_| ResearchError::Timeout(start.elapsed().as_millis() as u64))?
            .map_err(|e| ResearchError::SearchFailed {
                provider: "tavily".to_string(),
                message: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ResearchError::SearchFailed {
                provider: "tavily".to_string(),
                message: format!("HTTP {status}"),
            });
        }

        let parsed: SearchResponse =
            response
                .json()
                .await
                .map_err(|e| ResearchError::SearchFailed {
                    provider: "tavily".to_string(),
                    message: format!("malformed response: {e}"),
                })?;

        Ok(parsed.results)
    }

    /// Full-content extraction for one URL. `Ok(None)` when the provider
    /// has nothing for it.
    pub async fn extract(&self, url: &str) -> Result<Option<String>, ResearchError> {
        let body = serde_json::json!({
            "api_key": self.api_key,
            "urls": [url],
        });

        let start = Instant::now();
        let send = self
            .client
            .post(format!("{}/extract", self.base_url))
            .json(&body)
            .send();

        let response = tokio::time::timeout(REQUEST_TIMEOUT, send)
            .await
            .map_err(|_| ResearchError::Timeout(start.elapsed().as_millis() as u64))?
            .map_err(|e| ResearchError::SearchFailed {
                provider: "tavily".to_string(),
                message: e.to_string(),
            })?;

        if !response.status().is_success() {
            return Err(ResearchError::SearchFailed {
                provider: "tavily".to_string(),
                message: format!("HTTP {}", response.status()),
            });
        }

        let parsed: ExtractResponse =
            response
                .json()
                .await
                .map_err(|e| ResearchError::SearchFailed {
                    provider: "tavily".to_string(),
                    message: format!("malformed extract response: {e}"),
                })?;

        Ok(parsed
            .results
            .into_iter()
            .next()
            .and_then(|r| r.raw_content.or(r.content))
            .filter(|c| !c.is_empty()))
    }

    /// One-result probe search. Returns false on any failure.
    pub async fn health(&self) -> bool {
        self.search_raw("health probe", 1, None).await.is_ok()
    }
}
