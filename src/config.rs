//! Environment-driven configuration and one-time backend selection.
//!
//! Every backend is chosen exactly once at process init; the rest of the
//! crate only ever sees the backend enums. Missing credentials degrade to
//! mock backends with a warning — the pipeline stays runnable offline.

use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::model::mock::MockModel;
use crate::model::saptiva::SaptivaClient;
use crate::model::{ModelBackend, ModelTiers};
use crate::search::mock::MockSearcher;
use crate::search::tavily::TavilyClient;
use crate::search::SearchBackend;
use crate::store::weaviate::WeaviateStore;
use crate::store::{MemoryStore, StoreBackend};

/// Placeholder the sample .env ships with; treated the same as unset.
const KEY_PLACEHOLDER: &str = "pon_tu_api_key_aqui";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorBackend {
    Weaviate,
    None,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub saptiva_api_key: Option<String>,
    pub saptiva_base_url: String,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub tiers: ModelTiers,
    pub tavily_api_key: Option<String>,
    pub vector_backend: VectorBackend,
    pub weaviate_host: String,
    pub artifacts_dir: Option<PathBuf>,
    pub db_path: Option<PathBuf>,
    /// Researcher fan-out width.
    pub workers: usize,
    /// Results requested per sub-query search.
    pub max_results: usize,
}

impl Config {
    pub fn from_env() -> Self {
        let saptiva_api_key = real_key(env::var("SAPTIVA_API_KEY").ok());
        if saptiva_api_key.is_none() {
            tracing::warn!("SAPTIVA_API_KEY not set — model calls use mock responses");
        }

        let tavily_api_key = real_key(env::var("TAVILY_API_KEY").ok());
        if tavily_api_key.is_none() {
            tracing::warn!("TAVILY_API_KEY not set — search uses mock results");
        }

        let vector_backend = match env::var("VECTOR_BACKEND").as_deref() {
            Ok("weaviate") => VectorBackend::Weaviate,
            Ok("none") | Err(_) => VectorBackend::None,
            Ok(other) => {
                tracing::warn!("unknown VECTOR_BACKEND '{other}' — using in-memory store");
                VectorBackend::None
            }
        };

        Self {
            saptiva_api_key,
            saptiva_base_url: env::var("SAPTIVA_BASE_URL")
                .unwrap_or_else(|_| "https://api.saptiva.com/v1".to_string()),
            connect_timeout: secs_var("SAPTIVA_CONNECT_TIMEOUT", 15),
            read_timeout: secs_var("SAPTIVA_READ_TIMEOUT", 90),
            tiers: ModelTiers {
                planner: env::var("SAPTIVA_MODEL_PLANNER")
                    .unwrap_or_else(|_| "Saptiva Ops".to_string()),
                analyst: env::var("SAPTIVA_MODEL_ANALYST")
                    .unwrap_or_else(|_| "Saptiva Cortex".to_string()),
                writer: env::var("SAPTIVA_MODEL_WRITER")
                    .unwrap_or_else(|_| "Saptiva Cortex".to_string()),
            },
            tavily_api_key,
            vector_backend,
            weaviate_host: env::var("WEAVIATE_HOST")
                .unwrap_or_else(|_| "http://localhost:8080".to_string()),
            artifacts_dir: env::var("ARTIFACTS_DIR").ok().map(PathBuf::from),
            db_path: env::var("ALETHEIA_DB_PATH").ok().map(PathBuf::from),
            workers: crate::researcher::DEFAULT_WORKERS,
            max_results: crate::search::DEFAULT_MAX_RESULTS,
        }
    }

    /// Select the model backend.
    pub fn build_model(&self) -> Arc<ModelBackend> {
        match &self.saptiva_api_key {
            Some(key) => Arc::new(ModelBackend::Saptiva(SaptivaClient::new(
                &self.saptiva_base_url,
                key,
                self.connect_timeout,
                self.read_timeout,
            ))),
            None => Arc::new(ModelBackend::Mock(MockModel::new())),
        }
    }

    /// Select the search backend.
    pub fn build_search(&self) -> Arc<SearchBackend> {
        match &self.tavily_api_key {
            Some(key) => Arc::new(SearchBackend::Tavily(TavilyClient::new(
                key,
                self.connect_timeout,
            ))),
            None => Arc::new(SearchBackend::Mock(MockSearcher::new())),
        }
    }

    /// Select the evidence store. An unreachable Weaviate falls back to the
    /// in-memory store so research still runs, with degraded recall.
    pub async fn build_store(&self) -> Arc<StoreBackend> {
        if self.vector_backend == VectorBackend::Weaviate {
            let store = WeaviateStore::new(&self.weaviate_host, self.connect_timeout);
            if store.health().await {
                return Arc::new(StoreBackend::Weaviate(store));
            }
            tracing::warn!(
                host = self.weaviate_host,
                "weaviate not reachable — using in-memory evidence store"
            );
        }
        Arc::new(StoreBackend::Memory(MemoryStore::new()))
    }
}

fn real_key(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty() && v != KEY_PLACEHOLDER)
}

fn secs_var(name: &str, default: u64) -> Duration {
    let secs = env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default);
    Duration::from_secs(secs)
}
