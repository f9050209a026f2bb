//! Evidence store: semantic insert, k-NN retrieval, dedupe, per-run collections.
//!
//! Two backends behind one enum: Weaviate when a reachable instance is
//! configured, otherwise an in-memory fallback that satisfies the same
//! contract with substring-based recall — semantic quality degraded,
//! correctness preserved.

pub mod weaviate;

#[cfg(feature = "durable-store")]
pub mod durable;

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::error::ResearchError;
use crate::evidence::Evidence;
use weaviate::WeaviateStore;

/// Evidence store backend, selected once at process init.
pub enum StoreBackend {
    Weaviate(WeaviateStore),
    Memory(MemoryStore),
}

impl StoreBackend {
    /// Create the collection if it does not exist. Idempotent.
    pub async fn ensure(&self, collection: &str) -> Result<(), ResearchError> {
        match self {
            Self::Weaviate(store) => store.ensure(collection).await,
            Self::Memory(store) => {
                store.ensure(collection);
                Ok(())
            }
        }
    }

    /// Insert evidence. Returns false when the item is a duplicate
    /// (same id, or same content hash as an existing item).
    pub async fn insert(
        &self,
        collection: &str,
        evidence: &Evidence,
    ) -> Result<bool, ResearchError> {
        match self {
            Self::Weaviate(store) => store.insert(collection, evidence).await,
            Self::Memory(store) => store.insert(collection, evidence),
        }
    }

    /// k-NN retrieval, descending similarity.
    pub async fn similar(
        &self,
        collection: &str,
        text: &str,
        k: usize,
    ) -> Result<Vec<Evidence>, ResearchError> {
        match self {
            Self::Weaviate(store) => store.similar(collection, text, k).await,
            Self::Memory(store) => Ok(store.similar(collection, text, k)),
        }
    }

    pub async fn drop_collection(&self, collection: &str) -> Result<(), ResearchError> {
        match self {
            Self::Weaviate(store) => store.drop_collection(collection).await,
            Self::Memory(store) => {
                store.drop_collection(collection);
                Ok(())
            }
        }
    }

    /// Lightweight availability probe. Never errors.
    pub async fn health(&self) -> bool {
        match self {
            Self::Weaviate(store) => store.health().await,
            Self::Memory(_) => true,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Weaviate(_) => "weaviate",
            Self::Memory(_) => "memory",
        }
    }
}

impl std::fmt::Debug for StoreBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreBackend")
            .field("backend", &self.name())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// In-memory fallback
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemCollection {
    items: Vec<Evidence>,
    ids: HashSet<String>,
    hashes: HashSet<String>,
}

/// In-process evidence store. Insert is safe for concurrent callers —
/// dedupe and append happen under one mutex, so workers get an
/// authoritative accepted/duplicate answer without holding their own lock.
#[derive(Default)]
pub struct MemoryStore {
    collections: Mutex<HashMap<String, MemCollection>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ensure(&self, collection: &str) {
        if let Ok(mut map) = self.collections.lock() {
            map.entry(collection.to_string()).or_default();
        }
    }

    pub fn insert(&self, collection: &str, evidence: &Evidence) -> Result<bool, ResearchError> {
        let mut map = self
            .collections
            .lock()
            .map_err(|_| ResearchError::Store("memory store poisoned".to_string()))?;
        let coll = map.entry(collection.to_string()).or_default();

        if coll.ids.contains(&evidence.id) {
            return Ok(false);
        }
        if let Some(hash) = &evidence.content_hash
            && coll.hashes.contains(hash)
        {
            return Ok(false);
        }

        coll.ids.insert(evidence.id.clone());
        if let Some(hash) = &evidence.content_hash {
            coll.hashes.insert(hash.clone());
        }
        coll.items.push(evidence.clone());
        Ok(true)
    }

    /// Substring-based recall: rank by the number of distinct query terms
    /// present in the excerpt or title. Stable order for equal scores
    /// (insertion order), zero-score items excluded.
    pub fn similar(&self, collection: &str, text: &str, k: usize) -> Vec<Evidence> {
        let Ok(map) = self.collections.lock() else {
            return Vec::new();
        };
        let Some(coll) = map.get(collection) else {
            return Vec::new();
        };

        let terms: Vec<String> = text
            .to_lowercase()
            .split_whitespace()
            .map(|t| t.to_string())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        let mut scored: Vec<(usize, &Evidence)> = coll
            .items
            .iter()
            .map(|ev| {
                let haystack =
                    format!("{} {}", ev.excerpt.to_lowercase(), ev.source.title.to_lowercase());
                let score = terms
                    .iter()
                    .filter(|term| haystack.contains(term.as_str()))
                    .count();
                (score, ev)
            })
            .filter(|(score, _)| *score > 0)
            .collect();

        scored.sort_by(|a, b| b.0.cmp(&a.0));
        scored.into_iter().take(k).map(|(_, ev)| ev.clone()).collect()
    }

    pub fn drop_collection(&self, collection: &str) {
        if let Ok(mut map) = self.collections.lock() {
            map.remove(collection);
        }
    }

    /// Item count, for tests and diagnostics.
    pub fn len(&self, collection: &str) -> usize {
        self.collections
            .lock()
            .ok()
            .and_then(|map| map.get(collection).map(|c| c.items.len()))
            .unwrap_or(0)
    }

    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.collections.lock().map(|m| m.len()).unwrap_or(0);
        f.debug_struct("MemoryStore")
            .field("collections", &count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evidence::{content_hash, EvidenceSource};
    use chrono::Utc;

    fn ev(id: &str, excerpt: &str) -> Evidence {
        Evidence {
            id: id.to_string(),
            source: EvidenceSource {
                url: format!("https://example.com/{id}"),
                title: format!("title {id}"),
                fetched_at: Utc::now(),
            },
            excerpt: excerpt.to_string(),
            content_hash: Some(content_hash(excerpt)),
            score: Some(0.8),
            tags: vec!["web".into(), "sq_1".into()],
            cit_key: None,
            produced_by: "sq_1".into(),
        }
    }

    #[test]
    fn double_insert_returns_true_then_false() {
        let store = MemoryStore::new();
        store.ensure("c");
        let item = ev("ev_a", "the quick brown fox");
        assert!(store.insert("c", &item).unwrap());
        assert!(!store.insert("c", &item).unwrap());
        assert_eq!(store.len("c"), 1);
    }

    #[test]
    fn content_hash_duplicate_rejected_across_ids() {
        let store = MemoryStore::new();
        let a = ev("ev_a", "Identical Text Here");
        let b = ev("ev_b", "identical   text here");
        assert!(store.insert("c", &a).unwrap());
        assert!(!store.insert("c", &b).unwrap());
    }

    #[test]
    fn similar_ranks_by_term_overlap() {
        let store = MemoryStore::new();
        store.insert("c", &ev("ev_1", "rust async runtime internals")).unwrap();
        store.insert("c", &ev("ev_2", "rust borrow checker")).unwrap();
        store.insert("c", &ev("ev_3", "gardening tips for spring")).unwrap();

        let results = store.similar("c", "rust async", 10);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].id, "ev_1"); // two term hits beat one
        assert_eq!(results[1].id, "ev_2");
    }

    #[test]
    fn similar_is_unchanged_by_duplicate_insert() {
        let store = MemoryStore::new();
        let item = ev("ev_1", "unique snippet about orchestration");
        store.insert("c", &item).unwrap();
        let before = store.similar("c", "orchestration", 10);
        let _ = store.insert("c", &item);
        let after = store.similar("c", "orchestration", 10);
        assert_eq!(before, after);
    }

    #[test]
    fn collections_are_isolated() {
        let store = MemoryStore::new();
        store.insert("run_a", &ev("ev_1", "alpha content")).unwrap();
        assert!(store.similar("run_b", "alpha", 10).is_empty());
        store.drop_collection("run_a");
        assert!(store.is_empty("run_a"));
    }
}
