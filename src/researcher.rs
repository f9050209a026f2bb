//! Parallel sub-query execution: fan out searches, screen, persist, merge.

use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::evidence::{self, Evidence};
use crate::guard::{Guard, GuardVerdict};
use crate::plan::{Plan, SourceKind, SubQuery};
use crate::search::{SearchBackend, SearchOptions};
use crate::store::StoreBackend;

/// Concurrent sub-query width.
pub const DEFAULT_WORKERS: usize = 5;

/// Admission cap per iteration — the sole backpressure point for fan-out.
pub const MAX_SUB_QUERIES: usize = 12;

pub struct Researcher {
    search: Arc<SearchBackend>,
    store: Arc<StoreBackend>,
    guard: Option<Arc<dyn Guard>>,
    workers: usize,
    max_results: usize,
}

impl Researcher {
    pub fn new(
        search: Arc<SearchBackend>,
        store: Arc<StoreBackend>,
        workers: usize,
        max_results: usize,
    ) -> Self {
        Self {
            search,
            store,
            guard: None,
            workers: workers.max(1),
            max_results,
        }
    }

    /// Screen evidence through a safety filter before storage.
    pub fn with_guard(mut self, guard: Arc<dyn Guard>) -> Self {
        self.guard = Some(guard);
        self
    }

    /// Execute a plan's searchable sub-queries with bounded parallelism.
    ///
    /// Only evidence accepted by the store is returned, so everything the
    /// caller reports downstream is already persisted. Per-sub-query
    /// failures are logged and contribute nothing; peers are unaffected.
    /// The returned order is deterministic for fixed inputs: sub-query
    /// index first, then upstream rank.
    pub async fn execute(
        &self,
        plan: &Plan,
        collection: &str,
        cancel: &CancellationToken,
    ) -> Vec<Evidence> {
        if let Err(e) = self.store.ensure(collection).await {
            tracing::warn!(collection, "store ensure failed: {e}");
        }

        let runnable: Vec<(usize, SubQuery)> = plan
            .sub_queries
            .iter()
            .filter(|sq| sq.is_searchable())
            .take(MAX_SUB_QUERIES)
            .cloned()
            .enumerate()
            .collect();

        if runnable.is_empty() {
            return Vec::new();
        }

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut set: JoinSet<(usize, Vec<Evidence>)> = JoinSet::new();

        for (idx, sub_query) in runnable {
            let search = self.search.clone();
            let store = self.store.clone();
            let guard = self.guard.clone();
            let semaphore = semaphore.clone();
            let cancel = cancel.clone();
            let collection = collection.to_string();
            let max_results = self.max_results;

            set.spawn(async move {
                let Ok(_permit) = semaphore.acquire().await else {
                    return (idx, Vec::new());
                };
                if cancel.is_cancelled() {
                    return (idx, Vec::new());
                }

                let accepted = run_sub_query(
                    &search,
                    &store,
                    guard.as_deref(),
                    &sub_query,
                    &collection,
                    max_results,
                    &cancel,
                )
                .await;
                (idx, accepted)
            });
        }

        // Collect out of completion order, restore sub-query order after.
        let mut buckets: Vec<(usize, Vec<Evidence>)> = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(bucket) => buckets.push(bucket),
                Err(e) => tracing::error!("research worker panicked: {e}"),
            }
        }
        buckets.sort_by_key(|(idx, _)| *idx);

        let mut merged: Vec<Evidence> = Vec::new();
        for (_, bucket) in buckets {
            evidence::merge_dedupe(&mut merged, bucket);
        }

        tracing::info!(
            collection,
            evidence = merged.len(),
            "research pass finished"
        );
        merged
    }
}

impl std::fmt::Debug for Researcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Researcher")
            .field("workers", &self.workers)
            .field("max_results", &self.max_results)
            .finish()
    }
}

/// Execute one sub-query end to end: search, screen, persist.
/// Never propagates errors — a failed sub-query yields zero evidence.
async fn run_sub_query(
    search: &SearchBackend,
    store: &StoreBackend,
    guard: Option<&dyn Guard>,
    sub_query: &SubQuery,
    collection: &str,
    max_results: usize,
    cancel: &CancellationToken,
) -> Vec<Evidence> {
    let Some(kind) = pick_search_kind(sub_query) else {
        return Vec::new();
    };
    let opts = SearchOptions::for_sub_query(&sub_query.id);

    let results = tokio::select! {
        _ = cancel.cancelled() => {
            tracing::debug!(sub_query = sub_query.id, "search cancelled");
            return Vec::new();
        }
        results = search.search_kind(kind, &sub_query.text, max_results, &opts) => results,
    };

    let candidates = match results {
        Ok(candidates) => candidates,
        Err(e) => {
            tracing::warn!(
                sub_query = sub_query.id,
                "sub-query search failed: {}",
                e.user_message()
            );
            return Vec::new();
        }
    };

    let mut accepted = Vec::new();
    for mut ev in candidates {
        match guard.map(|g| g.screen(&ev)) {
            Some(GuardVerdict::Deny) => {
                tracing::debug!(evidence = ev.id, "evidence denied by guard");
                continue;
            }
            Some(GuardVerdict::Redact(excerpt)) => {
                ev.content_hash = Some(evidence::content_hash(&excerpt));
                ev.excerpt = excerpt;
            }
            Some(GuardVerdict::Allow) | None => {}
        }

        match store.insert(collection, &ev).await {
            Ok(true) => accepted.push(ev),
            Ok(false) => {
                tracing::debug!(evidence = ev.id, "duplicate evidence skipped");
            }
            Err(e) => {
                // Store rejection drops the single item, not the sub-query.
                tracing::warn!(evidence = ev.id, "store insert failed: {e}");
            }
        }
    }
    accepted
}

/// Highest-priority searchable kind declared on the sub-query.
fn pick_search_kind(sub_query: &SubQuery) -> Option<SourceKind> {
    for kind in [SourceKind::Web, SourceKind::News, SourceKind::Academic] {
        if sub_query.sources.contains(&kind) {
            return Some(kind);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::mock::MockSearcher;
    use crate::store::MemoryStore;

    fn plan_of(queries: &[(&str, &str)]) -> Plan {
        Plan {
            main_query: "main".to_string(),
            sub_queries: queries
                .iter()
                .map(|(id, text)| SubQuery {
                    id: id.to_string(),
                    text: text.to_string(),
                    sources: vec![SourceKind::Web],
                })
                .collect(),
        }
    }

    fn researcher(mock: MockSearcher) -> (Researcher, Arc<StoreBackend>) {
        let store = Arc::new(StoreBackend::Memory(MemoryStore::new()));
        let search = Arc::new(SearchBackend::Mock(mock));
        (
            Researcher::new(search, store.clone(), DEFAULT_WORKERS, 10),
            store,
        )
    }

    #[tokio::test]
    async fn merge_order_is_deterministic() {
        let (r, _) = researcher(MockSearcher::new());
        let plan = plan_of(&[("sq_a", "alpha topic"), ("sq_b", "beta topic")]);
        let cancel = CancellationToken::new();

        let first = r.execute(&plan, "c1", &cancel).await;
        assert_eq!(first.len(), 6);
        // All of sq_a's evidence precedes sq_b's regardless of completion order.
        let produced: Vec<&str> = first.iter().map(|e| e.produced_by.as_str()).collect();
        assert_eq!(produced, vec!["sq_a", "sq_a", "sq_a", "sq_b", "sq_b", "sq_b"]);
    }

    #[tokio::test]
    async fn failed_sub_query_is_isolated() {
        let mock = MockSearcher::new();
        mock.fail_for("beta");
        let (r, _) = researcher(mock);
        let plan = plan_of(&[
            ("sq_a", "alpha topic"),
            ("sq_b", "beta topic"),
            ("sq_c", "gamma topic"),
        ]);
        let evidence = r.execute(&plan, "c1", &CancellationToken::new()).await;

        assert_eq!(evidence.len(), 6);
        assert!(!evidence.iter().any(|e| e.produced_by == "sq_b"));
    }

    #[tokio::test]
    async fn returned_evidence_is_persisted() {
        let (r, store) = researcher(MockSearcher::new());
        let plan = plan_of(&[("sq_a", "alpha topic")]);
        let evidence = r.execute(&plan, "c1", &CancellationToken::new()).await;

        assert_eq!(evidence.len(), 3);
        if let StoreBackend::Memory(mem) = store.as_ref() {
            assert_eq!(mem.len("c1"), 3);
        }
    }

    #[tokio::test]
    async fn duplicate_content_across_sub_queries_is_dropped() {
        let mock = MockSearcher::new();
        // Both sub-queries are scripted to return the same page.
        let hit = crate::search::SearchHit {
            url: "https://example.com/shared".to_string(),
            title: "Shared".to_string(),
            content: "identical shared content".to_string(),
            score: Some(0.9),
        };
        mock.hits_for("alpha", vec![hit.clone()]);
        mock.hits_for("beta", vec![hit]);

        let (r, _) = researcher(mock);
        let plan = plan_of(&[("sq_a", "alpha topic"), ("sq_b", "beta topic")]);
        let evidence = r.execute(&plan, "c1", &CancellationToken::new()).await;

        assert_eq!(evidence.len(), 1);
        assert_eq!(evidence[0].produced_by, "sq_a");
    }

    #[tokio::test]
    async fn document_only_sub_queries_are_skipped() {
        let (r, _) = researcher(MockSearcher::new());
        let plan = Plan {
            main_query: "main".to_string(),
            sub_queries: vec![SubQuery {
                id: "docs".to_string(),
                text: "annual filings".to_string(),
                sources: vec![SourceKind::Document],
            }],
        };
        let evidence = r.execute(&plan, "c1", &CancellationToken::new()).await;
        assert!(evidence.is_empty());
    }

    #[tokio::test]
    async fn cancellation_stops_new_work() {
        let mock = MockSearcher::new().with_delay(std::time::Duration::from_millis(50));
        let (r, _) = researcher(mock);
        let plan = plan_of(&[("sq_a", "alpha"), ("sq_b", "beta"), ("sq_c", "gamma")]);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let evidence = r.execute(&plan, "c1", &cancel).await;
        assert!(evidence.is_empty());
    }

    #[tokio::test]
    async fn guard_deny_filters_and_redact_rewrites() {
        struct TestGuard;
        impl Guard for TestGuard {
            fn screen(&self, ev: &Evidence) -> GuardVerdict {
                if ev.excerpt.contains("#1") {
                    GuardVerdict::Deny
                } else if ev.excerpt.contains("#2") {
                    GuardVerdict::Redact("[redacted]".to_string())
                } else {
                    GuardVerdict::Allow
                }
            }
        }

        let (r, _) = researcher(MockSearcher::new());
        let r = r.with_guard(Arc::new(TestGuard));
        let plan = plan_of(&[("sq_a", "alpha topic")]);
        let evidence = r.execute(&plan, "c1", &CancellationToken::new()).await;

        assert_eq!(evidence.len(), 2);
        assert!(evidence.iter().any(|e| e.excerpt == "[redacted]"));
    }
}
