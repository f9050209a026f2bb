//! Determinism under fixed providers: identical inputs, identical outputs.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use aletheia::evaluator::Evaluator;
use aletheia::events::NullSink;
use aletheia::model::mock::MockModel;
use aletheia::model::ModelBackend;
use aletheia::orchestrator::{DeepResult, Orchestrator, RunParams};
use aletheia::planner::Planner;
use aletheia::progress::ProgressBus;
use aletheia::researcher::Researcher;
use aletheia::search::mock::MockSearcher;
use aletheia::search::SearchBackend;
use aletheia::store::{MemoryStore, StoreBackend};
use aletheia::writer::Writer;

/// A fresh pipeline with canned (unscripted) deterministic mocks.
async fn run_once(query: &str) -> DeepResult {
    let model = Arc::new(ModelBackend::Mock(MockModel::new()));
    let search = Arc::new(SearchBackend::Mock(MockSearcher::new()));
    let store = Arc::new(StoreBackend::Memory(MemoryStore::new()));
    let bus = Arc::new(ProgressBus::new());

    let orchestrator = Orchestrator::new(
        Planner::new(model.clone(), "mock-ops"),
        Researcher::new(search.clone(), store.clone(), 5, 10),
        Evaluator::new(model.clone(), "mock-cortex"),
        Writer::new(model.clone(), store.clone(), "mock-cortex"),
        store,
        bus,
        Arc::new(NullSink),
    );

    orchestrator
        .run("t_det", query, &RunParams::default(), CancellationToken::new())
        .await
        .unwrap()
}

#[tokio::test]
async fn identical_inputs_produce_identical_results() {
    let first = run_once("deterministic research query").await;
    let second = run_once("deterministic research query").await;

    // Byte-identical report.
    assert_eq!(first.final_report, second.final_report);

    // Identical iteration summaries (timestamps and wall-clock aside).
    assert_eq!(first.iterations.len(), second.iterations.len());
    for (a, b) in first.iterations.iter().zip(second.iterations.iter()) {
        assert_eq!(a.number, b.number);
        assert_eq!(a.queries_executed, b.queries_executed);
        assert_eq!(a.completion.overall, b.completion.overall);
        assert_eq!(a.completion.level, b.completion.level);
        assert_eq!(a.gaps.len(), b.gaps.len());
        assert_eq!(a.refinements.len(), b.refinements.len());

        let ids_a: Vec<&str> = a.evidence_collected.iter().map(|e| e.id.as_str()).collect();
        let ids_b: Vec<&str> = b.evidence_collected.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids_a, ids_b);
    }

    // Identical final evidence identity and order.
    let ids_a: Vec<&str> = first.final_evidence.iter().map(|e| e.id.as_str()).collect();
    let ids_b: Vec<&str> = second.final_evidence.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids_a, ids_b);

    assert_eq!(first.quality_score, second.quality_score);
    assert_eq!(first.completion_level, second.completion_level);
}

#[tokio::test]
async fn different_queries_use_isolated_collections() {
    let first = run_once("query about alpha").await;
    let second = run_once("query about beta").await;

    // Same mock pipeline shape, different evidence identity.
    let ids_a: Vec<&str> = first.final_evidence.iter().map(|e| e.id.as_str()).collect();
    let ids_b: Vec<&str> = second.final_evidence.iter().map(|e| e.id.as_str()).collect();
    assert_ne!(ids_a, ids_b);
}
