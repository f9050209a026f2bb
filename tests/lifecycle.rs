//! Task lifecycle: acceptance, status monotonicity, cancellation, views.

use std::sync::Arc;
use std::time::Duration;

use aletheia::config::{Config, VectorBackend};
use aletheia::error::ResearchError;
use aletheia::events::NullSink;
use aletheia::model::mock::{MockModel, PromptKind};
use aletheia::model::{ModelBackend, ModelTiers};
use aletheia::orchestrator::RunParams;
use aletheia::progress::{EventKind, ProgressBus};
use aletheia::search::mock::MockSearcher;
use aletheia::search::SearchBackend;
use aletheia::store::{MemoryStore, StoreBackend};
use aletheia::tasks::{TaskKind, TaskManager, TaskStatus};

fn test_config() -> Config {
    Config {
        saptiva_api_key: None,
        saptiva_base_url: "http://localhost".to_string(),
        connect_timeout: Duration::from_secs(1),
        read_timeout: Duration::from_secs(5),
        tiers: ModelTiers::default(),
        tavily_api_key: None,
        vector_backend: VectorBackend::None,
        weaviate_host: String::new(),
        artifacts_dir: None,
        db_path: None,
        workers: 5,
        max_results: 10,
    }
}

struct Harness {
    manager: TaskManager,
    bus: Arc<ProgressBus>,
}

fn harness(model: MockModel, search: MockSearcher) -> Harness {
    let model = Arc::new(ModelBackend::Mock(model));
    let search = Arc::new(SearchBackend::Mock(search));
    let store = Arc::new(StoreBackend::Memory(MemoryStore::new()));
    let bus = Arc::new(ProgressBus::new());
    let manager = aletheia::build_task_manager(
        &test_config(),
        model,
        search,
        store,
        bus.clone(),
        Arc::new(NullSink),
    );
    Harness { manager, bus }
}

async fn wait_terminal(manager: &TaskManager, task_id: &str) -> TaskStatus {
    for _ in 0..500 {
        if let Some(view) = manager.status(task_id)
            && matches!(view.status, TaskStatus::Completed | TaskStatus::Failed)
        {
            return view.status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {task_id} did not reach a terminal status");
}

#[tokio::test]
async fn invalid_requests_never_create_tasks() {
    let h = harness(MockModel::new(), MockSearcher::new());

    let err = h
        .manager
        .submit("   ", TaskKind::Deep, RunParams::default())
        .unwrap_err();
    assert!(matches!(err, ResearchError::InvalidRequest(_)));

    let bad = RunParams {
        max_iterations: 11,
        ..RunParams::default()
    };
    let err = h.manager.submit("q", TaskKind::Deep, bad).unwrap_err();
    assert!(matches!(err, ResearchError::InvalidRequest(_)));
}

#[tokio::test]
async fn deep_task_completes_with_views() {
    let h = harness(MockModel::new(), MockSearcher::new());
    let task_id = h
        .manager
        .submit("digital banking in mexico", TaskKind::Deep, RunParams::default())
        .unwrap();

    let status = wait_terminal(&h.manager, &task_id).await;
    assert_eq!(status, TaskStatus::Completed);

    let report = h.manager.report(&task_id).unwrap();
    assert_eq!(report.status, TaskStatus::Completed);
    assert!(report.report_md.is_some());
    assert!(report.sources_bib.is_some());
    let metrics: serde_json::Value =
        serde_json::from_str(&report.metrics_json.unwrap()).unwrap();
    assert!(metrics["iterations"].as_u64().unwrap() >= 1);
    assert!(metrics["total_evidence"].as_u64().unwrap() > 0);

    let deep = h.manager.deep_report(&task_id).unwrap();
    let summary = deep.research_summary.unwrap();
    assert_eq!(summary.query, "digital banking in mexico");
    assert_eq!(summary.iterations, summary.iteration_details.len());
    assert!(deep.quality_metrics.is_some());
}

#[tokio::test]
async fn simple_task_produces_report_without_deep_views() {
    let h = harness(MockModel::new(), MockSearcher::new());
    let task_id = h
        .manager
        .submit("quick question", TaskKind::Simple, RunParams::default())
        .unwrap();

    let status = wait_terminal(&h.manager, &task_id).await;
    assert_eq!(status, TaskStatus::Completed);

    let report = h.manager.report(&task_id).unwrap();
    assert!(report.report_md.is_some());
    assert!(report.sources_bib.is_none());

    let deep = h.manager.deep_report(&task_id).unwrap();
    assert!(deep.report_md.is_none());
    assert!(deep.research_summary.is_none());
}

#[tokio::test]
async fn status_transitions_are_monotone() {
    let h = harness(MockModel::new(), MockSearcher::new());
    let task_id = h
        .manager
        .submit("watched task", TaskKind::Deep, RunParams::default())
        .unwrap();

    // Sample the observable status until terminal; dedupe consecutive.
    let mut observed: Vec<TaskStatus> = Vec::new();
    for _ in 0..500 {
        if let Some(view) = h.manager.status(&task_id) {
            if observed.last() != Some(&view.status) {
                observed.push(view.status);
            }
            if matches!(view.status, TaskStatus::Completed | TaskStatus::Failed) {
                break;
            }
        }
        tokio::task::yield_now().await;
    }

    let rank = |s: &TaskStatus| match s {
        TaskStatus::Accepted => 0,
        TaskStatus::Running => 1,
        TaskStatus::Completed | TaskStatus::Failed => 2,
    };
    for pair in observed.windows(2) {
        assert!(
            rank(&pair[0]) < rank(&pair[1]),
            "status went backwards: {observed:?}"
        );
    }
    assert!(matches!(
        observed.last(),
        Some(TaskStatus::Completed | TaskStatus::Failed)
    ));
}

#[tokio::test]
async fn cancellation_mid_research_fails_without_report() {
    let model = MockModel::new();
    model.script(
        PromptKind::Plan,
        r#"[{"id": "sq_a", "query": "alpha angle", "sources": ["web"]}]"#,
    );
    // Iteration 1 scores low and produces refinements, forcing iteration 2.
    model.script(
        PromptKind::Score,
        r#"{"overall_score": 0.3, "completion_level": "insufficient",
            "coverage_areas": {}, "confidence": 0.8, "reasoning": "thin"}"#,
    );
    model.script(
        PromptKind::Gaps,
        r#"[{"gap_type": "missing_depth", "description": "d", "priority": 4,
             "suggested_query": "more depth"}]"#,
    );
    model.script(
        PromptKind::Refine,
        r#"[{"query": "deeper angle", "gap_addressed": "missing_depth",
             "priority": 4, "expected_sources": ["web"]}]"#,
    );

    // Slow searches give the cancel signal a window inside iteration 2.
    let search = MockSearcher::new().with_delay(Duration::from_millis(100));

    let h = harness(model, search);
    let manager = h.manager.clone();
    let bus = h.bus.clone();

    let task_id = manager
        .submit("cancelled research", TaskKind::Deep, RunParams::default())
        .unwrap();
    // The 100ms search delay leaves ample time to subscribe before
    // iteration 2 begins.
    let mut progress = bus.subscribe(&task_id);

    let cancel_manager = manager.clone();
    let cancel_id = task_id.clone();
    let watcher = tokio::spawn(async move {
        while let Some(event) = progress.recv().await {
            if event.event_type == EventKind::IterationStarted
                && event.data.as_ref().and_then(|d| d["iteration"].as_u64()) == Some(2)
            {
                assert!(cancel_manager.cancel(&cancel_id));
                break;
            }
        }
    });

    let status = wait_terminal(&manager, &task_id).await;
    watcher.await.unwrap();

    assert_eq!(status, TaskStatus::Failed);
    let view = h.manager.status(&task_id).unwrap();
    assert_eq!(view.details.as_deref(), Some("cancelled"));

    // Partial evidence is not surfaced as a report.
    let report = h.manager.report(&task_id).unwrap();
    assert!(report.report_md.is_none());
}

#[tokio::test]
async fn cancel_is_rejected_for_finished_or_unknown_tasks() {
    let h = harness(MockModel::new(), MockSearcher::new());
    assert!(!h.manager.cancel("task_does_not_exist"));

    let task_id = h
        .manager
        .submit("short task", TaskKind::Deep, RunParams::default())
        .unwrap();
    wait_terminal(&h.manager, &task_id).await;
    assert!(!h.manager.cancel(&task_id));
}

#[tokio::test]
async fn health_snapshot_reports_mock_providers() {
    let h = harness(MockModel::new(), MockSearcher::new());
    let health = h.manager.health().await;

    assert_eq!(health.status, "healthy");
    assert!(!health.version.is_empty());
    assert_eq!(health.providers.len(), 3);
    assert!(health.providers.values().all(|ok| *ok));
}
