//! Task lifecycle: accept → run → complete/fail.
//!
//! All `TaskRecord` writes happen here — the orchestrator emits progress but
//! never touches task state, which keeps the status invariant enforceable in
//! one place. Records live in-process; with the `durable-store` feature and
//! a configured path, every transition is additionally upserted to DuckDB.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::ResearchError;
use crate::events::EventSink;
use crate::evidence::Evidence;
use crate::model::ModelBackend;
use crate::orchestrator::{DeepResult, Orchestrator, ResearchSummary, RunParams};
use crate::progress::{EventKind, ProgressBus, ProgressEvent};
use crate::search::SearchBackend;
use crate::store::StoreBackend;

/// How long a health snapshot stays cached.
const HEALTH_CACHE_TTL: Duration = Duration::from_secs(30);

/// Monotonic discriminator for task ids within one process.
static TASK_SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Simple,
    Deep,
}

impl TaskKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Simple => "simple",
            Self::Deep => "deep",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Accepted,
    Running,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// Result payload of a finished task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TaskOutcome {
    Simple { report: String },
    Deep(Box<DeepResult>),
}

impl TaskOutcome {
    pub fn report_md(&self) -> &str {
        match self {
            Self::Simple { report } => report,
            Self::Deep(result) => &result.final_report,
        }
    }
}

/// Persistent view of one task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub kind: TaskKind,
    pub status: TaskStatus,
    pub query: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub result: Option<TaskOutcome>,
    pub error: Option<String>,
}

impl TaskRecord {
    pub fn new(task_id: String, kind: TaskKind, query: String) -> Self {
        let now = Utc::now();
        Self {
            task_id,
            kind,
            status: TaskStatus::Accepted,
            query,
            created_at: now,
            updated_at: now,
            result: None,
            error: None,
        }
    }

    /// Apply a status transition. Only `accepted → running → (completed|failed)`
    /// is valid; anything else is an internal bug.
    pub fn transition(&mut self, next: TaskStatus) -> Result<(), ResearchError> {
        let valid = matches!(
            (self.status, next),
            (TaskStatus::Accepted, TaskStatus::Running)
                | (TaskStatus::Running, TaskStatus::Completed)
                | (TaskStatus::Running, TaskStatus::Failed)
        );
        if !valid {
            return Err(ResearchError::InvariantViolation(format!(
                "invalid status transition {} → {} for {}",
                self.status.as_str(),
                next.as_str(),
                self.task_id
            )));
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// API-shaped views
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct TaskStatusView {
    pub task_id: String,
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportView {
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_md: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sources_bib: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics_json: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeepReportView {
    pub status: TaskStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_md: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub research_summary: Option<ResearchSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality_metrics: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: String,
    pub version: String,
    pub providers: BTreeMap<String, bool>,
}

// ---------------------------------------------------------------------------
// Task manager
// ---------------------------------------------------------------------------

struct TaskEntry {
    record: TaskRecord,
    cancel: CancellationToken,
}

struct Inner {
    orchestrator: Arc<Orchestrator>,
    bus: Arc<ProgressBus>,
    sink: Arc<dyn EventSink>,
    model: Arc<ModelBackend>,
    search: Arc<SearchBackend>,
    store: Arc<StoreBackend>,
    tasks: Mutex<HashMap<String, TaskEntry>>,
    health_cache: Mutex<Option<(Instant, HealthSnapshot)>>,
    #[cfg(feature = "durable-store")]
    durable: Option<crate::store::durable::DurableStore>,
}

/// Accepts research requests, spawns orchestrator runs, and owns every
/// task record transition.
#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<Inner>,
}

impl TaskManager {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        bus: Arc<ProgressBus>,
        sink: Arc<dyn EventSink>,
        model: Arc<ModelBackend>,
        search: Arc<SearchBackend>,
        store: Arc<StoreBackend>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                orchestrator,
                bus,
                sink,
                model,
                search,
                store,
                tasks: Mutex::new(HashMap::new()),
                health_cache: Mutex::new(None),
                #[cfg(feature = "durable-store")]
                durable: None,
            }),
        }
    }

    /// Attach a durable store. Only effective before the manager is shared.
    #[cfg(feature = "durable-store")]
    pub fn with_durable(self, durable: crate::store::durable::DurableStore) -> Self {
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                inner.durable = Some(durable);
                Self {
                    inner: Arc::new(inner),
                }
            }
            Err(inner) => {
                tracing::warn!("durable store ignored: task manager already shared");
                Self { inner }
            }
        }
    }

    /// Validate and accept a research request, spawning the run. Returns
    /// the task id. Invalid requests never create a task.
    pub fn submit(
        &self,
        query: &str,
        kind: TaskKind,
        params: RunParams,
    ) -> Result<String, ResearchError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(ResearchError::InvalidRequest("query is empty".to_string()));
        }
        params.validate()?;

        let task_id = next_task_id();
        let record = TaskRecord::new(task_id.clone(), kind, query.to_string());
        let cancel = CancellationToken::new();

        {
            let mut tasks = self
                .inner
                .tasks
                .lock()
                .map_err(|_| ResearchError::InvariantViolation("task map poisoned".to_string()))?;
            tasks.insert(
                task_id.clone(),
                TaskEntry {
                    record: record.clone(),
                    cancel: cancel.clone(),
                },
            );
        }
        self.persist_task(&record);

        let inner = self.inner.clone();
        let query = query.to_string();
        let spawn_id = task_id.clone();
        tokio::spawn(async move {
            Self::drive(inner, spawn_id, query, kind, params, cancel).await;
        });

        tracing::info!(task_id, kind = kind.as_str(), "task accepted");
        Ok(task_id)
    }

    /// Run one task to completion, containing panics from the run itself.
    async fn drive(
        inner: Arc<Inner>,
        task_id: String,
        query: String,
        kind: TaskKind,
        params: RunParams,
        cancel: CancellationToken,
    ) {
        let manager = TaskManager { inner };
        if let Err(e) = manager.set_status(&task_id, TaskStatus::Running) {
            tracing::error!(task_id, "cannot start task: {e}");
            return;
        }

        let orchestrator = manager.inner.orchestrator.clone();
        let run_query = query.clone();
        let run_id = task_id.clone();
        let handle = tokio::spawn(async move {
            match kind {
                TaskKind::Deep => orchestrator
                    .run(&run_id, &run_query, &params, cancel)
                    .await
                    .map(|result| TaskOutcome::Deep(Box::new(result))),
                TaskKind::Simple => orchestrator
                    .run_simple(&run_id, &run_query, cancel)
                    .await
                    .map(|report| TaskOutcome::Simple { report }),
            }
        });

        let outcome = match handle.await {
            Ok(outcome) => outcome,
            Err(join_err) => Err(ResearchError::InvariantViolation(format!(
                "research task panicked: {join_err}"
            ))),
        };

        match outcome {
            Ok(result) => manager.complete(&task_id, result),
            Err(e) => manager.fail(&task_id, &e),
        }
    }

    fn complete(&self, task_id: &str, outcome: TaskOutcome) {
        let record = self.update_record(task_id, |record| {
            record.transition(TaskStatus::Completed)?;
            record.result = Some(outcome);
            Ok(())
        });

        let Some(record) = record else { return };
        self.persist_task(&record);
        self.persist_report(&record);
        self.emit_final(
            task_id,
            EventKind::Completed,
            "Research completed".to_string(),
        );
        tracing::info!(task_id, "task completed");
    }

    fn fail(&self, task_id: &str, error: &ResearchError) {
        let message = match error {
            ResearchError::Cancelled(_) => "cancelled".to_string(),
            other => other.user_message(),
        };

        let record = self.update_record(task_id, |record| {
            record.transition(TaskStatus::Failed)?;
            record.error = Some(message.clone());
            Ok(())
        });

        let Some(record) = record else { return };
        self.persist_task(&record);
        self.emit_final(task_id, EventKind::Failed, message.clone());
        tracing::warn!(task_id, "task failed: {message}");
    }

    fn set_status(&self, task_id: &str, next: TaskStatus) -> Result<(), ResearchError> {
        let record = self.update_record(task_id, |record| record.transition(next));
        match record {
            Some(record) => {
                self.persist_task(&record);
                Ok(())
            }
            None => Err(ResearchError::InvariantViolation(format!(
                "unknown task {task_id}"
            ))),
        }
    }

    /// Apply a mutation under the task lock, returning the updated record.
    /// Transition failures are logged and leave the record untouched.
    fn update_record(
        &self,
        task_id: &str,
        mutate: impl FnOnce(&mut TaskRecord) -> Result<(), ResearchError>,
    ) -> Option<TaskRecord> {
        let mut tasks = self.inner.tasks.lock().ok()?;
        let entry = tasks.get_mut(task_id)?;
        match mutate(&mut entry.record) {
            Ok(()) => Some(entry.record.clone()),
            Err(e) => {
                tracing::error!(task_id, "record update rejected: {e}");
                None
            }
        }
    }

    fn emit_final(&self, task_id: &str, kind: EventKind, message: String) {
        // Result is persisted before subscribers hear about it.
        let event = ProgressEvent::new(task_id, kind, message);
        self.inner.bus.publish(&event);
        self.inner.sink.emit(&event);
        self.inner.bus.close_topic(task_id);
    }

    // -- queries ----------------------------------------------------------

    pub fn status(&self, task_id: &str) -> Option<TaskStatusView> {
        let tasks = self.inner.tasks.lock().ok()?;
        let record = &tasks.get(task_id)?.record;
        Some(TaskStatusView {
            task_id: record.task_id.clone(),
            status: record.status,
            details: record.error.clone(),
        })
    }

    pub fn report(&self, task_id: &str) -> Option<ReportView> {
        let tasks = self.inner.tasks.lock().ok()?;
        let record = &tasks.get(task_id)?.record;

        let mut view = ReportView {
            status: record.status,
            report_md: None,
            sources_bib: None,
            metrics_json: None,
        };
        if let Some(outcome) = &record.result {
            view.report_md = Some(outcome.report_md().to_string());
            if let TaskOutcome::Deep(result) = outcome {
                view.sources_bib = Some(sources_bibliography(&result.final_evidence));
                view.metrics_json = serde_json::to_string(&serde_json::json!({
                    "iterations": result.iterations.len(),
                    "total_evidence": result.final_evidence.len(),
                    "quality_score": result.quality_score,
                    "duration_seconds": result.duration_seconds,
                }))
                .ok();
            }
        }
        Some(view)
    }

    pub fn deep_report(&self, task_id: &str) -> Option<DeepReportView> {
        let tasks = self.inner.tasks.lock().ok()?;
        let record = &tasks.get(task_id)?.record;

        let mut view = DeepReportView {
            status: record.status,
            report_md: None,
            research_summary: None,
            quality_metrics: None,
        };
        if let Some(TaskOutcome::Deep(result)) = &record.result {
            view.report_md = Some(result.final_report.clone());
            view.research_summary = Some(result.summary());
            view.quality_metrics = Some(serde_json::json!({
                "quality_score": result.quality_score,
                "completion_level": result.completion_level.as_str(),
                "iterations": result.iterations.len(),
            }));
        }
        Some(view)
    }

    /// Per-iteration summary for a completed deep task.
    pub fn summary(&self, task_id: &str) -> Option<ResearchSummary> {
        let tasks = self.inner.tasks.lock().ok()?;
        match &tasks.get(task_id)?.record.result {
            Some(TaskOutcome::Deep(result)) => Some(result.summary()),
            _ => None,
        }
    }

    /// Signal cancellation. The run observes it at its next suspension
    /// point and the task ends `failed` with error `cancelled`.
    pub fn cancel(&self, task_id: &str) -> bool {
        let Ok(tasks) = self.inner.tasks.lock() else {
            return false;
        };
        match tasks.get(task_id) {
            Some(entry)
                if matches!(
                    entry.record.status,
                    TaskStatus::Accepted | TaskStatus::Running
                ) =>
            {
                entry.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Provider availability snapshot, cached for 30 seconds.
    pub async fn health(&self) -> HealthSnapshot {
        if let Ok(cache) = self.inner.health_cache.lock()
            && let Some((at, snapshot)) = cache.as_ref()
            && at.elapsed() < HEALTH_CACHE_TTL
        {
            return snapshot.clone();
        }

        let model_ok = self.inner.model.health().await;
        let search_ok = self.inner.search.health().await;
        let store_ok = self.inner.store.health().await;

        let mut providers = BTreeMap::new();
        providers.insert(format!("model:{}", self.inner.model.name()), model_ok);
        providers.insert(format!("search:{}", self.inner.search.name()), search_ok);
        providers.insert(format!("store:{}", self.inner.store.name()), store_ok);

        let snapshot = HealthSnapshot {
            status: if model_ok && search_ok {
                "healthy".to_string()
            } else {
                "degraded".to_string()
            },
            version: env!("CARGO_PKG_VERSION").to_string(),
            providers,
        };

        if let Ok(mut cache) = self.inner.health_cache.lock() {
            *cache = Some((Instant::now(), snapshot.clone()));
        }
        snapshot
    }

    // -- persistence ------------------------------------------------------

    #[cfg(feature = "durable-store")]
    fn persist_task(&self, record: &TaskRecord) {
        if let Some(durable) = &self.inner.durable {
            durable.upsert_task(crate::store::durable::TaskRow {
                task_id: record.task_id.clone(),
                kind: record.kind.as_str().to_string(),
                status: record.status.as_str().to_string(),
                query: record.query.clone(),
                created_at: record.created_at.to_rfc3339(),
                updated_at: record.updated_at.to_rfc3339(),
                error: record.error.clone(),
            });
        }
    }

    #[cfg(not(feature = "durable-store"))]
    fn persist_task(&self, _record: &TaskRecord) {}

    #[cfg(feature = "durable-store")]
    fn persist_report(&self, record: &TaskRecord) {
        let (Some(durable), Some(outcome)) = (&self.inner.durable, &record.result) else {
            return;
        };
        let summary_json = match outcome {
            TaskOutcome::Deep(result) => {
                serde_json::to_string(&result.summary()).unwrap_or_default()
            }
            TaskOutcome::Simple { .. } => "{}".to_string(),
        };
        durable.upsert_report(crate::store::durable::ReportRow {
            task_id: record.task_id.clone(),
            report_md: outcome.report_md().to_string(),
            summary_json,
            updated_at: record.updated_at.to_rfc3339(),
        });
    }

    #[cfg(not(feature = "durable-store"))]
    fn persist_report(&self, _record: &TaskRecord) {}
}

impl std::fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.inner.tasks.lock().map(|t| t.len()).unwrap_or(0);
        f.debug_struct("TaskManager")
            .field("tasks", &count)
            .finish()
    }
}

/// `task_<epoch_ms>_<pid>_<seq>`: unique across concurrent submits and
/// concurrent processes sharing a durable store.
fn next_task_id() -> String {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let pid = std::process::id();
    let seq = TASK_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("task_{ts}_{pid}_{seq}")
}

/// Bibliography of unique source URLs, in evidence order.
fn sources_bibliography(evidence: &[Evidence]) -> String {
    let mut seen = std::collections::HashSet::new();
    let mut lines = Vec::new();
    for ev in evidence {
        if seen.insert(ev.source.url.clone()) {
            lines.push(format!("- {} — {}", ev.source.title, ev.source.url));
        }
    }
    lines.join("\n")
}
