//! The iterative research loop.
//!
//! One explicit state machine per run: planning → (researching → evaluating
//! → gap/refine)* → writing. The orchestrator owns no task state — it emits
//! progress and returns a result; lifecycle persistence stays with the task
//! manager.
//!
//! Failure semantics: planning errors are fatal. Researcher, evaluator, and
//! writer failures degrade (empty evidence, conservative score, minimal
//! report). Cancellation — external or the internal run deadline — aborts
//! with `Cancelled` and surfaces no partial report.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::error::ResearchError;
use crate::evaluation::{CompletionLevel, CompletionScore, InformationGap, RefinementQuery};
use crate::events::EventSink;
use crate::evidence::{self, Evidence};
use crate::evaluator::Evaluator;
use crate::plan::Plan;
use crate::planner::Planner;
use crate::progress::{EventKind, ProgressBus, ProgressEvent};
use crate::researcher::Researcher;
use crate::store::StoreBackend;
use crate::writer::Writer;

/// Default iteration budget.
pub const DEFAULT_MAX_ITERATIONS: u32 = 3;

/// Default convergence threshold.
pub const DEFAULT_MIN_SCORE: f64 = 0.75;

/// Default whole-run deadline for deep research.
pub const DEFAULT_RUN_DEADLINE: Duration = Duration::from_secs(600);

/// Tunables for one deep-research run.
#[derive(Debug, Clone)]
pub struct RunParams {
    /// Iteration budget, 1..=10.
    pub max_iterations: u32,
    /// Convergence threshold in [0, 1].
    pub min_score: f64,
    /// Opaque unit passed through for collaborators; not interpreted here.
    pub budget: i64,
    /// Whole-run deadline; raises internal cancellation when exceeded.
    pub deadline: Duration,
}

impl Default for RunParams {
    fn default() -> Self {
        Self {
            max_iterations: DEFAULT_MAX_ITERATIONS,
            min_score: DEFAULT_MIN_SCORE,
            budget: 100,
            deadline: DEFAULT_RUN_DEADLINE,
        }
    }
}

impl RunParams {
    /// Reject out-of-range parameters. The numeric score bound is the full
    /// [0, 1] interval: 0 ("stop after one pass") and 1 ("use the whole
    /// budget") are both meaningful.
    pub fn validate(&self) -> Result<(), ResearchError> {
        if !(1..=10).contains(&self.max_iterations) {
            return Err(ResearchError::InvalidRequest(format!(
                "max_iterations must be in 1..=10, got {}",
                self.max_iterations
            )));
        }
        if !(0.0..=1.0).contains(&self.min_score) {
            return Err(ResearchError::InvalidRequest(format!(
                "min_score must be in [0, 1], got {}",
                self.min_score
            )));
        }
        Ok(())
    }
}

/// One round of the loop: what ran, what it found, how it was judged.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Iteration {
    pub number: u32,
    pub queries_executed: Vec<String>,
    pub evidence_collected: Vec<Evidence>,
    pub completion: CompletionScore,
    pub gaps: Vec<InformationGap>,
    pub refinements: Vec<RefinementQuery>,
    pub timestamp: DateTime<Utc>,
}

/// Complete outcome of an iterative deep-research run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeepResult {
    pub original_query: String,
    pub iterations: Vec<Iteration>,
    pub final_evidence: Vec<Evidence>,
    pub final_report: String,
    pub completion_level: CompletionLevel,
    pub quality_score: f64,
    pub duration_seconds: f64,
}

/// Per-iteration digest of a result, shaped for API responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchSummary {
    pub query: String,
    pub iterations: usize,
    pub total_evidence: usize,
    pub quality_score: f64,
    pub completion_level: CompletionLevel,
    pub execution_time: f64,
    pub iteration_details: Vec<IterationDetail>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IterationDetail {
    pub iteration: u32,
    pub queries: usize,
    pub evidence: usize,
    pub score: f64,
    pub gaps_found: usize,
}

impl DeepResult {
    pub fn summary(&self) -> ResearchSummary {
        ResearchSummary {
            query: self.original_query.clone(),
            iterations: self.iterations.len(),
            total_evidence: self.final_evidence.len(),
            quality_score: self.quality_score,
            completion_level: self.completion_level,
            execution_time: self.duration_seconds,
            iteration_details: self
                .iterations
                .iter()
                .map(|it| IterationDetail {
                    iteration: it.number,
                    queries: it.queries_executed.len(),
                    evidence: it.evidence_collected.len(),
                    score: it.completion.overall,
                    gaps_found: it.gaps.len(),
                })
                .collect(),
        }
    }
}

pub struct Orchestrator {
    planner: Planner,
    researcher: Researcher,
    evaluator: Evaluator,
    writer: Writer,
    store: Arc<StoreBackend>,
    bus: Arc<ProgressBus>,
    sink: Arc<dyn EventSink>,
}

impl Orchestrator {
    pub fn new(
        planner: Planner,
        researcher: Researcher,
        evaluator: Evaluator,
        writer: Writer,
        store: Arc<StoreBackend>,
        bus: Arc<ProgressBus>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            planner,
            researcher,
            evaluator,
            writer,
            store,
            bus,
            sink,
        }
    }

    /// Run the full iterative loop for one task.
    pub async fn run(
        &self,
        task_id: &str,
        query: &str,
        params: &RunParams,
        cancel: CancellationToken,
    ) -> Result<DeepResult, ResearchError> {
        params.validate()?;
        let start = Instant::now();

        // The run observes a child token so the deadline watchdog can cancel
        // internally without touching the caller's token.
        let cancel = cancel.child_token();
        let watchdog = {
            let token = cancel.clone();
            let deadline = params.deadline;
            tokio::spawn(async move {
                tokio::time::sleep(deadline).await;
                tracing::warn!("run deadline exceeded, cancelling");
                token.cancel();
            })
        };

        let result = self.run_inner(task_id, query, params, &cancel, start).await;
        watchdog.abort();
        result
    }

    async fn run_inner(
        &self,
        task_id: &str,
        query: &str,
        params: &RunParams,
        cancel: &CancellationToken,
        start: Instant,
    ) -> Result<DeepResult, ResearchError> {
        self.emit(
            task_id,
            EventKind::Started,
            format!("Deep research started: {query}"),
            Some(serde_json::json!({
                "max_iterations": params.max_iterations,
                "min_score": params.min_score,
                "budget": params.budget,
            })),
        );

        // --- Planning (the one fatal phase) ---
        ensure_live(cancel, start)?;
        let plan = self
            .planner
            .plan(query)
            .instrument(tracing::info_span!("planning", task_id))
            .await?;
        self.emit(
            task_id,
            EventKind::Planning,
            format!("Plan created with {} sub-queries", plan.sub_queries.len()),
            Some(serde_json::json!({ "sub_queries": plan.sub_queries.len() })),
        );

        let collection = evidence::collection_for(query);
        let mut all_evidence: Vec<Evidence> = Vec::new();
        let mut iterations: Vec<Iteration> = Vec::new();
        let mut current_plan = plan;

        // --- Iteration loop ---
        for number in 1..=params.max_iterations {
            ensure_live(cancel, start)?;

            let queries_executed: Vec<String> = current_plan
                .sub_queries
                .iter()
                .map(|sq| sq.text.clone())
                .collect();
            self.emit(
                task_id,
                EventKind::IterationStarted,
                format!("Iteration {number} started"),
                Some(serde_json::json!({
                    "iteration": number,
                    "queries": queries_executed,
                })),
            );

            let iteration_evidence = self
                .researcher
                .execute(&current_plan, &collection, cancel)
                .instrument(tracing::info_span!("researching", task_id, iteration = number))
                .await;
            ensure_live(cancel, start)?;

            self.emit(
                task_id,
                EventKind::Evidence,
                format!("Collected {} new evidence items", iteration_evidence.len()),
                Some(serde_json::json!({
                    "iteration": number,
                    "count": iteration_evidence.len(),
                })),
            );

            evidence::merge_dedupe(&mut all_evidence, iteration_evidence.clone());

            let completion = self.evaluator.score(query, &all_evidence).await;
            ensure_live(cancel, start)?;
            self.emit(
                task_id,
                EventKind::Evaluation,
                format!(
                    "Completion {:.2} ({})",
                    completion.overall,
                    completion.level.as_str()
                ),
                Some(serde_json::json!({
                    "iteration": number,
                    "overall": completion.overall,
                    "level": completion.level.as_str(),
                })),
            );

            let mut iteration = Iteration {
                number,
                queries_executed,
                evidence_collected: iteration_evidence,
                completion,
                gaps: Vec::new(),
                refinements: Vec::new(),
                timestamp: Utc::now(),
            };

            // Convergence: threshold met or budget exhausted.
            let converged = iteration.completion.overall >= params.min_score
                || number == params.max_iterations;
            if converged {
                self.emit_iteration_completed(task_id, &iteration, all_evidence.len());
                iterations.push(iteration);
                break;
            }

            let gaps = self.evaluator.gaps(query, &all_evidence).await;
            ensure_live(cancel, start)?;
            self.emit(
                task_id,
                EventKind::GapAnalysis,
                format!("Identified {} information gaps", gaps.len()),
                Some(serde_json::json!({ "iteration": number, "count": gaps.len() })),
            );

            let refinements = self.evaluator.refine(&gaps, query).await;
            ensure_live(cancel, start)?;
            self.emit(
                task_id,
                EventKind::Refinement,
                format!("Generated {} refinement queries", refinements.len()),
                Some(serde_json::json!({ "iteration": number, "count": refinements.len() })),
            );

            iteration.gaps = gaps;
            iteration.refinements = refinements.clone();
            self.emit_iteration_completed(task_id, &iteration, all_evidence.len());
            iterations.push(iteration);

            // No refinements means no productive work remains.
            if refinements.is_empty() {
                break;
            }
            current_plan = Plan::from_refinements(query, number, &refinements);
        }

        // --- Finalisation ---
        ensure_live(cancel, start)?;
        self.emit(
            task_id,
            EventKind::ReportGeneration,
            "Generating final report",
            Some(serde_json::json!({ "evidence": all_evidence.len() })),
        );
        let final_report = self
            .writer
            .write(query, &all_evidence, &collection)
            .instrument(tracing::info_span!("writing", task_id))
            .await;
        ensure_live(cancel, start)?;

        let last = iterations.last().ok_or_else(|| {
            ResearchError::InvariantViolation("run completed with no iterations".to_string())
        })?;

        let result = DeepResult {
            original_query: query.to_string(),
            quality_score: last.completion.overall,
            completion_level: last.completion.level,
            iterations,
            final_evidence: all_evidence,
            final_report,
            duration_seconds: start.elapsed().as_secs_f64(),
        };

        tracing::info!(
            task_id,
            iterations = result.iterations.len(),
            evidence = result.final_evidence.len(),
            quality = result.quality_score,
            elapsed_s = result.duration_seconds,
            "deep research finished"
        );
        Ok(result)
    }

    /// Single-pass mode: plan → research → write, no iteration.
    pub async fn run_simple(
        &self,
        task_id: &str,
        query: &str,
        cancel: CancellationToken,
    ) -> Result<String, ResearchError> {
        let start = Instant::now();
        self.emit(
            task_id,
            EventKind::Started,
            format!("Research started: {query}"),
            None,
        );

        ensure_live(&cancel, start)?;
        let plan = self.planner.plan(query).await?;
        self.emit(
            task_id,
            EventKind::Planning,
            format!("Plan created with {} sub-queries", plan.sub_queries.len()),
            Some(serde_json::json!({ "sub_queries": plan.sub_queries.len() })),
        );

        let collection = evidence::collection_for(query);
        let evidence = self.researcher.execute(&plan, &collection, &cancel).await;
        ensure_live(&cancel, start)?;
        self.emit(
            task_id,
            EventKind::Evidence,
            format!("Collected {} evidence items", evidence.len()),
            Some(serde_json::json!({ "count": evidence.len() })),
        );

        self.emit(task_id, EventKind::ReportGeneration, "Generating report", None);
        let report = self.writer.write(query, &evidence, &collection).await;
        ensure_live(&cancel, start)?;
        Ok(report)
    }

    /// Drop a finished run's collection. Callers decide whether evidence
    /// should outlive the task.
    pub async fn discard_collection(&self, query: &str) {
        let collection = evidence::collection_for(query);
        if let Err(e) = self.store.drop_collection(&collection).await {
            tracing::warn!(collection, "failed to drop collection: {e}");
        }
    }

    fn emit_iteration_completed(&self, task_id: &str, iteration: &Iteration, total: usize) {
        self.emit(
            task_id,
            EventKind::IterationCompleted,
            format!("Iteration {} completed", iteration.number),
            Some(serde_json::json!({
                "iteration": iteration.number,
                "evidence_total": total,
                "overall": iteration.completion.overall,
            })),
        );
    }

    /// Publish to subscribers and the event log in one step.
    fn emit(
        &self,
        task_id: &str,
        kind: EventKind,
        message: impl Into<String>,
        data: Option<serde_json::Value>,
    ) {
        let mut event = ProgressEvent::new(task_id, kind, message);
        if let Some(data) = data {
            event = event.with_data(data);
        }
        self.bus.publish(&event);
        self.sink.emit(&event);
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator").finish()
    }
}

/// Cancellation is observed at every suspension point via this check.
fn ensure_live(cancel: &CancellationToken, start: Instant) -> Result<(), ResearchError> {
    if cancel.is_cancelled() {
        Err(ResearchError::Cancelled(start.elapsed().as_millis() as u64))
    } else {
        Ok(())
    }
}
