//! Iterative deep-research orchestrator.
//!
//! Given a natural-language query, drives a closed loop: decompose into
//! parallel sub-queries, search for evidence, store and deduplicate it in a
//! semantic index, score coverage against the original intent, synthesise
//! refinement queries for the gaps, and repeat until a quality threshold is
//! met or the iteration budget runs out — then write a cited report.
//!
//! Backends (model provider, search provider, evidence store) are selected
//! once at init and mocked offline; the orchestration core never branches
//! on concrete providers.

pub mod config;
pub mod error;
pub mod evaluation;
pub mod evaluator;
pub mod events;
pub mod evidence;
pub mod guard;
pub mod model;
pub mod orchestrator;
pub mod plan;
pub mod planner;
pub mod progress;
pub mod researcher;
pub mod search;
pub mod store;
pub mod tasks;
pub mod writer;

use std::sync::Arc;

use crate::events::EventSink;
use crate::model::ModelBackend;
use crate::orchestrator::Orchestrator;
use crate::progress::ProgressBus;
use crate::search::SearchBackend;
use crate::store::StoreBackend;
use crate::tasks::TaskManager;

/// Wire the full pipeline from pre-selected backends. Used by the binary
/// and by tests that inject scripted mocks.
pub fn build_task_manager(
    config: &config::Config,
    model: Arc<ModelBackend>,
    search: Arc<SearchBackend>,
    store: Arc<StoreBackend>,
    bus: Arc<ProgressBus>,
    sink: Arc<dyn EventSink>,
) -> TaskManager {
    let planner = planner::Planner::new(model.clone(), &config.tiers.planner);
    let researcher = researcher::Researcher::new(
        search.clone(),
        store.clone(),
        config.workers,
        config.max_results,
    );
    let evaluator = evaluator::Evaluator::new(model.clone(), &config.tiers.analyst);
    let writer = writer::Writer::new(model.clone(), store.clone(), &config.tiers.writer);

    let orchestrator = Arc::new(Orchestrator::new(
        planner,
        researcher,
        evaluator,
        writer,
        store.clone(),
        bus.clone(),
        sink.clone(),
    ));

    TaskManager::new(orchestrator, bus, sink, model, search, store)
}
