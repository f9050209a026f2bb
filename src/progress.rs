//! Per-task progress pub/sub.
//!
//! Topic-per-task so subscribers never see cross-task traffic. Publishing is
//! non-blocking: each subscriber has a bounded buffer, and a subscriber whose
//! buffer is full is dropped rather than stalling the run. Delivery is
//! best-effort with per-subscriber ordering; late subscribers see only
//! events emitted after they joined — no replay.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Buffered events per subscriber before the drop-slow-consumer policy fires.
pub const SUBSCRIBER_BUFFER: usize = 64;

/// Phase transitions and milestones of a research run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Started,
    Planning,
    IterationStarted,
    IterationCompleted,
    Evidence,
    Evaluation,
    GapAnalysis,
    Refinement,
    ReportGeneration,
    Completed,
    Failed,
}

impl EventKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Planning => "planning",
            Self::IterationStarted => "iteration_started",
            Self::IterationCompleted => "iteration_completed",
            Self::Evidence => "evidence",
            Self::Evaluation => "evaluation",
            Self::GapAnalysis => "gap_analysis",
            Self::Refinement => "refinement",
            Self::ReportGeneration => "report_generation",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// One progress frame. Serialises to the wire shape WS clients consume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub task_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: EventKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ProgressEvent {
    pub fn new(task_id: impl Into<String>, event_type: EventKind, message: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            timestamp: Utc::now(),
            event_type,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<ProgressEvent>,
}

/// Receiving end of a subscription. Dropping it unsubscribes lazily — the
/// bus prunes closed channels on the next publish.
pub type ProgressReceiver = mpsc::Receiver<ProgressEvent>;

/// Per-task progress fan-out.
#[derive(Default)]
pub struct ProgressBus {
    topics: Mutex<HashMap<String, Vec<Subscriber>>>,
    next_id: AtomicU64,
}

impl ProgressBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber for one task's events.
    pub fn subscribe(&self, task_id: &str) -> ProgressReceiver {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut topics) = self.topics.lock() {
            topics
                .entry(task_id.to_string())
                .or_default()
                .push(Subscriber { id, tx });
        }
        rx
    }

    /// Publish to every live subscriber of the event's task. Non-blocking:
    /// full buffers drop the subscriber, closed receivers are pruned.
    pub fn publish(&self, event: &ProgressEvent) {
        let Ok(mut topics) = self.topics.lock() else {
            return;
        };
        let Some(subscribers) = topics.get_mut(&event.task_id) else {
            return;
        };

        subscribers.retain(|sub| match sub.tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(
                    task_id = event.task_id,
                    subscriber = sub.id,
                    "dropping slow progress subscriber"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });

        if subscribers.is_empty() {
            topics.remove(&event.task_id);
        }
    }

    /// Live subscriber count for a task, for tests and diagnostics.
    pub fn subscriber_count(&self, task_id: &str) -> usize {
        self.topics
            .lock()
            .ok()
            .and_then(|topics| topics.get(task_id).map(|subs| subs.len()))
            .unwrap_or(0)
    }

    /// Drop all subscribers of a finished task.
    pub fn close_topic(&self, task_id: &str) {
        if let Ok(mut topics) = self.topics.lock() {
            topics.remove(task_id);
        }
    }
}

impl std::fmt::Debug for ProgressBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.topics.lock().map(|t| t.len()).unwrap_or(0);
        f.debug_struct("ProgressBus")
            .field("topics", &count)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(task_id: &str, n: usize) -> ProgressEvent {
        ProgressEvent::new(task_id, EventKind::Evidence, format!("event {n}"))
    }

    #[tokio::test]
    async fn subscriber_receives_in_emission_order() {
        let bus = ProgressBus::new();
        let mut rx = bus.subscribe("t1");

        for i in 0..5 {
            bus.publish(&event("t1", i));
        }

        for i in 0..5 {
            let ev = rx.recv().await.unwrap();
            assert_eq!(ev.message, format!("event {i}"));
        }
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let bus = ProgressBus::new();
        let mut rx_a = bus.subscribe("a");
        let _rx_b = bus.subscribe("b");

        bus.publish(&event("b", 0));
        bus.publish(&event("a", 1));

        let ev = rx_a.recv().await.unwrap();
        assert_eq!(ev.task_id, "a");
        assert!(rx_a.try_recv().is_err(), "no cross-task traffic");
    }

    #[tokio::test]
    async fn slow_subscriber_is_dropped_without_blocking() {
        let bus = ProgressBus::new();
        let _rx = bus.subscribe("t1"); // never read
        assert_eq!(bus.subscriber_count("t1"), 1);

        // Fill the buffer, then one more to trigger the drop.
        for i in 0..=SUBSCRIBER_BUFFER {
            bus.publish(&event("t1", i));
        }
        assert_eq!(bus.subscriber_count("t1"), 0);
    }

    #[tokio::test]
    async fn late_subscriber_sees_no_history() {
        let bus = ProgressBus::new();
        bus.publish(&event("t1", 0)); // nobody listening

        let mut rx = bus.subscribe("t1");
        bus.publish(&event("t1", 1));
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.message, "event 1");
    }

    #[test]
    fn frame_serialises_snake_case_without_null_data() {
        let ev = ProgressEvent::new("t1", EventKind::GapAnalysis, "gaps");
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["event_type"], "gap_analysis");
        assert!(json.get("data").is_none());
        assert!(json["timestamp"].as_str().unwrap().contains('T'));
    }
}
