use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;

use crate::reconcile_engine::{MessageEvent, ReconcileAction, ReconcileError, ReconciliationEngine};

/// Bounded record of recently accepted Events API delivery ids.
pub struct ProcessedEventWindow {
    cap: usize,
    order: VecDeque<String>,
    index: HashSet<String>,
}

impl ProcessedEventWindow {
    pub fn new(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            order: VecDeque::new(),
            index: HashSet::new(),
        }
    }

    pub fn contains(&self, event_id: &str) -> bool {
        self.index.contains(event_id)
    }

    /// Records `event_id`. Returns false when it was already present.
    pub fn mark_processed(&mut self, event_id: &str) -> bool {
        if self.index.contains(event_id) {
            return false;
        }
        self.order.push_back(event_id.to_string());
        self.index.insert(event_id.to_string());
        while self.order.len() > self.cap {
            if let Some(evicted) = self.order.pop_front() {
                self.index.remove(&evicted);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}

pub type ReconcileTask = JoinHandle<Result<ReconcileAction, ReconcileError>>;

#[derive(Debug)]
pub enum DispatchOutcome {
    Spawned(ReconcileTask),
    Duplicate,
}

/// Hands message events to the engine on background tasks, once per delivery id.
pub struct EventDispatcher {
    engine: Arc<ReconciliationEngine>,
    processed: Mutex<ProcessedEventWindow>,
}

impl EventDispatcher {
    pub fn new(engine: Arc<ReconciliationEngine>, processed_event_cap: usize) -> Self {
        Self {
            engine,
            processed: Mutex::new(ProcessedEventWindow::new(processed_event_cap)),
        }
    }

    pub fn engine(&self) -> &Arc<ReconciliationEngine> {
        &self.engine
    }

    /// Spawns reconciliation for `event` unless its delivery id was already seen.
    ///
    /// Events without a delivery id are always dispatched.
    pub fn dispatch(&self, event: MessageEvent) -> DispatchOutcome {
        if let Some(event_id) = event.event_id.as_deref() {
            let mut processed = self
                .processed
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if !processed.mark_processed(event_id) {
                tracing::debug!(
                    event_id,
                    team_id = %event.key.team_id,
                    "skipping re-delivered slack event"
                );
                return DispatchOutcome::Duplicate;
            }
        }

        let engine = Arc::clone(&self.engine);
        DispatchOutcome::Spawned(tokio::spawn(async move {
            engine.reconcile(&event).await
        }))
    }
}
