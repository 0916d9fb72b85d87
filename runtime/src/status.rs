use std::sync::{Arc, Mutex};

use nebula_pipeline::QueryId;

/// Lifecycle state of one IQP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryStatus {
    Registered,
    Running,
    /// EoS injected, draining in progress; not yet externally visible as a
    /// distinct status event, but tracked so `stop`/`fail` are idempotent.
    Failing,
    Stopped,
    Failed(String),
}

/// One lifecycle transition, delivered to a [`StatusListener`] in strict
/// per-query order: `Registered < Running < (Stopped | Failed)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryEvent {
    Registered,
    Running,
    Stopped,
    Failed(String),
}

/// External observer of per-query lifecycle events. Invocations are
/// serialized per `query_id`; events for different queries may interleave.
pub trait StatusListener: Send + Sync {
    fn on_event(&self, query_id: QueryId, event: QueryEvent);
}

/// A [`StatusListener`] that records every event it sees, in order, for
/// test assertions.
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<(QueryId, QueryEvent)>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events_for(&self, query_id: QueryId) -> Vec<QueryEvent> {
        self.events
            .lock()
            .expect("listener lock poisoned")
            .iter()
            .filter(|(id, _)| *id == query_id)
            .map(|(_, e)| e.clone())
            .collect()
    }
}

impl StatusListener for RecordingListener {
    fn on_event(&self, query_id: QueryId, event: QueryEvent) {
        tracing::info!(query_id = query_id.0, ?event, "query status event");
        self.events.lock().expect("listener lock poisoned").push((query_id, event));
    }
}
