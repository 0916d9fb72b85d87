use std::sync::{Arc, Mutex};

use nebula_buffer::RecordBuffer;
use nebula_pipeline::{EngineError, TerminationType};

use super::EmitOutcome;
use crate::state::SinkState;

/// Collects every accepted buffer into a shared `Vec`, exposed via
/// [`TestSink::received_handle`], for test assertions.
pub struct TestSink {
    received: Arc<Mutex<Vec<RecordBuffer>>>,
    capacity: Option<usize>,
    state: SinkState,
}

impl TestSink {
    pub fn new() -> Self {
        Self {
            received: Arc::new(Mutex::new(Vec::new())),
            capacity: None,
            state: SinkState::Created,
        }
    }

    /// Once `received` holds `capacity` buffers, subsequent emits report
    /// `RetryLater` until the caller drains [`TestSink::received`].
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn received_handle(&self) -> Arc<Mutex<Vec<RecordBuffer>>> {
        self.received.clone()
    }

    pub fn received_count(&self) -> usize {
        self.received.lock().expect("test sink lock poisoned").len()
    }

    pub fn state(&self) -> SinkState {
        self.state
    }

    pub async fn open(&mut self) -> Result<(), EngineError> {
        self.state = SinkState::Running;
        Ok(())
    }

    pub async fn try_emit(&mut self, buffer: RecordBuffer) -> Result<EmitOutcome, EngineError> {
        let mut received = self.received.lock().expect("test sink lock poisoned");
        if let Some(capacity) = self.capacity {
            if received.len() >= capacity {
                return Ok(EmitOutcome::RetryLater);
            }
        }
        received.push(buffer);
        Ok(EmitOutcome::Accepted)
    }

    pub async fn close(&mut self, reason: TerminationType) -> Result<(), EngineError> {
        self.state = SinkState::Closed(reason);
        Ok(())
    }
}

impl Default for TestSink {
    fn default() -> Self {
        Self::new()
    }
}
