use std::collections::VecDeque;
use std::time::Duration;

use nebula_buffer::RecordBuffer;
use nebula_pipeline::{EngineError, TerminationType};

use crate::state::SourceState;

/// In-memory fixture source replaying a fixed sequence of buffers.
/// Supports an optional per-buffer delay and fault injection after a
/// configured number of emissions.
pub struct TestSource {
    buffers: VecDeque<RecordBuffer>,
    delay: Option<Duration>,
    fail_after: Option<usize>,
    emitted: usize,
    state: SourceState,
}

impl TestSource {
    pub fn new(buffers: Vec<RecordBuffer>) -> Self {
        Self {
            buffers: buffers.into(),
            delay: None,
            fail_after: None,
            emitted: 0,
            state: SourceState::Created,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn fail_after(mut self, count: usize) -> Self {
        self.fail_after = Some(count);
        self
    }

    pub fn state(&self) -> SourceState {
        self.state
    }

    pub async fn open(&mut self) -> Result<(), EngineError> {
        self.state = SourceState::Running;
        Ok(())
    }

    pub async fn poll_next(&mut self) -> Result<Option<RecordBuffer>, EngineError> {
        if self.state != SourceState::Running && self.state != SourceState::Draining {
            return Ok(None);
        }
        if let Some(limit) = self.fail_after {
            if self.emitted >= limit {
                self.state = SourceState::Closed(TerminationType::Failure);
                return Err(EngineError::SourceFailure("injected test failure".into()));
            }
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match self.buffers.pop_front() {
            Some(buf) => {
                self.emitted += 1;
                Ok(Some(buf))
            }
            None => {
                self.state = SourceState::Draining;
                Ok(None)
            }
        }
    }

    pub async fn close(&mut self, reason: TerminationType) -> Result<(), EngineError> {
        self.state = SourceState::Closed(reason);
        Ok(())
    }
}
