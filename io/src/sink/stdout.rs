use nebula_buffer::RecordBuffer;
use nebula_pipeline::{EngineError, TerminationType};

use super::EmitOutcome;
use crate::state::SinkState;

/// Prints a one-line summary of each buffer. Useful for manual inspection
/// and examples; never backpressures.
pub struct StdoutSink {
    state: SinkState,
}

impl Default for StdoutSink {
    fn default() -> Self {
        Self {
            state: SinkState::Created,
        }
    }
}

impl StdoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SinkState {
        self.state
    }

    pub async fn open(&mut self) -> Result<(), EngineError> {
        self.state = SinkState::Running;
        Ok(())
    }

    pub async fn try_emit(&mut self, buffer: RecordBuffer) -> Result<EmitOutcome, EngineError> {
        println!(
            "buffer seq={} tuples={} watermark={}",
            buffer.sequence_number(),
            buffer.num_tuples(),
            buffer.watermark()
        );
        Ok(EmitOutcome::Accepted)
    }

    pub async fn close(&mut self, reason: TerminationType) -> Result<(), EngineError> {
        self.state = SinkState::Closed(reason);
        Ok(())
    }
}
