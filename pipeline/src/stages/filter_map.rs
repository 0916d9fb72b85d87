use std::sync::Arc;

use nebula_buffer::RecordBuffer;

use crate::error::EngineError;
use crate::stage::{ConcurrencyMode, ExecutionContext, PipelineStage, StageInput, StageOutput};

/// A stateless stage driven by a user-supplied closure operating on whole
/// buffers: compiled operator code is opaque to the engine, so this stands
/// in for "whatever the query compiler produced" in tests and examples.
/// Returning `None` drops the buffer.
pub struct FilterMapStage {
    transform: Arc<dyn Fn(RecordBuffer) -> Option<RecordBuffer> + Send + Sync>,
}

impl FilterMapStage {
    pub fn new(transform: impl Fn(RecordBuffer) -> Option<RecordBuffer> + Send + Sync + 'static) -> Self {
        Self {
            transform: Arc::new(transform),
        }
    }
}

impl PipelineStage for FilterMapStage {
    fn concurrency_mode(&self) -> ConcurrencyMode {
        ConcurrencyMode::Shared
    }

    fn execute(
        &self,
        _ctx: &ExecutionContext<'_>,
        input: StageInput,
    ) -> Result<Vec<StageOutput>, EngineError> {
        Ok(match input {
            StageInput::Data(buf) => (self.transform)(buf).map(StageOutput::Data).into_iter().collect(),
            StageInput::Marker(marker) => vec![StageOutput::Marker(marker)],
        })
    }
}
