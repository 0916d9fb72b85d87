use crate::error::EngineError;
use crate::stage::{ConcurrencyMode, ExecutionContext, PipelineStage, StageInput, StageOutput};

/// Passes every data buffer through unmodified and forwards every marker.
/// Stateless, so any concurrency mode is safe; declares `Shared` since
/// there's no state to serialize access to.
#[derive(Default)]
pub struct IdentityStage;

impl PipelineStage for IdentityStage {
    fn concurrency_mode(&self) -> ConcurrencyMode {
        ConcurrencyMode::Shared
    }

    fn execute(
        &self,
        _ctx: &ExecutionContext<'_>,
        input: StageInput,
    ) -> Result<Vec<StageOutput>, EngineError> {
        Ok(match input {
            StageInput::Data(buf) => vec![StageOutput::Data(buf)],
            StageInput::Marker(marker) => vec![StageOutput::Marker(marker)],
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::{QueryId, StageId, TerminationType};
    use std::sync::atomic::AtomicBool;

    #[test]
    fn forwards_data_and_markers_unchanged() {
        let stage = IdentityStage;
        let abort = AtomicBool::new(false);
        let ctx = ExecutionContext::new(QueryId(1), StageId(1), &abort);

        let out = stage
            .execute(&ctx, StageInput::Marker(crate::types::ReconfigurationMarker::Drain(TerminationType::Graceful)))
            .unwrap();
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0], StageOutput::Marker(_)));
    }
}
