use std::sync::{Arc, Mutex};

use nebula_buffer::BufferPool;

use crate::error::EngineError;
use crate::stage::{ConcurrencyMode, ExecutionContext, PipelineStage, StageInput, StageOutput};
use crate::types::{ReconfigurationMarker, TerminationType};

struct WindowState {
    current_window_start: u64,
    accumulated_tuples: u64,
}

/// A stateful, single-threaded tumbling window over the watermark field:
/// buffers are bucketed by `watermark / window_size`, and crossing into a
/// new bucket closes the previous one, emitting a single summary buffer
/// carrying the closed window's tuple count. On graceful drain the final
/// (possibly partial) window is closed too; on hard or failed drain its
/// accumulated state is discarded.
pub struct TumblingWindowStage {
    window_size: u64,
    pool: Arc<BufferPool>,
    state: Mutex<WindowState>,
}

impl TumblingWindowStage {
    pub fn new(window_size: u64, pool: Arc<BufferPool>) -> Self {
        Self {
            window_size,
            pool,
            state: Mutex::new(WindowState {
                current_window_start: 0,
                accumulated_tuples: 0,
            }),
        }
    }

    fn close_current_window(&self, state: &mut WindowState) -> Result<Option<StageOutput>, EngineError> {
        if state.accumulated_tuples == 0 {
            return Ok(None);
        }
        let out = self
            .pool
            .acquire()
            .map_err(|e| EngineError::StageFailure(e.to_string()))?;
        out.set_num_tuples(state.accumulated_tuples);
        out.set_watermark(state.current_window_start);
        tracing::debug!(
            window_start = state.current_window_start,
            tuples = state.accumulated_tuples,
            "closing tumbling window"
        );
        state.accumulated_tuples = 0;
        Ok(Some(StageOutput::Data(out)))
    }
}

impl PipelineStage for TumblingWindowStage {
    fn concurrency_mode(&self) -> ConcurrencyMode {
        ConcurrencyMode::SingleThreaded
    }

    fn execute(
        &self,
        _ctx: &ExecutionContext<'_>,
        input: StageInput,
    ) -> Result<Vec<StageOutput>, EngineError> {
        let mut state = self.state.lock().expect("window state poisoned");
        match input {
            StageInput::Data(buf) => {
                let window_start = (buf.watermark() / self.window_size) * self.window_size;
                let mut emitted = Vec::new();
                if window_start > state.current_window_start {
                    emitted.extend(self.close_current_window(&mut state)?);
                    state.current_window_start = window_start;
                }
                state.accumulated_tuples += buf.num_tuples();
                Ok(emitted)
            }
            StageInput::Marker(ReconfigurationMarker::Drain(TerminationType::Graceful)) => {
                let mut emitted: Vec<StageOutput> = self.close_current_window(&mut state)?.into_iter().collect();
                emitted.push(StageOutput::Marker(ReconfigurationMarker::Drain(
                    TerminationType::Graceful,
                )));
                Ok(emitted)
            }
            StageInput::Marker(ReconfigurationMarker::Drain(kind)) => {
                state.accumulated_tuples = 0;
                Ok(vec![StageOutput::Marker(ReconfigurationMarker::Drain(kind))])
            }
            StageInput::Marker(marker) => Ok(vec![StageOutput::Marker(marker)]),
        }
    }

    fn teardown(&self, _ctx: &ExecutionContext<'_>) -> Result<Vec<StageOutput>, EngineError> {
        let mut state = self.state.lock().expect("window state poisoned");
        Ok(self.close_current_window(&mut state)?.into_iter().collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_support::test_pool;
    use crate::types::{QueryId, StageId};
    use std::sync::atomic::AtomicBool;

    #[test]
    fn closes_window_on_watermark_crossing() {
        let pool = test_pool();
        let stage = TumblingWindowStage::new(10, pool.clone());
        let abort = AtomicBool::new(false);
        let ctx = ExecutionContext::new(QueryId(1), StageId(1), &abort);

        let a = pool.acquire().unwrap();
        a.set_watermark(1);
        a.set_num_tuples(3);
        assert!(stage.execute(&ctx, StageInput::Data(a)).unwrap().is_empty());

        let b = pool.acquire().unwrap();
        b.set_watermark(15);
        b.set_num_tuples(5);
        let out = stage.execute(&ctx, StageInput::Data(b)).unwrap();
        assert_eq!(out.len(), 1);
        match &out[0] {
            StageOutput::Data(buf) => assert_eq!(buf.num_tuples(), 3),
            StageOutput::Marker(_) => panic!("expected data output"),
        }
    }

    #[test]
    fn graceful_drain_flushes_partial_window() {
        let pool = test_pool();
        let stage = TumblingWindowStage::new(10, pool.clone());
        let abort = AtomicBool::new(false);
        let ctx = ExecutionContext::new(QueryId(1), StageId(1), &abort);

        let a = pool.acquire().unwrap();
        a.set_watermark(2);
        a.set_num_tuples(7);
        stage.execute(&ctx, StageInput::Data(a)).unwrap();

        let out = stage
            .execute(
                &ctx,
                StageInput::Marker(ReconfigurationMarker::Drain(TerminationType::Graceful)),
            )
            .unwrap();
        assert_eq!(out.len(), 2);
        match &out[0] {
            StageOutput::Data(buf) => assert_eq!(buf.num_tuples(), 7),
            StageOutput::Marker(_) => panic!("expected data output first"),
        }
        assert!(matches!(out[1], StageOutput::Marker(_)));
    }
}
