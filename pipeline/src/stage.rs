use std::sync::atomic::{AtomicBool, Ordering};

use nebula_buffer::RecordBuffer;

use crate::error::EngineError;
use crate::types::{QueryId, ReconfigurationMarker, StageId};

/// How the Query Manager is allowed to schedule concurrent `execute` calls
/// against one stage instance for one query.
#[derive(Clone)]
pub enum ConcurrencyMode {
    /// At most one thread executes this stage for this query at a time.
    SingleThreaded,
    /// Buffers sharing a partition key are routed to the same worker
    /// thread; the key function must be deterministic and side-effect free.
    Partitioned {
        key_fn: std::sync::Arc<dyn Fn(&RecordBuffer) -> u64 + Send + Sync>,
    },
    /// The stage's internal state tolerates arbitrary concurrent access;
    /// any number of `execute` calls may run at once.
    Shared,
}

impl std::fmt::Debug for ConcurrencyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SingleThreaded => write!(f, "SingleThreaded"),
            Self::Partitioned { .. } => write!(f, "Partitioned"),
            Self::Shared => write!(f, "Shared"),
        }
    }
}

/// A single task handed to a stage's `execute`: either a data buffer or a
/// reconfiguration marker. Modeled as a sum type rather than overloading
/// `RecordBuffer` with a "this is actually a marker" flag.
pub enum StageInput {
    Data(RecordBuffer),
    Marker(ReconfigurationMarker),
}

/// What a stage hands back to the runtime from one `execute`/`teardown`
/// call: zero or more data buffers, and zero or more markers it chooses to
/// forward downstream. A stage must forward every marker it receives,
/// after performing whatever local drain the marker requires.
pub enum StageOutput {
    Data(RecordBuffer),
    Marker(ReconfigurationMarker),
}

impl From<RecordBuffer> for StageOutput {
    fn from(buf: RecordBuffer) -> Self {
        StageOutput::Data(buf)
    }
}

/// One stage's output feeds the next stage's input unchanged.
impl From<StageOutput> for StageInput {
    fn from(out: StageOutput) -> Self {
        match out {
            StageOutput::Data(buf) => StageInput::Data(buf),
            StageOutput::Marker(marker) => StageInput::Marker(marker),
        }
    }
}

/// Per-call context handed to a stage. Carries identity for logging and
/// the query's abort flag; stages that need persistent state hold it in
/// their own struct fields rather than through the context, since Rust's
/// ownership model makes that both safer and simpler than a dynamically
/// typed state slot.
pub struct ExecutionContext<'a> {
    pub query_id: QueryId,
    pub stage_id: StageId,
    abort: &'a AtomicBool,
}

impl<'a> ExecutionContext<'a> {
    pub fn new(query_id: QueryId, stage_id: StageId, abort: &'a AtomicBool) -> Self {
        Self {
            query_id,
            stage_id,
            abort,
        }
    }

    /// Long-running stage executions poll this at buffer granularity.
    /// `true` once `stop(Hard)` or `shutdown()` has fired for this query.
    pub fn is_aborting(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }
}

/// Transforms input buffers into output buffers using compiled operator
/// code. `setup`/`teardown` bracket exactly one query's lifetime;
/// `execute` is synchronous and must not perform blocking I/O.
pub trait PipelineStage: Send + Sync {
    fn concurrency_mode(&self) -> ConcurrencyMode {
        ConcurrencyMode::SingleThreaded
    }

    fn setup(&self, ctx: &ExecutionContext<'_>) -> Result<(), EngineError> {
        let _ = ctx;
        Ok(())
    }

    fn execute(
        &self,
        ctx: &ExecutionContext<'_>,
        input: StageInput,
    ) -> Result<Vec<StageOutput>, EngineError>;

    fn teardown(&self, ctx: &ExecutionContext<'_>) -> Result<Vec<StageOutput>, EngineError> {
        let _ = ctx;
        Ok(Vec::new())
    }
}
