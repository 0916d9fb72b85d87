use std::sync::Mutex as StdMutex;

use nebula_buffer::RecordBuffer;
use nebula_pipeline::{ConcurrencyMode, EngineError, ExecutionContext, PipelineStage, StageInput, StageOutput};

/// Serializes dispatch into one stage according to its declared
/// [`ConcurrencyMode`]. `Shared` stages need no serialization;
/// `SingleThreaded` stages get one mutex; `Partitioned` stages get one
/// mutex per shard, selected by the declared key function.
enum Guard {
    Shared,
    Single(StdMutex<()>),
    Partitioned {
        key_fn: std::sync::Arc<dyn Fn(&RecordBuffer) -> u64 + Send + Sync>,
        shards: Vec<StdMutex<()>>,
    },
}

pub struct StageSlot {
    stage: Box<dyn PipelineStage>,
    guard: Guard,
}

impl StageSlot {
    pub fn new(stage: Box<dyn PipelineStage>, shard_count: usize) -> Self {
        let guard = match stage.concurrency_mode() {
            ConcurrencyMode::Shared => Guard::Shared,
            ConcurrencyMode::SingleThreaded => Guard::Single(StdMutex::new(())),
            ConcurrencyMode::Partitioned { key_fn } => Guard::Partitioned {
                key_fn,
                shards: (0..shard_count.max(1)).map(|_| StdMutex::new(())).collect(),
            },
        };
        Self { stage, guard }
    }

    /// Whether buffers must reach this stage in queue order. A mutex alone
    /// serializes execution but lets two racing dispatchers swap two
    /// buffers; order-sensitive stages additionally need dispatch itself
    /// serialized.
    pub fn order_sensitive(&self) -> bool {
        !matches!(self.guard, Guard::Shared)
    }

    pub fn setup(&self, ctx: &ExecutionContext<'_>) -> Result<(), EngineError> {
        self.stage.setup(ctx)
    }

    pub fn teardown(&self, ctx: &ExecutionContext<'_>) -> Result<Vec<StageOutput>, EngineError> {
        self.stage.teardown(ctx)
    }

    pub fn execute(&self, ctx: &ExecutionContext<'_>, input: StageInput) -> Result<Vec<StageOutput>, EngineError> {
        match &self.guard {
            Guard::Shared => self.stage.execute(ctx, input),
            Guard::Single(lock) => {
                let _held = lock.lock().expect("stage mailbox lock poisoned");
                self.stage.execute(ctx, input)
            }
            Guard::Partitioned { key_fn, shards } => {
                let idx = match &input {
                    StageInput::Data(buf) => (key_fn(buf) as usize) % shards.len(),
                    StageInput::Marker(_) => 0,
                };
                let _held = shards[idx].lock().expect("stage mailbox lock poisoned");
                self.stage.execute(ctx, input)
            }
        }
    }
}
