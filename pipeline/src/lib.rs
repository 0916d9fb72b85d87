//! Pipeline stage contract and a handful of concrete stages.
//!
//! A stage transforms input buffers into output buffers using compiled
//! operator code. The Query Manager (in `nebula-runtime`) owns the DAG of
//! stages for a query and dispatches work according to each stage's
//! declared [`ConcurrencyMode`].

#![forbid(unsafe_code)]

mod error;
mod stage;
pub mod stages;
#[cfg(test)]
mod test_support;
mod types;

pub use error::EngineError;
pub use stage::{ConcurrencyMode, ExecutionContext, PipelineStage, StageInput, StageOutput};
pub use types::{QueryId, ReconfigurationMarker, StageId, TerminationType, UpdateTarget};
