use std::fmt;

/// The engine's error taxonomy. `InvariantViolation` is carried here for
/// completeness but is never returned in practice: violations are real
/// panics, raised at the point of detection, per the engine-wide
/// "invariant violations are fatal, not recoverable" rule.
#[derive(Debug)]
pub enum EngineError {
    OutOfMemory,
    SourceFailure(String),
    SinkFailure(String),
    StageFailure(String),
    InvariantViolation(String),
    Cancelled,
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::SourceFailure(msg) => write!(f, "source failure: {msg}"),
            Self::SinkFailure(msg) => write!(f, "sink failure: {msg}"),
            Self::StageFailure(msg) => write!(f, "stage failure: {msg}"),
            Self::InvariantViolation(msg) => write!(f, "invariant violation: {msg}"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<nebula_buffer::BufferError> for EngineError {
    fn from(err: nebula_buffer::BufferError) -> Self {
        match err {
            nebula_buffer::BufferError::PoolExhausted
            | nebula_buffer::BufferError::UnpooledBudgetExceeded { .. } => Self::OutOfMemory,
            nebula_buffer::BufferError::ShuttingDown => Self::Cancelled,
            other => Self::StageFailure(other.to_string()),
        }
    }
}
