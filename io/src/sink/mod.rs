pub mod file;
pub mod network;
pub mod stdout;
pub mod test_sink;

use nebula_buffer::RecordBuffer;
use nebula_pipeline::{EngineError, TerminationType};

use crate::state::SinkState;
use file::FileSink;
use network::NetworkSink;
use stdout::StdoutSink;
use test_sink::TestSink;

/// Result of a non-blocking emit attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitOutcome {
    Accepted,
    RetryLater,
    Closed,
}

/// A sink emits buffers to an external endpoint. Sum type for the same
/// reason as [`crate::Source`].
pub enum Sink {
    Network(NetworkSink),
    File(FileSink),
    Stdout(StdoutSink),
    Test(TestSink),
}

impl Sink {
    pub fn state(&self) -> SinkState {
        match self {
            Sink::Network(s) => s.state(),
            Sink::File(s) => s.state(),
            Sink::Stdout(s) => s.state(),
            Sink::Test(s) => s.state(),
        }
    }

    pub async fn open(&mut self) -> Result<(), EngineError> {
        match self {
            Sink::Network(s) => s.open().await,
            Sink::File(s) => s.open().await,
            Sink::Stdout(s) => s.open().await,
            Sink::Test(s) => s.open().await,
        }
    }

    pub async fn try_emit(&mut self, buffer: RecordBuffer) -> Result<EmitOutcome, EngineError> {
        match self {
            Sink::Network(s) => s.try_emit(buffer).await,
            Sink::File(s) => s.try_emit(buffer).await,
            Sink::Stdout(s) => s.try_emit(buffer).await,
            Sink::Test(s) => s.try_emit(buffer).await,
        }
    }

    pub async fn close(&mut self, reason: TerminationType) -> Result<(), EngineError> {
        match self {
            Sink::Network(s) => s.close(reason).await,
            Sink::File(s) => s.close(reason).await,
            Sink::Stdout(s) => s.close(reason).await,
            Sink::Test(s) => s.close(reason).await,
        }
    }

    pub async fn update_version(&mut self, descriptor: String) -> Result<(), EngineError> {
        match self {
            Sink::Network(s) => s.update_version(descriptor).await,
            Sink::File(_) | Sink::Stdout(_) | Sink::Test(_) => Err(EngineError::SinkFailure(
                "update_version is only supported by network sinks".into(),
            )),
        }
    }
}
