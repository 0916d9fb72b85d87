use std::io::ErrorKind;
use std::net::SocketAddr;

use nebula_buffer::RecordBuffer;
use nebula_pipeline::{EngineError, TerminationType};
use tokio::net::TcpStream;

use super::EmitOutcome;
use crate::state::SinkState;

/// TCP-based sink. A write that would block is reported as `RetryLater`
/// instead of blocking the scheduler thread; the runtime re-enqueues the
/// emission after its configured retry delay.
pub struct NetworkSink {
    addr: SocketAddr,
    stream: Option<TcpStream>,
    state: SinkState,
}

impl NetworkSink {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            stream: None,
            state: SinkState::Created,
        }
    }

    pub fn state(&self) -> SinkState {
        self.state
    }

    pub async fn open(&mut self) -> Result<(), EngineError> {
        self.state = SinkState::Opening;
        match TcpStream::connect(self.addr).await {
            Ok(stream) => {
                self.stream = Some(stream);
                self.state = SinkState::Running;
                Ok(())
            }
            Err(err) => {
                self.state = SinkState::Closed(TerminationType::Failure);
                Err(EngineError::SinkFailure(format!("connect to {}: {err}", self.addr)))
            }
        }
    }

    pub async fn try_emit(&mut self, buffer: RecordBuffer) -> Result<EmitOutcome, EngineError> {
        let Some(stream) = self.stream.as_ref() else {
            return Ok(EmitOutcome::Closed);
        };
        let Some(bytes) = buffer.read_main() else {
            return Ok(EmitOutcome::Accepted);
        };
        match stream.try_write(&bytes) {
            Ok(_) => Ok(EmitOutcome::Accepted),
            Err(err) if err.kind() == ErrorKind::WouldBlock => Ok(EmitOutcome::RetryLater),
            Err(err) => {
                self.state = SinkState::Closed(TerminationType::Failure);
                Err(EngineError::SinkFailure(format!("write to {}: {err}", self.addr)))
            }
        }
    }

    pub async fn close(&mut self, reason: TerminationType) -> Result<(), EngineError> {
        self.stream = None;
        self.state = SinkState::Closed(reason);
        Ok(())
    }

    /// Drops the current endpoint, then rebinds to `descriptor`'s address.
    /// Pending kernel-buffered writes to the old endpoint are flushed by
    /// the connection teardown itself.
    pub async fn update_version(&mut self, descriptor: String) -> Result<(), EngineError> {
        let new_addr: SocketAddr = descriptor
            .parse()
            .map_err(|e| EngineError::SinkFailure(format!("invalid descriptor {descriptor}: {e}")))?;
        self.stream = None;
        self.addr = new_addr;
        self.open().await
    }
}
