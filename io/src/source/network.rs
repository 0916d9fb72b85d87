use std::net::SocketAddr;
use std::sync::Arc;

use nebula_buffer::{BufferPool, RecordBuffer};
use nebula_pipeline::{EngineError, TerminationType};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

use crate::state::SourceState;

/// TCP-based source: dials the upstream endpoint the coordinator assigned
/// and turns each successful read into one record buffer.
pub struct NetworkSource {
    addr: SocketAddr,
    pool: Arc<BufferPool>,
    origin_id: u64,
    stream: Option<TcpStream>,
    state: SourceState,
    next_sequence: u64,
}

impl NetworkSource {
    pub fn new(addr: SocketAddr, pool: Arc<BufferPool>, origin_id: u64) -> Self {
        Self {
            addr,
            pool,
            origin_id,
            stream: None,
            state: SourceState::Created,
            next_sequence: 0,
        }
    }

    pub fn state(&self) -> SourceState {
        self.state
    }

    pub async fn open(&mut self) -> Result<(), EngineError> {
        self.state = SourceState::Opening;
        match TcpStream::connect(self.addr).await {
            Ok(stream) => {
                self.stream = Some(stream);
                self.state = SourceState::Running;
                Ok(())
            }
            Err(err) => {
                self.state = SourceState::Closed(TerminationType::Failure);
                Err(EngineError::SourceFailure(format!(
                    "connect to {}: {err}",
                    self.addr
                )))
            }
        }
    }

    pub async fn poll_next(&mut self) -> Result<Option<RecordBuffer>, EngineError> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(EngineError::SourceFailure("poll_next before open".into()));
        };
        if self.state != SourceState::Running && self.state != SourceState::Draining {
            return Ok(None);
        }
        let mut scratch = vec![0u8; self.pool.config().buffer_size];
        match stream.read(&mut scratch).await {
            Ok(0) => {
                self.state = SourceState::Draining;
                Ok(None)
            }
            Ok(n) => {
                let buf = self.pool.acquire_blocking().await?;
                buf.write_main(|bytes| bytes[..n].copy_from_slice(&scratch[..n]));
                buf.set_num_tuples(n as u64);
                buf.set_origin_id(self.origin_id);
                buf.set_sequence_number(self.next_sequence);
                self.next_sequence += 1;
                Ok(Some(buf))
            }
            Err(err) => {
                self.state = SourceState::Closed(TerminationType::Failure);
                Err(EngineError::SourceFailure(format!("read from {}: {err}", self.addr)))
            }
        }
    }

    pub async fn close(&mut self, reason: TerminationType) -> Result<(), EngineError> {
        self.stream = None;
        self.state = SourceState::Closed(reason);
        Ok(())
    }

    /// Tears down the current binding and redials `descriptor`'s address.
    /// The runtime applies this between `poll_next` calls on the source's
    /// own polling task, so a rebind never races a pending read; the old
    /// endpoint is parsed-and-kept until the new descriptor proves valid.
    pub async fn update_version(&mut self, descriptor: String) -> Result<(), EngineError> {
        let new_addr: SocketAddr = descriptor
            .parse()
            .map_err(|e| EngineError::SourceFailure(format!("invalid descriptor {descriptor}: {e}")))?;
        tracing::debug!(old = %self.addr, new = %new_addr, "rebinding source endpoint");
        self.stream = None;
        self.addr = new_addr;
        self.open().await
    }
}
