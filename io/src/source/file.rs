use std::path::PathBuf;
use std::sync::Arc;

use nebula_buffer::{BufferPool, RecordBuffer};
use nebula_pipeline::{EngineError, TerminationType};
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::state::SourceState;

/// Reads fixed-size chunks from a file on local disk until EOF.
pub struct FileSource {
    path: PathBuf,
    pool: Arc<BufferPool>,
    file: Option<File>,
    state: SourceState,
    next_sequence: u64,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>, pool: Arc<BufferPool>) -> Self {
        Self {
            path: path.into(),
            pool,
            file: None,
            state: SourceState::Created,
            next_sequence: 0,
        }
    }

    pub fn state(&self) -> SourceState {
        self.state
    }

    pub async fn open(&mut self) -> Result<(), EngineError> {
        self.state = SourceState::Opening;
        match File::open(&self.path).await {
            Ok(file) => {
                self.file = Some(file);
                self.state = SourceState::Running;
                Ok(())
            }
            Err(err) => {
                self.state = SourceState::Closed(TerminationType::Failure);
                Err(EngineError::SourceFailure(format!(
                    "open {}: {err}",
                    self.path.display()
                )))
            }
        }
    }

    pub async fn poll_next(&mut self) -> Result<Option<RecordBuffer>, EngineError> {
        let Some(file) = self.file.as_mut() else {
            return Err(EngineError::SourceFailure("poll_next before open".into()));
        };
        if self.state != SourceState::Running && self.state != SourceState::Draining {
            return Ok(None);
        }
        let mut scratch = vec![0u8; self.pool.config().buffer_size];
        match file.read(&mut scratch).await {
            Ok(0) => {
                self.state = SourceState::Draining;
                Ok(None)
            }
            Ok(n) => {
                let buf = self.pool.acquire_blocking().await?;
                buf.write_main(|bytes| bytes[..n].copy_from_slice(&scratch[..n]));
                buf.set_num_tuples(n as u64);
                buf.set_sequence_number(self.next_sequence);
                self.next_sequence += 1;
                Ok(Some(buf))
            }
            Err(err) => {
                self.state = SourceState::Closed(TerminationType::Failure);
                Err(EngineError::SourceFailure(format!(
                    "read {}: {err}",
                    self.path.display()
                )))
            }
        }
    }

    pub async fn close(&mut self, reason: TerminationType) -> Result<(), EngineError> {
        self.file = None;
        self.state = SourceState::Closed(reason);
        Ok(())
    }
}
