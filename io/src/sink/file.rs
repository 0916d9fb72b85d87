use std::path::PathBuf;

use nebula_buffer::RecordBuffer;
use nebula_pipeline::{EngineError, TerminationType};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

use super::EmitOutcome;
use crate::state::SinkState;

pub struct FileSink {
    path: PathBuf,
    file: Option<File>,
    state: SinkState,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
            state: SinkState::Created,
        }
    }

    pub fn state(&self) -> SinkState {
        self.state
    }

    pub async fn open(&mut self) -> Result<(), EngineError> {
        self.state = SinkState::Opening;
        match OpenOptions::new().create(true).append(true).open(&self.path).await {
            Ok(file) => {
                self.file = Some(file);
                self.state = SinkState::Running;
                Ok(())
            }
            Err(err) => {
                self.state = SinkState::Closed(TerminationType::Failure);
                Err(EngineError::SinkFailure(format!("open {}: {err}", self.path.display())))
            }
        }
    }

    pub async fn try_emit(&mut self, buffer: RecordBuffer) -> Result<EmitOutcome, EngineError> {
        let Some(file) = self.file.as_mut() else {
            return Ok(EmitOutcome::Closed);
        };
        let Some(bytes) = buffer.read_main() else {
            return Ok(EmitOutcome::Accepted);
        };
        match file.write_all(&bytes).await {
            Ok(()) => Ok(EmitOutcome::Accepted),
            Err(err) => {
                self.state = SinkState::Closed(TerminationType::Failure);
                Err(EngineError::SinkFailure(format!("write {}: {err}", self.path.display())))
            }
        }
    }

    pub async fn close(&mut self, reason: TerminationType) -> Result<(), EngineError> {
        if let Some(mut file) = self.file.take() {
            let _ = file.flush().await;
        }
        self.state = SinkState::Closed(reason);
        Ok(())
    }
}
