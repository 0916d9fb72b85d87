pub mod file;
pub mod network;
pub mod test_source;

use nebula_buffer::RecordBuffer;
use nebula_pipeline::{EngineError, TerminationType};

use crate::state::SourceState;
use file::FileSource;
use network::NetworkSource;
use test_source::TestSource;

/// A source produces record buffers for exactly one query. Represented as
/// a sum type rather than a trait object hierarchy, since the small,
/// closed set of transports is known up front.
pub enum Source {
    Network(NetworkSource),
    File(FileSource),
    Test(TestSource),
}

impl Source {
    pub fn state(&self) -> SourceState {
        match self {
            Source::Network(s) => s.state(),
            Source::File(s) => s.state(),
            Source::Test(s) => s.state(),
        }
    }

    /// Performs the external handshake (connect, open file, replay setup).
    pub async fn open(&mut self) -> Result<(), EngineError> {
        match self {
            Source::Network(s) => s.open().await,
            Source::File(s) => s.open().await,
            Source::Test(s) => s.open().await,
        }
    }

    /// Produces the next buffer, or `Ok(None)` once the source has
    /// naturally drained (end of stream from the producer).
    pub async fn poll_next(&mut self) -> Result<Option<RecordBuffer>, EngineError> {
        match self {
            Source::Network(s) => s.poll_next().await,
            Source::File(s) => s.poll_next().await,
            Source::Test(s) => s.poll_next().await,
        }
    }

    pub async fn close(&mut self, reason: TerminationType) -> Result<(), EngineError> {
        match self {
            Source::Network(s) => s.close(reason).await,
            Source::File(s) => s.close(reason).await,
            Source::Test(s) => s.close(reason).await,
        }
    }

    /// Tears down the current external binding and rebinds using a new
    /// descriptor. Buffers already produced under the old binding stay
    /// valid.
    pub async fn update_version(&mut self, descriptor: String) -> Result<(), EngineError> {
        match self {
            Source::Network(s) => s.update_version(descriptor).await,
            Source::File(_) | Source::Test(_) => Err(EngineError::SourceFailure(
                "update_version is only supported by network sources".into(),
            )),
        }
    }
}
