use std::sync::Arc;

use nebula_buffer::{BufferPool, Schema};
use nebula_io::{FileSink, FileSource, NetworkSink, NetworkSource, Sink, Source, StdoutSink};
use nebula_io::{SinkFactory, SourceFactory};
use nebula_pipeline::{EngineError, QueryId};

/// Descriptor is a bare `ip:port` string.
pub struct NetworkSourceFactory;

impl SourceFactory for NetworkSourceFactory {
    fn create(
        &self,
        descriptor: &str,
        pool: Arc<BufferPool>,
        _schema: Arc<Schema>,
        query_id: QueryId,
    ) -> Result<Source, EngineError> {
        let addr = descriptor
            .parse()
            .map_err(|e| EngineError::SourceFailure(format!("invalid network source descriptor: {e}")))?;
        Ok(Source::Network(NetworkSource::new(addr, pool, query_id.0)))
    }
}

/// Descriptor is a filesystem path.
pub struct FileSourceFactory;

impl SourceFactory for FileSourceFactory {
    fn create(
        &self,
        descriptor: &str,
        pool: Arc<BufferPool>,
        _schema: Arc<Schema>,
        _query_id: QueryId,
    ) -> Result<Source, EngineError> {
        Ok(Source::File(FileSource::new(descriptor, pool)))
    }
}

/// Descriptor is a bare `ip:port` string.
pub struct NetworkSinkFactory;

impl SinkFactory for NetworkSinkFactory {
    fn create(
        &self,
        descriptor: &str,
        _pool: Arc<BufferPool>,
        _schema: Arc<Schema>,
        _query_id: QueryId,
    ) -> Result<Sink, EngineError> {
        let addr = descriptor
            .parse()
            .map_err(|e| EngineError::SinkFailure(format!("invalid network sink descriptor: {e}")))?;
        Ok(Sink::Network(NetworkSink::new(addr)))
    }
}

/// Descriptor is a filesystem path.
pub struct FileSinkFactory;

impl SinkFactory for FileSinkFactory {
    fn create(
        &self,
        descriptor: &str,
        _pool: Arc<BufferPool>,
        _schema: Arc<Schema>,
        _query_id: QueryId,
    ) -> Result<Sink, EngineError> {
        Ok(Sink::File(FileSink::new(descriptor)))
    }
}

/// Descriptor is ignored; stdout is a singleton endpoint.
pub struct StdoutSinkFactory;

impl SinkFactory for StdoutSinkFactory {
    fn create(
        &self,
        _descriptor: &str,
        _pool: Arc<BufferPool>,
        _schema: Arc<Schema>,
        _query_id: QueryId,
    ) -> Result<Sink, EngineError> {
        Ok(Sink::Stdout(StdoutSink::new()))
    }
}
