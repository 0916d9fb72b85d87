use std::collections::HashMap;
use std::sync::Arc;

use nebula_buffer::{BufferPool, Schema};
use nebula_pipeline::{EngineError, QueryId};

use crate::sink::Sink;
use crate::source::Source;

/// Creates a [`Source`] from an opaque descriptor. The plan deserializer
/// hands the engine a type tag plus an opaque descriptor payload, and the
/// registry dispatches to whichever factory was registered for that tag.
pub trait SourceFactory: Send + Sync {
    fn create(
        &self,
        descriptor: &str,
        pool: Arc<BufferPool>,
        schema: Arc<Schema>,
        query_id: QueryId,
    ) -> Result<Source, EngineError>;
}

pub trait SinkFactory: Send + Sync {
    fn create(
        &self,
        descriptor: &str,
        pool: Arc<BufferPool>,
        schema: Arc<Schema>,
        query_id: QueryId,
    ) -> Result<Sink, EngineError>;
}

/// Maps a descriptor's type tag (e.g. `"network"`, `"file"`) to the
/// factory that knows how to construct it.
#[derive(Default)]
pub struct DescriptorRegistry {
    sources: HashMap<String, Arc<dyn SourceFactory>>,
    sinks: HashMap<String, Arc<dyn SinkFactory>>,
}

impl DescriptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_source(&mut self, type_tag: impl Into<String>, factory: Arc<dyn SourceFactory>) {
        self.sources.insert(type_tag.into(), factory);
    }

    pub fn register_sink(&mut self, type_tag: impl Into<String>, factory: Arc<dyn SinkFactory>) {
        self.sinks.insert(type_tag.into(), factory);
    }

    pub fn create_source(
        &self,
        type_tag: &str,
        descriptor: &str,
        pool: Arc<BufferPool>,
        schema: Arc<Schema>,
        query_id: QueryId,
    ) -> Result<Source, EngineError> {
        let factory = self.sources.get(type_tag).ok_or_else(|| {
            EngineError::SourceFailure(format!("no source factory registered for type tag {type_tag}"))
        })?;
        factory.create(descriptor, pool, schema, query_id)
    }

    pub fn create_sink(
        &self,
        type_tag: &str,
        descriptor: &str,
        pool: Arc<BufferPool>,
        schema: Arc<Schema>,
        query_id: QueryId,
    ) -> Result<Sink, EngineError> {
        let factory = self.sinks.get(type_tag).ok_or_else(|| {
            EngineError::SinkFailure(format!("no sink factory registered for type tag {type_tag}"))
        })?;
        factory.create(descriptor, pool, schema, query_id)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use nebula_buffer::{FieldType, PoolConfig};

    struct NetworkSourceFactory;
    impl SourceFactory for NetworkSourceFactory {
        fn create(
            &self,
            descriptor: &str,
            pool: Arc<BufferPool>,
            _schema: Arc<Schema>,
            _query_id: QueryId,
        ) -> Result<Source, EngineError> {
            let addr = descriptor
                .parse()
                .map_err(|e| EngineError::SourceFailure(format!("{e}")))?;
            Ok(Source::Network(crate::source::network::NetworkSource::new(
                addr, pool, 0,
            )))
        }
    }

    #[test]
    fn dispatches_to_registered_factory() {
        let mut registry = DescriptorRegistry::new();
        registry.register_source("network", Arc::new(NetworkSourceFactory));

        let schema = Arc::new(Schema::builder().field("v", FieldType::I64).build());
        let pool = BufferPool::new(
            PoolConfig {
                buffer_size: 64,
                pooled_buffer_count: 1,
                unpooled_budget: 0,
                leak_tracking: false,
            },
            (*schema).clone(),
        );

        let source = registry.create_source("network", "127.0.0.1:9000", pool, schema, QueryId(1));
        assert!(source.is_ok());
        assert!(registry
            .create_source("file", "/tmp/x", BufferPool::new(
                PoolConfig { buffer_size: 64, pooled_buffer_count: 1, unpooled_budget: 0, leak_tracking: false },
                Schema::builder().field("v", FieldType::I64).build(),
            ), Arc::new(Schema::builder().field("v", FieldType::I64).build()), QueryId(1))
            .is_err());
    }
}
