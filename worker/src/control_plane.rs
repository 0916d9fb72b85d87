use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[cfg(test)]
use nebula_buffer::BufferPool;
use nebula_buffer::Schema;
use nebula_io::DescriptorRegistry;
use nebula_pipeline::{EngineError, PipelineStage, QueryId, ReconfigurationMarker, TerminationType, UpdateTarget};
use nebula_runtime::{IqpSpec, QueryManager};

/// Acknowledgement returned by every control-plane call once the
/// corresponding Query Manager operation has taken effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack;

/// Errors surfaced across the RPC boundary. Distinct from [`EngineError`]
/// because a coordinator can make requests that are invalid independent of
/// engine state (unknown shared query, unknown descriptor type tag).
#[derive(Debug)]
pub enum WorkerError {
    UnknownSharedQuery(u64),
    UnknownDecomposedQuery(u64),
    Engine(EngineError),
}

impl std::fmt::Display for WorkerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownSharedQuery(id) => write!(f, "unknown shared query id {id}"),
            Self::UnknownDecomposedQuery(id) => write!(f, "unknown decomposed query id {id}"),
            Self::Engine(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for WorkerError {}

impl From<EngineError> for WorkerError {
    fn from(err: EngineError) -> Self {
        Self::Engine(err)
    }
}

/// A source or sink descriptor as the coordinator hands it to the worker:
/// a type tag the [`DescriptorRegistry`] dispatches on, plus an opaque
/// payload the matching factory knows how to parse.
#[derive(Debug, Clone)]
pub struct ComponentDescriptor {
    pub type_tag: String,
    pub descriptor: String,
}

impl ComponentDescriptor {
    pub fn new(type_tag: impl Into<String>, descriptor: impl Into<String>) -> Self {
        Self {
            type_tag: type_tag.into(),
            descriptor: descriptor.into(),
        }
    }
}

/// A decomposed query plan already deserialized by the wire layer into
/// its structural components: compiled stages plus source/sink
/// descriptors still bound to the registry at registration time.
pub struct DecomposedQueryPlan {
    pub version: u64,
    pub stages: Vec<Box<dyn PipelineStage>>,
    pub sources: Vec<ComponentDescriptor>,
    pub sinks: Vec<ComponentDescriptor>,
}

/// The coordinator-facing operations, as a plain async trait; the wire
/// codec is a separate concern layered on top. Implemented directly
/// rather than as `dyn`-safe, since a concrete RPC server wraps exactly
/// one [`Worker`] instance.
#[allow(async_fn_in_trait)]
pub trait WorkerControlPlane {
    async fn register_decomposed_query_plan(
        &self,
        shared_query_id: u64,
        decomposed_id: u64,
        plan: DecomposedQueryPlan,
    ) -> Result<Ack, WorkerError>;

    async fn start_query(&self, shared_query_id: u64, decomposed_id: u64) -> Result<Ack, WorkerError>;

    async fn stop_query(
        &self,
        shared_query_id: u64,
        decomposed_id: u64,
        termination: TerminationType,
    ) -> Result<Ack, WorkerError>;

    async fn unregister_query(&self, shared_query_id: u64) -> Result<Ack, WorkerError>;

    async fn update_network_sink(
        &self,
        shared_query_id: u64,
        decomposed_id: u64,
        sink_descriptor_id: u64,
        new_endpoint: String,
    ) -> Result<Ack, WorkerError>;

    async fn inject_reconfiguration_marker(
        &self,
        shared_query_id: u64,
        decomposed_id: u64,
        marker: ReconfigurationMarker,
    ) -> Result<Ack, WorkerError>;
}

/// Owns the Query Manager and descriptor registry for one worker process
/// and implements the coordinator-facing contract against them.
///
/// `decomposed_id` is used directly as the runtime's [`QueryId`]: each
/// decomposed plan is one IQP. `shared_query_id` has no corresponding
/// runtime concept (an IQP doesn't know which other workers host sibling
/// decompositions of the same shared query) so it is tracked only here,
/// purely to let [`WorkerControlPlane::unregister_query`] fan out to every
/// decomposed plan registered under it.
pub struct Worker {
    manager: Arc<QueryManager>,
    registry: Arc<DescriptorRegistry>,
    schema: Arc<Schema>,
    shared_queries: Mutex<HashMap<u64, Vec<QueryId>>>,
}

impl Worker {
    pub fn new(manager: Arc<QueryManager>, registry: Arc<DescriptorRegistry>, schema: Schema) -> Self {
        Self {
            manager,
            registry,
            schema: Arc::new(schema),
            shared_queries: Mutex::new(HashMap::new()),
        }
    }

    pub fn manager(&self) -> &Arc<QueryManager> {
        &self.manager
    }

    fn decomposed_ids_for(&self, shared_query_id: u64) -> Result<Vec<QueryId>, WorkerError> {
        self.shared_queries
            .lock()
            .expect("shared query table poisoned")
            .get(&shared_query_id)
            .cloned()
            .ok_or(WorkerError::UnknownSharedQuery(shared_query_id))
    }
}

impl WorkerControlPlane for Worker {
    async fn register_decomposed_query_plan(
        &self,
        shared_query_id: u64,
        decomposed_id: u64,
        plan: DecomposedQueryPlan,
    ) -> Result<Ack, WorkerError> {
        let query_id = QueryId(decomposed_id);

        let sources = plan
            .sources
            .iter()
            .map(|d| {
                self.registry
                    .create_source(&d.type_tag, &d.descriptor, self.manager.pool().clone(), self.schema.clone(), query_id)
            })
            .collect::<Result<Vec<_>, _>>()?;
        let sinks = plan
            .sinks
            .iter()
            .map(|d| {
                self.registry
                    .create_sink(&d.type_tag, &d.descriptor, self.manager.pool().clone(), self.schema.clone(), query_id)
            })
            .collect::<Result<Vec<_>, _>>()?;

        self.manager.deploy(IqpSpec {
            query_id,
            version: plan.version,
            sources,
            stages: plan.stages,
            sinks,
        })?;

        self.shared_queries
            .lock()
            .expect("shared query table poisoned")
            .entry(shared_query_id)
            .or_default()
            .push(query_id);

        tracing::info!(shared_query_id, decomposed_id, version = plan.version, "registered decomposed query plan");
        Ok(Ack)
    }

    async fn start_query(&self, shared_query_id: u64, decomposed_id: u64) -> Result<Ack, WorkerError> {
        let ids = self.decomposed_ids_for(shared_query_id)?;
        if !ids.contains(&QueryId(decomposed_id)) {
            return Err(WorkerError::UnknownDecomposedQuery(decomposed_id));
        }
        self.manager.start(QueryId(decomposed_id)).await?;
        Ok(Ack)
    }

    async fn stop_query(
        &self,
        shared_query_id: u64,
        decomposed_id: u64,
        termination: TerminationType,
    ) -> Result<Ack, WorkerError> {
        let ids = self.decomposed_ids_for(shared_query_id)?;
        if !ids.contains(&QueryId(decomposed_id)) {
            return Err(WorkerError::UnknownDecomposedQuery(decomposed_id));
        }
        self.manager.stop(QueryId(decomposed_id), termination);
        Ok(Ack)
    }

    async fn unregister_query(&self, shared_query_id: u64) -> Result<Ack, WorkerError> {
        let ids = self
            .shared_queries
            .lock()
            .expect("shared query table poisoned")
            .remove(&shared_query_id)
            .ok_or(WorkerError::UnknownSharedQuery(shared_query_id))?;
        for id in ids {
            self.manager.stop(id, TerminationType::Hard);
        }
        Ok(Ack)
    }

    /// Every sink on the decomposed plan receives the update; per-sink
    /// addressing by `sink_descriptor_id` is meaningful once a plan
    /// carries more than one sink, which none do today, so the id is
    /// recorded but not dispatched on.
    async fn update_network_sink(
        &self,
        shared_query_id: u64,
        decomposed_id: u64,
        sink_descriptor_id: u64,
        new_endpoint: String,
    ) -> Result<Ack, WorkerError> {
        let ids = self.decomposed_ids_for(shared_query_id)?;
        if !ids.contains(&QueryId(decomposed_id)) {
            return Err(WorkerError::UnknownDecomposedQuery(decomposed_id));
        }
        tracing::info!(shared_query_id, decomposed_id, sink_descriptor_id, "network sink update requested");
        self.manager
            .reconfigure(
                QueryId(decomposed_id),
                ReconfigurationMarker::UpdateVersion {
                    target: UpdateTarget::Sinks,
                    descriptor: new_endpoint,
                },
            )
            .await?;
        Ok(Ack)
    }

    async fn inject_reconfiguration_marker(
        &self,
        shared_query_id: u64,
        decomposed_id: u64,
        marker: ReconfigurationMarker,
    ) -> Result<Ack, WorkerError> {
        let ids = self.decomposed_ids_for(shared_query_id)?;
        if !ids.contains(&QueryId(decomposed_id)) {
            return Err(WorkerError::UnknownDecomposedQuery(decomposed_id));
        }
        self.manager.reconfigure(QueryId(decomposed_id), marker).await?;
        Ok(Ack)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    use nebula_buffer::FieldType;
    use nebula_io::{SinkFactory, Sink as IoSink, Source as IoSource, SourceFactory, TestSink, TestSource};
    use nebula_pipeline::stages::IdentityStage;
    use nebula_runtime::{QueryEvent, RecordingListener, WorkerConfig};

    fn schema() -> Schema {
        Schema::builder().field("id", FieldType::I64).build()
    }

    /// Descriptor is the number of buffers to replay.
    struct FixtureSourceFactory;

    impl SourceFactory for FixtureSourceFactory {
        fn create(
            &self,
            descriptor: &str,
            pool: Arc<BufferPool>,
            _schema: Arc<Schema>,
            _query_id: QueryId,
        ) -> Result<IoSource, EngineError> {
            let count: usize = descriptor
                .parse()
                .map_err(|e| EngineError::SourceFailure(format!("bad fixture descriptor: {e}")))?;
            let buffers = (0..count)
                .map(|i| {
                    let buf = pool.acquire()?;
                    buf.set_sequence_number(i as u64);
                    Ok(buf)
                })
                .collect::<Result<Vec<_>, EngineError>>()?;
            Ok(IoSource::Test(TestSource::new(buffers)))
        }
    }

    /// Hands out one pre-built sink, so the test keeps its receive handle.
    struct FixtureSinkFactory(Mutex<Option<IoSink>>);

    impl SinkFactory for FixtureSinkFactory {
        fn create(
            &self,
            _descriptor: &str,
            _pool: Arc<BufferPool>,
            _schema: Arc<Schema>,
            _query_id: QueryId,
        ) -> Result<IoSink, EngineError> {
            self.0
                .lock()
                .expect("fixture sink lock poisoned")
                .take()
                .ok_or_else(|| EngineError::SinkFailure("fixture sink already handed out".into()))
        }
    }

    #[tokio::test]
    async fn control_plane_drives_a_query_end_to_end() {
        let listener = RecordingListener::new();
        let manager = nebula_runtime::QueryManager::new(
            WorkerConfig::builder().worker_threads(2).build(),
            schema(),
            listener.clone(),
        );

        let sink = TestSink::new();
        let received = sink.received_handle();
        let mut registry = DescriptorRegistry::new();
        registry.register_source("fixture", Arc::new(FixtureSourceFactory));
        registry.register_sink("fixture", Arc::new(FixtureSinkFactory(Mutex::new(Some(IoSink::Test(sink))))));

        let worker = Worker::new(manager.clone(), Arc::new(registry), schema());

        worker
            .register_decomposed_query_plan(
                7,
                42,
                DecomposedQueryPlan {
                    version: 1,
                    stages: vec![Box::new(IdentityStage)],
                    sources: vec![ComponentDescriptor::new("fixture", "3")],
                    sinks: vec![ComponentDescriptor::new("fixture", "")],
                },
            )
            .await
            .unwrap();
        worker.start_query(7, 42).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !listener.events_for(QueryId(42)).contains(&QueryEvent::Stopped) {
            assert!(tokio::time::Instant::now() < deadline, "query did not stop in time");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(received.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn unknown_ids_are_rejected() {
        let listener = RecordingListener::new();
        let manager = nebula_runtime::QueryManager::new(
            WorkerConfig::builder().worker_threads(1).build(),
            schema(),
            listener,
        );
        let worker = Worker::new(manager, Arc::new(DescriptorRegistry::new()), schema());

        assert!(matches!(
            worker.start_query(1, 1).await,
            Err(WorkerError::UnknownSharedQuery(1))
        ));
        assert!(matches!(
            worker.unregister_query(9).await,
            Err(WorkerError::UnknownSharedQuery(9))
        ));
    }
}
