use std::sync::Arc;

use nebula_buffer::{FieldType, Schema};
use nebula_io::DescriptorRegistry;
use nebula_runtime::{QueryManager, RecordingListener, WorkerConfig};
use nebula_worker::{
    FileSinkFactory, FileSourceFactory, NetworkSinkFactory, NetworkSourceFactory, StdoutSinkFactory, Worker,
};

/// Record layout for buffers flowing through this worker process. A real
/// deployment would derive this per shared query from the coordinator's
/// plan instead of fixing it at process startup; that per-query schema
/// negotiation is out of scope here (see DESIGN.md).
fn default_schema() -> Schema {
    Schema::builder()
        .field("timestamp", FieldType::U64)
        .field("value", FieldType::F64)
        .build()
}

fn registry() -> DescriptorRegistry {
    let mut registry = DescriptorRegistry::new();
    registry.register_source("network", Arc::new(NetworkSourceFactory));
    registry.register_source("file", Arc::new(FileSourceFactory));
    registry.register_sink("network", Arc::new(NetworkSinkFactory));
    registry.register_sink("file", Arc::new(FileSinkFactory));
    registry.register_sink("stdout", Arc::new(StdoutSinkFactory));
    registry
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = WorkerConfig::builder().build();
    let listener = RecordingListener::new();
    let manager = QueryManager::new(config, default_schema(), listener);
    let _worker = Worker::new(manager.clone(), Arc::new(registry()), default_schema());

    tracing::info!("worker online, awaiting coordinator RPCs and shutdown signal");
    nebula_worker::wait_for_shutdown_signal().await;

    tracing::info!("shutting down, draining live queries");
    manager.shutdown().await;
}
