use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use nebula_buffer::{BufferPool, FieldType, RecordBuffer, Schema};
use nebula_io::{NetworkSink, NetworkSource, Sink, Source, TestSink, TestSource};
use nebula_pipeline::stages::IdentityStage;
use nebula_pipeline::{QueryId, ReconfigurationMarker, TerminationType, UpdateTarget};
use nebula_runtime::{IqpSpec, QueryEvent, QueryManager, RecordingListener, WorkerConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

fn schema() -> Schema {
    Schema::builder().field("id", FieldType::I64).build()
}

fn identified_buffer(pool: &Arc<BufferPool>, id: i64, seq: u64) -> RecordBuffer {
    let buf = pool.acquire().expect("test pool exhausted");
    buf.write_main(|bytes| bytes[..8].copy_from_slice(&id.to_le_bytes()));
    buf.set_sequence_number(seq);
    buf
}

fn buffer_id(buf: &RecordBuffer) -> i64 {
    let bytes = buf.read_main().expect("buffer must be resident");
    i64::from_le_bytes(bytes[..8].try_into().unwrap())
}

/// Polls `f` until it returns `Some`, or panics once `timeout` elapses.
async fn wait_for<T>(timeout: Duration, mut f: impl FnMut() -> Option<T>) -> T {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Some(value) = f() {
            return value;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition did not become true within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

fn has_event(listener: &RecordingListener, query_id: QueryId, event: &QueryEvent) -> bool {
    listener.events_for(query_id).iter().any(|e| e == event)
}

#[tokio::test]
async fn single_source_single_sink_graceful_drain() {
    let listener = RecordingListener::new();
    let manager = QueryManager::new(WorkerConfig::builder().worker_threads(2).build(), schema(), listener.clone());
    let pool = manager.pool().clone();
    let query_id = QueryId(1);

    let buffers: Vec<RecordBuffer> = (0..4).map(|i| identified_buffer(&pool, 23, i)).collect();
    let sink = TestSink::new();
    let received = sink.received_handle();

    manager
        .deploy(IqpSpec {
            query_id,
            version: 1,
            sources: vec![Source::Test(TestSource::new(buffers))],
            stages: vec![Box::new(IdentityStage)],
            sinks: vec![Sink::Test(sink)],
        })
        .unwrap();
    manager.start(query_id).await.unwrap();

    wait_for(Duration::from_secs(2), || has_event(&listener, query_id, &QueryEvent::Stopped).then_some(())).await;

    let received = received.lock().unwrap();
    assert_eq!(received.len(), 4);
    assert!(received.iter().all(|b| buffer_id(b) == 23));

    let events = listener.events_for(query_id);
    assert_eq!(
        events,
        vec![QueryEvent::Registered, QueryEvent::Running, QueryEvent::Stopped]
    );
}

#[tokio::test]
async fn source_failure_fails_the_query() {
    let listener = RecordingListener::new();
    let manager = QueryManager::new(WorkerConfig::builder().worker_threads(2).build(), schema(), listener.clone());
    let pool = manager.pool().clone();
    let query_id = QueryId(1);

    let buffers: Vec<RecordBuffer> = (0..4).map(|i| identified_buffer(&pool, 23, i)).collect();
    let source = TestSource::new(buffers).fail_after(1);
    let sink = TestSink::new();
    let received = sink.received_handle();

    manager
        .deploy(IqpSpec {
            query_id,
            version: 1,
            sources: vec![Source::Test(source)],
            stages: vec![Box::new(IdentityStage)],
            sinks: vec![Sink::Test(sink)],
        })
        .unwrap();
    manager.start(query_id).await.unwrap();

    wait_for(Duration::from_secs(2), || {
        listener
            .events_for(query_id)
            .iter()
            .any(|e| matches!(e, QueryEvent::Failed(_)))
            .then_some(())
    })
    .await;

    assert_eq!(received.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn source_failure_during_open_fails_without_running() {
    // Bind then drop a listener so the port actively refuses connections.
    let refused = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = refused.local_addr().unwrap();
    drop(refused);

    let listener = RecordingListener::new();
    let manager = QueryManager::new(WorkerConfig::builder().worker_threads(1).build(), schema(), listener.clone());
    let pool = manager.pool().clone();
    let query_id = QueryId(1);

    manager
        .deploy(IqpSpec {
            query_id,
            version: 1,
            sources: vec![Source::Network(NetworkSource::new(addr, pool, 0))],
            stages: vec![Box::new(IdentityStage)],
            sinks: vec![Sink::Test(TestSink::new())],
        })
        .unwrap();

    wait_for(Duration::from_secs(2), || {
        listener
            .events_for(query_id)
            .iter()
            .any(|e| matches!(e, QueryEvent::Failed(_)))
            .then_some(())
    })
    .await;

    assert!(!has_event(&listener, query_id, &QueryEvent::Running));
}

#[tokio::test]
async fn many_sources_staggered_eos() {
    let listener = RecordingListener::new();
    let manager = QueryManager::new(WorkerConfig::builder().worker_threads(1).build(), schema(), listener.clone());
    let pool = manager.pool().clone();
    let query_id = QueryId(1);

    let source_a: Vec<RecordBuffer> = (0..2).map(|i| identified_buffer(&pool, 1, i)).collect();
    let source_b: Vec<RecordBuffer> = (0..4).map(|i| identified_buffer(&pool, 2, i)).collect();
    let sink = TestSink::new();
    let received = sink.received_handle();

    manager
        .deploy(IqpSpec {
            query_id,
            version: 1,
            sources: vec![
                Source::Test(TestSource::new(source_a)),
                Source::Test(TestSource::new(source_b).with_delay(Duration::from_millis(20))),
            ],
            stages: vec![Box::new(IdentityStage)],
            sinks: vec![Sink::Test(sink)],
        })
        .unwrap();
    manager.start(query_id).await.unwrap();

    wait_for(Duration::from_secs(2), || has_event(&listener, query_id, &QueryEvent::Stopped).then_some(())).await;

    assert_eq!(received.lock().unwrap().len(), 6);
}

#[tokio::test]
async fn hard_stop_mid_flight_terminates_promptly() {
    let listener = RecordingListener::new();
    let manager = QueryManager::new(WorkerConfig::builder().worker_threads(2).build(), schema(), listener.clone());
    let pool = manager.pool().clone();
    let query_id = QueryId(1);

    let buffers: Vec<RecordBuffer> = (0..200).map(|i| identified_buffer(&pool, 7, i)).collect();
    let source = TestSource::new(buffers).with_delay(Duration::from_millis(5));
    let sink = TestSink::new();
    let received = sink.received_handle();

    manager
        .deploy(IqpSpec {
            query_id,
            version: 1,
            sources: vec![Source::Test(source)],
            stages: vec![Box::new(IdentityStage)],
            sinks: vec![Sink::Test(sink)],
        })
        .unwrap();
    manager.start(query_id).await.unwrap();

    wait_for(Duration::from_secs(2), || (received.lock().unwrap().len() >= 1).then_some(())).await;
    manager.stop(query_id, TerminationType::Hard);

    wait_for(Duration::from_secs(1), || has_event(&listener, query_id, &QueryEvent::Stopped).then_some(())).await;
}

#[tokio::test]
async fn network_sink_version_update_rebinds_without_failing() {
    async fn accept_and_drain(listener: TcpListener) {
        if let Ok((mut stream, _)) = listener.accept().await {
            let mut buf = [0u8; 256];
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(_) => continue,
                }
            }
        }
    }

    let listener_x = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr_x: SocketAddr = listener_x.local_addr().unwrap();
    let listener_y = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr_y: SocketAddr = listener_y.local_addr().unwrap();
    tokio::spawn(accept_and_drain(listener_x));
    tokio::spawn(accept_and_drain(listener_y));

    let status_listener = RecordingListener::new();
    let manager = QueryManager::new(
        WorkerConfig::builder().worker_threads(1).build(),
        schema(),
        status_listener.clone(),
    );
    let pool = manager.pool().clone();
    let query_id = QueryId(1);

    let buffers: Vec<RecordBuffer> = (0..10).map(|i| identified_buffer(&pool, 9, i)).collect();
    let source = TestSource::new(buffers).with_delay(Duration::from_millis(20));

    manager
        .deploy(IqpSpec {
            query_id,
            version: 1,
            sources: vec![Source::Test(source)],
            stages: vec![Box::new(IdentityStage)],
            sinks: vec![Sink::Network(NetworkSink::new(addr_x))],
        })
        .unwrap();
    manager.start(query_id).await.unwrap();

    tokio::time::sleep(Duration::from_millis(40)).await;
    manager
        .reconfigure(
            query_id,
            ReconfigurationMarker::UpdateVersion {
                target: UpdateTarget::Sinks,
                descriptor: addr_y.to_string(),
            },
        )
        .await
        .unwrap();

    wait_for(Duration::from_secs(2), || has_event(&status_listener, query_id, &QueryEvent::Stopped).then_some(())).await;

    assert!(!status_listener
        .events_for(query_id)
        .iter()
        .any(|e| matches!(e, QueryEvent::Failed(_))));
}

#[tokio::test]
async fn network_source_version_update_rebinds_midstream() {
    // The first endpoint drips data until the source walks away; the
    // second serves a short burst and closes, draining the query.
    async fn drip_until_disconnect(listener: TcpListener) {
        if let Ok((mut stream, _)) = listener.accept().await {
            loop {
                if stream.write_all(&[1u8; 32]).await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
    }

    async fn serve_burst_then_close(listener: TcpListener) {
        if let Ok((mut stream, _)) = listener.accept().await {
            for _ in 0..3 {
                if stream.write_all(&[2u8; 32]).await.is_err() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
    }

    let listener_x = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr_x: SocketAddr = listener_x.local_addr().unwrap();
    let listener_y = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr_y: SocketAddr = listener_y.local_addr().unwrap();
    tokio::spawn(drip_until_disconnect(listener_x));
    tokio::spawn(serve_burst_then_close(listener_y));

    let status_listener = RecordingListener::new();
    let manager = QueryManager::new(
        WorkerConfig::builder().worker_threads(2).build(),
        schema(),
        status_listener.clone(),
    );
    let pool = manager.pool().clone();
    let query_id = QueryId(1);

    let sink = TestSink::new();
    let received = sink.received_handle();

    manager
        .deploy(IqpSpec {
            query_id,
            version: 1,
            sources: vec![Source::Network(NetworkSource::new(addr_x, pool.clone(), 0))],
            stages: vec![Box::new(IdentityStage)],
            sinks: vec![Sink::Test(sink)],
        })
        .unwrap();
    manager.start(query_id).await.unwrap();

    wait_for(Duration::from_secs(2), || (received.lock().unwrap().len() >= 1).then_some(())).await;
    manager
        .reconfigure(
            query_id,
            ReconfigurationMarker::UpdateVersion {
                target: UpdateTarget::Sources,
                descriptor: addr_y.to_string(),
            },
        )
        .await
        .unwrap();

    wait_for(Duration::from_secs(2), || has_event(&status_listener, query_id, &QueryEvent::Stopped).then_some(())).await;

    assert!(!status_listener
        .events_for(query_id)
        .iter()
        .any(|e| matches!(e, QueryEvent::Failed(_))));
    assert!(received.lock().unwrap().len() >= 2);
}

/// Pass-through stage that demands serialized, in-order dispatch.
struct OrderedIdentity;

impl nebula_pipeline::PipelineStage for OrderedIdentity {
    fn concurrency_mode(&self) -> nebula_pipeline::ConcurrencyMode {
        nebula_pipeline::ConcurrencyMode::SingleThreaded
    }

    fn execute(
        &self,
        _ctx: &nebula_pipeline::ExecutionContext<'_>,
        input: nebula_pipeline::StageInput,
    ) -> Result<Vec<nebula_pipeline::StageOutput>, nebula_pipeline::EngineError> {
        Ok(match input {
            nebula_pipeline::StageInput::Data(buf) => vec![nebula_pipeline::StageOutput::Data(buf)],
            nebula_pipeline::StageInput::Marker(m) => vec![nebula_pipeline::StageOutput::Marker(m)],
        })
    }
}

#[tokio::test]
async fn single_threaded_stage_preserves_source_order() {
    let listener = RecordingListener::new();
    let manager = QueryManager::new(WorkerConfig::builder().worker_threads(4).build(), schema(), listener.clone());
    let pool = manager.pool().clone();
    let query_id = QueryId(1);

    let buffers: Vec<RecordBuffer> = (0..50).map(|i| identified_buffer(&pool, 5, i)).collect();
    let sink = TestSink::new();
    let received = sink.received_handle();

    manager
        .deploy(IqpSpec {
            query_id,
            version: 1,
            sources: vec![Source::Test(TestSource::new(buffers))],
            stages: vec![Box::new(OrderedIdentity)],
            sinks: vec![Sink::Test(sink)],
        })
        .unwrap();
    manager.start(query_id).await.unwrap();

    wait_for(Duration::from_secs(2), || has_event(&listener, query_id, &QueryEvent::Stopped).then_some(())).await;

    let received = received.lock().unwrap();
    let sequences: Vec<u64> = received.iter().map(|b| b.sequence_number()).collect();
    assert_eq!(sequences, (0..50).collect::<Vec<u64>>());
}

#[tokio::test]
async fn shutdown_drains_many_concurrent_queries() {
    let listener = RecordingListener::new();
    let manager = QueryManager::new(WorkerConfig::builder().worker_threads(4).build(), schema(), listener.clone());
    let pool = manager.pool().clone();

    for q in 0..10u64 {
        let query_id = QueryId(q);
        let sources = (0..10u64)
            .map(|s| {
                let buffers: Vec<RecordBuffer> = (0..5)
                    .map(|i| identified_buffer(&pool, (q * 100 + s) as i64, i))
                    .collect();
                Source::Test(TestSource::new(buffers).with_delay(Duration::from_millis(2)))
            })
            .collect();
        manager
            .deploy(IqpSpec {
                query_id,
                version: 1,
                sources,
                stages: vec![Box::new(IdentityStage)],
                sinks: vec![Sink::Test(TestSink::new())],
            })
            .unwrap();
        manager.start(query_id).await.unwrap();
    }

    manager.shutdown().await;

    for q in 0..10u64 {
        assert!(has_event(&listener, QueryId(q), &QueryEvent::Stopped));
    }

    // Once every query object is torn down, every buffer it pinned must
    // find its way back to the pool's free list.
    let total = pool.config().pooled_buffer_count;
    wait_for(Duration::from_secs(2), || (pool.pooled_available() == total).then_some(())).await;
}
