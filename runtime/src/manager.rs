use std::sync::atomic::Ordering::{AcqRel, Acquire, Release};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use nebula_buffer::{BufferPool, PoolConfig, Schema};
use nebula_io::{EmitOutcome, Sink, Source};
use nebula_pipeline::{
    EngineError, ExecutionContext, QueryId, ReconfigurationMarker, StageId, StageInput,
    TerminationType, UpdateTarget,
};
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::config::WorkerConfig;
use crate::iqp::{Iqp, IqpSpec, SourceUpdate};
use crate::stage_chain::StageSlot;
use crate::status::{QueryEvent, QueryStatus, StatusListener};

/// The hub: owns the buffer pool and the table of live IQPs, and drives
/// every query through deploy/start/stop/fail/reconfigure/shutdown.
///
/// Each deployed query gets one bounded task queue. Source-polling tasks
/// feed it; a fixed number of dispatcher tasks drain it and push each item
/// through the stage chain to the sinks. Reconfiguration markers enter the
/// same queue as data, so a marker is processed in order relative to the
/// buffers produced before it.
pub struct QueryManager {
    config: WorkerConfig,
    pool: Arc<BufferPool>,
    iqps: Mutex<std::collections::HashMap<QueryId, Arc<Iqp>>>,
    listener: Arc<dyn StatusListener>,
    shutting_down: AtomicBool,
}

impl QueryManager {
    pub fn new(config: WorkerConfig, schema: Schema, listener: Arc<dyn StatusListener>) -> Arc<Self> {
        let pool = BufferPool::new(
            PoolConfig {
                buffer_size: config.buffer_size,
                pooled_buffer_count: config.total_buffer_budget / config.buffer_size.max(1),
                unpooled_budget: config.buffer_size * 4,
                leak_tracking: config.enable_leak_tracking,
            },
            schema,
        );
        tracing::info!(
            worker_threads = config.worker_threads,
            buffer_size = config.buffer_size,
            pooled_buffers = pool.config().pooled_buffer_count,
            "query manager online"
        );
        Arc::new(Self {
            config,
            pool,
            iqps: Mutex::new(std::collections::HashMap::new()),
            listener,
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Installs an IQP in state `Registered`, running each stage's
    /// `setup` synchronously (the Initialize step for stages). Sources
    /// open immediately on their polling tasks but withhold production
    /// until [`QueryManager::start`] has opened the sinks, so no buffer
    /// ever outruns an unopened sink.
    pub fn deploy(self: &Arc<Self>, spec: IqpSpec) -> Result<(), EngineError> {
        if self.shutting_down.load(Acquire) {
            return Err(EngineError::Cancelled);
        }
        let shard_count = self.config.worker_threads;
        let stages: Vec<StageSlot> = spec.stages.into_iter().map(|s| StageSlot::new(s, shard_count)).collect();

        let abort = AtomicBool::new(false);
        for (idx, stage) in stages.iter().enumerate() {
            let ctx = ExecutionContext::new(spec.query_id, StageId(idx as u64), &abort);
            stage.setup(&ctx)?;
        }

        let iqp = Arc::new(Iqp {
            query_id: spec.query_id,
            version: spec.version,
            status: Mutex::new(QueryStatus::Registered),
            started: AtomicBool::new(false),
            abort: AtomicBool::new(false),
            graceful_stop_requested: AtomicBool::new(false),
            outstanding: AtomicI64::new(0),
            total_sources: spec.sources.len(),
            sources_closed: AtomicUsize::new(0),
            sources_drained_gracefully: AtomicUsize::new(0),
            drain_forwarded: AtomicBool::new(false),
            control_tx: Mutex::new(None),
            markers_processed: AtomicU64::new(0),
            source_update: Mutex::new(None),
            source_updates_applied: AtomicU64::new(0),
            stages,
            sinks: AsyncMutex::new(spec.sinks),
            final_outcome: Mutex::new(None),
        });

        self.iqps.lock().expect("iqp table poisoned").insert(spec.query_id, iqp);
        tracing::info!(query_id = spec.query_id.0, version = spec.version, "query registered");
        self.listener.on_event(spec.query_id, QueryEvent::Registered);
        self.spawn_query(spec.query_id, spec.sources);
        Ok(())
    }

    fn get(&self, query_id: QueryId) -> Option<Arc<Iqp>> {
        self.iqps.lock().expect("iqp table poisoned").get(&query_id).cloned()
    }

    fn spawn_query(self: &Arc<Self>, query_id: QueryId, sources: Vec<Source>) {
        let iqp = self.get(query_id).expect("just inserted");
        let (tx, rx) = mpsc::channel::<StageInput>(self.config.per_query_buffer_quota.max(1));
        let rx = Arc::new(AsyncMutex::new(rx));
        *iqp.control_tx.lock().expect("control tx slot poisoned") = Some(tx.clone());

        for mut source in sources {
            let iqp = iqp.clone();
            let tx = tx.clone();
            let manager = self.clone();
            tokio::spawn(async move {
                if let Err(err) = source.open().await {
                    manager.fail(query_id, err.to_string());
                    iqp.sources_closed.fetch_add(1, AcqRel);
                    manager.check_termination(&iqp);
                    return;
                }
                while !iqp.started.load(Acquire)
                    && !iqp.abort.load(Acquire)
                    && !iqp.graceful_stop_requested.load(Acquire)
                {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
                let mut seen_update_generation = 0u64;
                loop {
                    if iqp.abort.load(Acquire) {
                        let _ = source.close(TerminationType::Hard).await;
                        let _ = tx.send(StageInput::Marker(ReconfigurationMarker::Drain(TerminationType::Hard))).await;
                        break;
                    }
                    if iqp.graceful_stop_requested.load(Acquire) {
                        let _ = source.close(TerminationType::Graceful).await;
                        let _ = tx
                            .send(StageInput::Marker(ReconfigurationMarker::Drain(TerminationType::Graceful)))
                            .await;
                        break;
                    }
                    let pending = {
                        let slot = iqp.source_update.lock().expect("source update slot poisoned");
                        slot.as_ref()
                            .filter(|u| u.generation > seen_update_generation)
                            .map(|u| (u.generation, u.descriptor.clone()))
                    };
                    if let Some((generation, descriptor)) = pending {
                        seen_update_generation = generation;
                        match source.update_version(descriptor).await {
                            Ok(()) => {
                                iqp.source_updates_applied.fetch_add(1, AcqRel);
                            }
                            Err(err) => {
                                manager.fail(query_id, err.to_string());
                                let _ = source.close(TerminationType::Failure).await;
                                let _ = tx
                                    .send(StageInput::Marker(ReconfigurationMarker::Drain(TerminationType::Failure)))
                                    .await;
                                break;
                            }
                        }
                    }
                    match source.poll_next().await {
                        Ok(Some(buf)) => {
                            iqp.outstanding.fetch_add(1, AcqRel);
                            if tx.send(StageInput::Data(buf)).await.is_err() {
                                break;
                            }
                        }
                        Ok(None) => {
                            let _ = source.close(TerminationType::Graceful).await;
                            let _ = tx
                                .send(StageInput::Marker(ReconfigurationMarker::Drain(TerminationType::Graceful)))
                                .await;
                            break;
                        }
                        Err(err) => {
                            manager.fail(query_id, err.to_string());
                            let _ = source.close(TerminationType::Failure).await;
                            let _ = tx
                                .send(StageInput::Marker(ReconfigurationMarker::Drain(TerminationType::Failure)))
                                .await;
                            break;
                        }
                    }
                }
                iqp.sources_closed.fetch_add(1, AcqRel);
                manager.check_termination(&iqp);
            });
        }
        drop(tx);

        // A chain with an order-sensitive stage gets exactly one dispatcher,
        // so buffers leave the queue in the order sources enqueued them;
        // fully shared chains fan out across the configured width.
        let dispatchers = if iqp.stages.iter().any(StageSlot::order_sensitive) {
            1
        } else {
            self.config.worker_threads
        };
        for _ in 0..dispatchers {
            let iqp = iqp.clone();
            let rx = rx.clone();
            let manager = self.clone();
            tokio::spawn(async move {
                loop {
                    let item = {
                        let mut guard = rx.lock().await;
                        guard.recv().await
                    };
                    let Some(item) = item else { break };
                    manager.dispatch(&iqp, item).await;
                }
            });
        }
    }

    async fn dispatch(self: &Arc<Self>, iqp: &Arc<Iqp>, item: StageInput) {
        let is_data = matches!(item, StageInput::Data(_));
        let is_control = matches!(
            &item,
            StageInput::Marker(marker) if !matches!(marker, ReconfigurationMarker::Drain(_))
        );
        // Graceful drains wait for every source to report in before they're
        // eligible to forward at all; Hard/Failure drains are eligible the
        // moment they arrive. Either way, only the first eligible drain
        // marker actually gets forwarded and tears the chain down; later
        // ones (other sources closing independently) are swallowed so
        // `teardown` runs exactly once per stage.
        let drain_kind = match &item {
            StageInput::Marker(ReconfigurationMarker::Drain(TerminationType::Graceful)) => {
                let seen = iqp.sources_drained_gracefully.fetch_add(1, AcqRel) + 1;
                (seen >= iqp.total_sources).then_some(TerminationType::Graceful)
            }
            StageInput::Marker(ReconfigurationMarker::Drain(kind)) => Some(*kind),
            _ => None,
        };
        let forward = match &item {
            StageInput::Data(_) => true,
            StageInput::Marker(ReconfigurationMarker::Drain(_)) => {
                drain_kind.is_some() && !iqp.drain_forwarded.swap(true, AcqRel)
            }
            StageInput::Marker(_) => true,
        };

        if forward {
            let mut items = vec![item];
            for (idx, stage) in iqp.stages.iter().enumerate() {
                let mut next: Vec<StageInput> = Vec::new();
                for input in items {
                    let ctx = ExecutionContext::new(iqp.query_id, StageId(idx as u64), &iqp.abort);
                    match stage.execute(&ctx, input) {
                        Ok(outputs) => next.extend(outputs.into_iter().map(StageInput::from)),
                        Err(err) => {
                            self.fail(iqp.query_id, err.to_string());
                            iqp.abort.store(true, Release);
                        }
                    }
                }
                if let Some(kind) = drain_kind {
                    let ctx = ExecutionContext::new(iqp.query_id, StageId(idx as u64), &iqp.abort);
                    match stage.teardown(&ctx) {
                        Ok(outputs) => {
                            if matches!(kind, TerminationType::Graceful) {
                                next.extend(outputs.into_iter().map(StageInput::from));
                            }
                        }
                        Err(err) => {
                            self.fail(iqp.query_id, err.to_string());
                            iqp.abort.store(true, Release);
                        }
                    }
                }
                items = next;
            }
            self.emit_to_sinks(iqp, items).await;
        }

        if is_data {
            iqp.outstanding.fetch_sub(1, AcqRel);
        }
        if is_control {
            iqp.markers_processed.fetch_add(1, AcqRel);
        }
        self.check_termination(iqp);
    }

    /// Holds the sink table lock across emission instead of draining it
    /// into an owned `Vec`: a second dispatcher task entering this function
    /// while an `await` is in flight must see the real table, not an empty
    /// one, or its buffer is dropped on the floor.
    async fn emit_to_sinks(self: &Arc<Self>, iqp: &Arc<Iqp>, items: Vec<StageInput>) {
        for item in items {
            match item {
                StageInput::Data(buf) => {
                    let mut sinks = iqp.sinks.lock().await;
                    let mut idx = 0;
                    while idx < sinks.len() {
                        let outcome = self.emit_with_retry(iqp, &mut sinks[idx], buf.clone()).await;
                        if matches!(outcome, EmitOutcome::Closed) {
                            sinks.remove(idx);
                        } else {
                            idx += 1;
                        }
                    }
                }
                StageInput::Marker(ReconfigurationMarker::Drain(kind)) => {
                    let mut sinks = iqp.sinks.lock().await;
                    for sink in sinks.iter_mut() {
                        let _ = sink.close(kind).await;
                    }
                }
                StageInput::Marker(ReconfigurationMarker::UpdateVersion {
                    target: UpdateTarget::Sinks,
                    descriptor,
                }) => {
                    let mut sinks = iqp.sinks.lock().await;
                    for sink in sinks.iter_mut() {
                        if let Err(err) = sink.update_version(descriptor.clone()).await {
                            self.fail(iqp.query_id, err.to_string());
                        }
                    }
                }
                StageInput::Marker(_) => {}
            }
        }
    }

    async fn emit_with_retry(
        self: &Arc<Self>,
        iqp: &Arc<Iqp>,
        sink: &mut Sink,
        buf: nebula_buffer::RecordBuffer,
    ) -> EmitOutcome {
        loop {
            match sink.try_emit(buf.clone()).await {
                Ok(EmitOutcome::RetryLater) => {
                    // Under a hard stop the buffer is droppable; don't spin
                    // against a backpressured endpoint during teardown.
                    if iqp.abort.load(Acquire) {
                        return EmitOutcome::Accepted;
                    }
                    tokio::time::sleep(self.config.sink_retry_delay).await;
                    continue;
                }
                Ok(outcome) => return outcome,
                Err(err) => {
                    tracing::warn!(query_id = iqp.query_id.0, error = %err, "sink failure while emitting buffer");
                    self.fail(iqp.query_id, err.to_string());
                    return EmitOutcome::Closed;
                }
            }
        }
    }

    fn check_termination(self: &Arc<Self>, iqp: &Arc<Iqp>) {
        if !iqp.is_terminal() {
            return;
        }
        let mut status = iqp.status.lock().expect("status lock poisoned");
        if matches!(*status, QueryStatus::Stopped | QueryStatus::Failed(_)) {
            return;
        }
        let outcome = iqp
            .final_outcome
            .lock()
            .expect("final outcome lock poisoned")
            .clone()
            .unwrap_or(QueryStatus::Stopped);
        *status = outcome.clone();
        drop(status);
        // Closing the control sender lets the dispatcher tasks observe
        // channel closure once the queue drains, so they exit instead of
        // idling on a dead query.
        *iqp.control_tx.lock().expect("control tx slot poisoned") = None;
        match outcome {
            QueryStatus::Stopped => {
                tracing::info!(query_id = iqp.query_id.0, "query stopped");
                self.listener.on_event(iqp.query_id, QueryEvent::Stopped);
            }
            QueryStatus::Failed(reason) => {
                tracing::warn!(query_id = iqp.query_id.0, reason = %reason, "query failed");
                self.listener.on_event(iqp.query_id, QueryEvent::Failed(reason));
            }
            _ => {}
        }
        self.iqps.lock().expect("iqp table poisoned").remove(&iqp.query_id);
    }

    /// Transitions Registered → Running. Sinks open first, then the
    /// source-polling tasks (already spawned and opened by `deploy`) are
    /// released to produce, so a stage that emits eagerly never outruns an
    /// unopened sink.
    pub async fn start(self: &Arc<Self>, query_id: QueryId) -> Result<(), EngineError> {
        let iqp = self
            .get(query_id)
            .ok_or_else(|| EngineError::StageFailure(format!("unknown query {}", query_id.0)))?;
        {
            let mut sinks = iqp.sinks.lock().await;
            let mut open_err = None;
            for sink in sinks.iter_mut() {
                if let Err(err) = sink.open().await {
                    open_err = Some(err);
                    break;
                }
            }
            drop(sinks);
            if let Some(err) = open_err {
                // The Failed event is delivered by check_termination once
                // the source tasks have observed the abort and closed.
                self.fail(query_id, err.to_string());
                return Err(err);
            }
        }
        *iqp.status.lock().expect("status lock poisoned") = QueryStatus::Running;
        tracing::info!(query_id = query_id.0, version = iqp.version, "query running");
        self.listener.on_event(query_id, QueryEvent::Running);
        // Release the sources only after the Running event is out, so the
        // listener can never observe a terminal event first.
        iqp.started.store(true, Release);
        Ok(())
    }

    pub fn stop(&self, query_id: QueryId, mode: TerminationType) {
        let Some(iqp) = self.get(query_id) else { return };
        tracing::debug!(query_id = query_id.0, ?mode, "stop requested");
        *iqp.final_outcome.lock().expect("final outcome lock poisoned") = Some(QueryStatus::Stopped);
        match mode {
            TerminationType::Graceful => iqp.graceful_stop_requested.store(true, Release),
            TerminationType::Hard | TerminationType::Failure => iqp.abort.store(true, Release),
        }
    }

    pub fn fail(&self, query_id: QueryId, reason: String) {
        let Some(iqp) = self.get(query_id) else { return };
        let mut status = iqp.status.lock().expect("status lock poisoned");
        if matches!(*status, QueryStatus::Failing | QueryStatus::Failed(_)) {
            return;
        }
        *status = QueryStatus::Failing;
        drop(status);
        tracing::debug!(query_id = query_id.0, reason = %reason, "query failing");
        *iqp.final_outcome.lock().expect("final outcome lock poisoned") = Some(QueryStatus::Failed(reason));
        iqp.abort.store(true, Release);
    }

    /// Injects a reconfiguration marker and resolves once every component
    /// has processed it.
    ///
    /// A marker targeting the sources is applied by each source-polling
    /// task between buffer productions; this call waits until every
    /// still-open source has rebound. Any other marker enters the query's
    /// task queue behind the data produced before it, travels the stage
    /// chain like a buffer, is applied to the sinks when it exits, and
    /// this call waits for that exit.
    pub async fn reconfigure(&self, query_id: QueryId, marker: ReconfigurationMarker) -> Result<(), EngineError> {
        let iqp = self
            .get(query_id)
            .ok_or_else(|| EngineError::StageFailure(format!("unknown query {}", query_id.0)))?;
        match marker {
            ReconfigurationMarker::UpdateVersion {
                target: UpdateTarget::Sources,
                descriptor,
            } => {
                let before = iqp.source_updates_applied.load(Acquire);
                {
                    let mut slot = iqp.source_update.lock().expect("source update slot poisoned");
                    let generation = slot.as_ref().map(|u| u.generation).unwrap_or(0) + 1;
                    tracing::debug!(query_id = query_id.0, generation, "source version update staged");
                    *slot = Some(SourceUpdate { generation, descriptor });
                }
                loop {
                    if iqp.abort.load(Acquire) {
                        return Err(EngineError::Cancelled);
                    }
                    let applied = (iqp.source_updates_applied.load(Acquire) - before) as usize;
                    let closed = iqp.sources_closed.load(Acquire).min(iqp.total_sources);
                    if applied >= iqp.total_sources - closed {
                        return Ok(());
                    }
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
            }
            marker => {
                let tx = iqp
                    .control_tx
                    .lock()
                    .expect("control tx slot poisoned")
                    .clone()
                    .ok_or(EngineError::Cancelled)?;
                let before = iqp.markers_processed.load(Acquire);
                tx.send(StageInput::Marker(marker))
                    .await
                    .map_err(|_| EngineError::Cancelled)?;
                loop {
                    if iqp.markers_processed.load(Acquire) > before {
                        return Ok(());
                    }
                    if iqp.abort.load(Acquire) {
                        return Err(EngineError::Cancelled);
                    }
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
            }
        }
    }

    /// Hard-stops every live IQP and waits until the table drains.
    pub async fn shutdown(self: &Arc<Self>) {
        self.shutting_down.store(true, Release);
        let ids: Vec<QueryId> = self.iqps.lock().expect("iqp table poisoned").keys().copied().collect();
        tracing::info!(live_queries = ids.len(), "shutting down");
        for id in ids {
            self.stop(id, TerminationType::Hard);
        }
        while !self.iqps.lock().expect("iqp table poisoned").is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.pool.shutdown();
    }
}
