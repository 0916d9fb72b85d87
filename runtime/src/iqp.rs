use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize};
use std::sync::Mutex;

use nebula_io::Sink;
use nebula_pipeline::{PipelineStage, QueryId, StageInput};
use tokio::sync::{mpsc, Mutex as AsyncMutex};

use crate::stage_chain::StageSlot;
use crate::status::QueryStatus;

/// What the caller hands to [`crate::QueryManager::deploy`]: the
/// decomposed query plan's components, already constructed (via
/// `nebula_io`'s factories) from the coordinator's descriptors.
/// `query_id` doubles as the decomposed-plan identifier; `version` is the
/// plan version the coordinator assigned.
pub struct IqpSpec {
    pub query_id: QueryId,
    pub version: u64,
    pub sources: Vec<nebula_io::Source>,
    pub stages: Vec<Box<dyn PipelineStage>>,
    pub sinks: Vec<Sink>,
}

/// A pending source rebind, picked up by each source-polling task between
/// buffer productions. The generation lets every source apply the same
/// update exactly once.
pub struct SourceUpdate {
    pub generation: u64,
    pub descriptor: String,
}

/// Runtime state for one instantiated query plan. Shared (`Arc`) across
/// the source-polling tasks and dispatcher tasks spawned for this query.
pub struct Iqp {
    pub query_id: QueryId,
    pub version: u64,
    pub status: Mutex<QueryStatus>,
    /// Gates source production: sources open during deploy but hold their
    /// first buffer until `start` has opened the sinks and flipped this.
    pub started: AtomicBool,
    pub abort: AtomicBool,
    pub graceful_stop_requested: AtomicBool,
    pub outstanding: AtomicI64,
    pub total_sources: usize,
    pub sources_closed: AtomicUsize,
    pub sources_drained_gracefully: AtomicUsize,
    /// Set by the first drain marker (of any termination kind) forwarded
    /// through the stage chain, so `teardown` runs exactly once per query
    /// even when multiple sources close independently.
    pub drain_forwarded: AtomicBool,
    /// A sender into this query's task queue, kept so reconfiguration
    /// markers enter the same queue as data and are processed in order
    /// relative to it. Cleared when the query reaches a terminal state so
    /// the dispatcher tasks can observe channel closure and exit.
    pub control_tx: Mutex<Option<mpsc::Sender<StageInput>>>,
    /// Count of reconfiguration markers that have fully exited the chain,
    /// watched by [`crate::QueryManager::reconfigure`].
    pub markers_processed: AtomicU64,
    pub source_update: Mutex<Option<SourceUpdate>>,
    pub source_updates_applied: AtomicU64,
    pub stages: Vec<StageSlot>,
    pub sinks: AsyncMutex<Vec<Sink>>,
    pub final_outcome: Mutex<Option<QueryStatus>>,
}

impl Iqp {
    pub fn is_terminal(&self) -> bool {
        use std::sync::atomic::Ordering::Acquire;
        self.sources_closed.load(Acquire) >= self.total_sources && self.outstanding.load(Acquire) <= 0
    }
}
