/// Identifies one instantiated query plan running on this worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryId(pub u64);

/// Identifies one stage (source, pipeline stage, or sink) within an IQP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StageId(pub u64);

/// The three ways a component's input stream can end, carried by the EoS
/// a source observes and by the corresponding reconfiguration propagated
/// downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminationType {
    /// Downstream state is flushed and final output emitted before close.
    Graceful,
    /// Downstream state is discarded; buffers in flight may be dropped.
    Hard,
    /// Like `Hard`, but the owning IQP's status becomes `Failed`.
    Failure,
}

/// Which end of a query a version update rebinds: its sources or its
/// sinks. A descriptor payload is meaningless without knowing which side
/// it re-describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateTarget {
    Sources,
    Sinks,
}

/// In-band control record propagated alongside data buffers to drive
/// drain, version updates, and structural teardown.
#[derive(Debug, Clone)]
pub enum ReconfigurationMarker {
    /// Sent once per component before any data task.
    Initialize,
    /// End-of-stream notification; the termination type determines flush
    /// behavior.
    Drain(TerminationType),
    /// A source or sink descriptor changed; carries an opaque descriptor
    /// payload the matching factory or transport understands.
    UpdateVersion {
        target: UpdateTarget,
        descriptor: String,
    },
    /// Torn down only after every data task targeting the component has
    /// completed.
    Destroy,
}
