use std::fmt;

/// Errors surfaced by the buffer pool and buffer control block.
///
/// `InvariantViolation` is never returned from pool/BCB operations
/// themselves (those panic, per the engine-wide convention) but is kept
/// here so callers one layer up (pipeline, runtime) can fold it into a
/// single error type without a second enum.
#[derive(Debug)]
pub enum BufferError {
    /// The pool's pooled capacity is exhausted and the caller asked for a
    /// non-blocking acquisition.
    PoolExhausted,
    /// An unpooled allocation of the requested size could not be satisfied
    /// against the configured unpooled budget.
    UnpooledBudgetExceeded { requested: usize, remaining: usize },
    /// A structural operation (`swap_segment`, `steal_data_segment`,
    /// `register_child`) was attempted while the segment was pinned.
    SegmentPinned,
    /// A child segment was addressed by a key that does not exist on this
    /// buffer, e.g. after the buffer was recycled and reused.
    UnknownChildKey(usize),
    /// `unregister_child` was attempted while more than one data holder is
    /// live, which would leave other holders with a dangling child key.
    ChildRemovalNotExclusive,
    /// `start_repinning` was called on a buffer that already has repinning
    /// in progress.
    RepinAlreadyInProgress,
    /// A structural operation refused to proceed because repinning is
    /// currently in flight and the operation could let a new reference
    /// escape during the spill.
    Repinning,
    /// `steal_data_segment` targeted a key the skip-spilling marker
    /// currently protects.
    SpillSkipped,
    /// The pool's shutdown signal fired while the caller was parked in
    /// `acquire_blocking`.
    ShuttingDown,
}

impl fmt::Display for BufferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PoolExhausted => write!(f, "buffer pool has no free segments"),
            Self::UnpooledBudgetExceeded {
                requested,
                remaining,
            } => write!(
                f,
                "unpooled allocation of {requested} bytes exceeds remaining budget of {remaining} bytes"
            ),
            Self::SegmentPinned => write!(f, "segment is pinned and cannot be mutated structurally"),
            Self::UnknownChildKey(idx) => write!(f, "no child segment at index {idx}"),
            Self::ChildRemovalNotExclusive => {
                write!(f, "unregister_child requires exclusive (data_count == 1) ownership")
            }
            Self::RepinAlreadyInProgress => write!(f, "repinning already in progress for this buffer"),
            Self::Repinning => write!(f, "operation refused: repinning is in progress for this buffer"),
            Self::SpillSkipped => write!(f, "segment is protected by the skip-spilling marker"),
            Self::ShuttingDown => write!(f, "buffer pool is shutting down"),
        }
    }
}

impl std::error::Error for BufferError {}
