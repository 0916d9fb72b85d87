use std::sync::Arc;

use crate::bcb::{BufferControlBlock, ChildKey};
use crate::schema::Schema;

/// A cheap-to-copy handle to one buffer's data, pinned for the handle's
/// lifetime. This is the type pipeline stages, sources, and sinks pass
/// around: cloning it bumps both the pinned and data counters, and
/// dropping it releases both.
pub struct RecordBuffer {
    bcb: Arc<BufferControlBlock>,
    schema: Arc<Schema>,
}

impl RecordBuffer {
    pub(crate) fn new(bcb: Arc<BufferControlBlock>, schema: Arc<Schema>) -> Self {
        Self { bcb, schema }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn control_block(&self) -> &BufferControlBlock {
        &self.bcb
    }

    pub fn num_tuples(&self) -> u64 {
        self.bcb.num_tuples()
    }

    pub fn set_num_tuples(&self, value: u64) {
        self.bcb.set_num_tuples(value);
    }

    pub fn watermark(&self) -> u64 {
        self.bcb.watermark()
    }

    pub fn set_watermark(&self, value: u64) {
        self.bcb.set_watermark(value);
    }

    pub fn sequence_number(&self) -> u64 {
        self.bcb.sequence_number()
    }

    pub fn set_sequence_number(&self, value: u64) {
        self.bcb.set_sequence_number(value);
    }

    pub fn chunk_number(&self) -> u64 {
        self.bcb.chunk_number()
    }

    pub fn is_last_chunk(&self) -> bool {
        self.bcb.is_last_chunk()
    }

    pub fn origin_id(&self) -> u64 {
        self.bcb.origin_id()
    }

    pub fn set_origin_id(&self, value: u64) {
        self.bcb.set_origin_id(value);
    }

    /// `None` if the structural lock is unavailable right now (genuine
    /// contention, or a repin in flight), in which case the caller may
    /// retry.
    pub fn store_var_sized(&self, bytes: &[u8]) -> Option<ChildKey> {
        self.bcb.register_child(crate::segment::Segment::from_bytes(bytes))
    }

    pub fn load_var_sized(&self, key: ChildKey) -> Option<Vec<u8>> {
        self.bcb.child_bytes(key)
    }

    /// Write into the main segment's bytes, returning whatever `f` returns
    /// (typically the number of bytes written).
    pub fn write_main<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        self.bcb.with_main_mut(f)
    }

    /// Copy out the main segment's bytes, if resident.
    pub fn read_main(&self) -> Option<Vec<u8>> {
        self.bcb
            .try_lock_shared()
            .and_then(|view| view.segment().and_then(|s| s.as_bytes().map(|b| b.to_vec())))
    }

    /// Downgrade to a handle that only asserts data-liveness (the buffer's
    /// identity survives) without requiring it stay memory-resident. Used
    /// by bookkeeping that tracks in-flight buffers without caring whether
    /// the payload has been spilled.
    pub fn downgrade(self) -> DataHandle {
        self.bcb.data_retain();
        DataHandle {
            bcb: self.bcb.clone(),
        }
    }
}

impl Clone for RecordBuffer {
    fn clone(&self) -> Self {
        self.bcb.pinned_retain();
        self.bcb.data_retain();
        Self {
            bcb: self.bcb.clone(),
            schema: self.schema.clone(),
        }
    }
}

impl Drop for RecordBuffer {
    fn drop(&mut self) {
        self.bcb.pinned_release();
        self.bcb.data_release();
    }
}

/// A data-only reference: keeps a buffer's identity alive for accounting
/// purposes (e.g. outstanding-buffer counters) without requiring
/// residency. Holds one data retain, released on drop.
pub struct DataHandle {
    bcb: Arc<BufferControlBlock>,
}

impl Clone for DataHandle {
    fn clone(&self) -> Self {
        self.bcb.data_retain();
        Self {
            bcb: self.bcb.clone(),
        }
    }
}

impl Drop for DataHandle {
    fn drop(&mut self) {
        self.bcb.data_release();
    }
}
