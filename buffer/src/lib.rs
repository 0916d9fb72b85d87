//! Pooled, reference-counted record buffers.
//!
//! A [`BufferPool`] owns a fixed region of memory divided into
//! equally-sized [`Segment`]s. A [`RecordBuffer`] pairs one
//! [`BufferControlBlock`] with a [`Schema`] and is the unit of data flow
//! handed between sources, pipeline stages, and sinks.

#![forbid(unsafe_code)]

mod bcb;
mod error;
mod pool;
mod record_buffer;
mod schema;
mod segment;

pub use bcb::{
    BufferControlBlock, ChildKey, MainSegmentView, ReclaimedSegments, RepinGuard, SegmentKey,
    SegmentRecycler, UniqueSegmentGuard,
};
pub use error::BufferError;
pub use pool::{BufferPool, PoolConfig};
pub use record_buffer::{DataHandle, RecordBuffer};
pub use schema::{FieldType, Schema};
pub use segment::Segment;
