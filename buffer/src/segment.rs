use bytes::BytesMut;

/// A handle to the storage backing one data segment.
///
/// A segment never owns its lifetime decisions; the [`BufferControlBlock`](crate::BufferControlBlock)
/// that references it does, via its pinned/data counters. `Segment` itself
/// is just the payload: either the bytes are resident in memory, or the
/// segment has been spilled and is addressed by a storage key.
#[derive(Debug)]
pub enum Segment {
    Memory(BytesMut),
    Spilled { key: String, len: usize },
}

impl Segment {
    pub fn zeroed(len: usize) -> Self {
        Segment::Memory(BytesMut::zeroed(len))
    }

    pub fn from_bytes(bytes: &[u8]) -> Self {
        Segment::Memory(BytesMut::from(bytes))
    }

    pub fn len(&self) -> usize {
        match self {
            Segment::Memory(bytes) => bytes.len(),
            Segment::Spilled { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_resident(&self) -> bool {
        matches!(self, Segment::Memory(_))
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Segment::Memory(bytes) => Some(bytes),
            Segment::Spilled { .. } => None,
        }
    }

    pub fn as_bytes_mut(&mut self) -> Option<&mut [u8]> {
        match self {
            Segment::Memory(bytes) => Some(bytes),
            Segment::Spilled { .. } => None,
        }
    }
}
