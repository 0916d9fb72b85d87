use std::sync::{Arc, Mutex, Weak};

use nebula_collections::SegmentRing;
use tokio::sync::Semaphore;

use crate::bcb::{BufferControlBlock, ReclaimedSegments, SegmentRecycler};
use crate::error::BufferError;
use crate::record_buffer::RecordBuffer;
use crate::schema::Schema;
use crate::segment::Segment;

#[derive(Debug, Clone, Copy)]
pub struct PoolConfig {
    pub buffer_size: usize,
    pub pooled_buffer_count: usize,
    pub unpooled_budget: usize,
    /// Whether buffers handed out by this pool record `pinned_retain`
    /// call sites so [`BufferPool::shutdown`] can report leaks.
    pub leak_tracking: bool,
}

struct FreeList {
    ring: SegmentRing<Segment>,
}

/// A bounded region of memory divided into equally-sized segments, handed
/// out as [`RecordBuffer`]s and reclaimed automatically when the last
/// reference drops.
///
/// Modeled on a connection pool's acquire/release discipline: a
/// [`Semaphore`] gates how many pooled segments can be outstanding at once
/// (`acquire_blocking` parks rather than erroring when the pool is
/// drained), and a mutex-guarded free list supplies the actual storage.
/// Unpooled allocations bypass both: they're tracked only against a byte
/// budget and are never returned to the free list.
pub struct BufferPool {
    config: PoolConfig,
    free: Mutex<FreeList>,
    semaphore: Semaphore,
    unpooled_outstanding: Mutex<usize>,
    schema: Arc<Schema>,
    outstanding: Mutex<Vec<Weak<BufferControlBlock>>>,
}

impl BufferPool {
    pub fn new(config: PoolConfig, schema: Schema) -> Arc<Self> {
        let mut ring = SegmentRing::with_capacity(config.pooled_buffer_count);
        for _ in 0..config.pooled_buffer_count {
            ring.push(Segment::zeroed(config.buffer_size))
                .expect("ring sized to pooled_buffer_count");
        }
        Arc::new(Self {
            config,
            free: Mutex::new(FreeList { ring }),
            semaphore: Semaphore::new(config.pooled_buffer_count),
            unpooled_outstanding: Mutex::new(0),
            schema: Arc::new(schema),
            outstanding: Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> PoolConfig {
        self.config
    }

    /// Non-blocking acquisition from the pooled free list.
    pub fn acquire(self: &Arc<Self>) -> Result<RecordBuffer, BufferError> {
        let permit = self
            .semaphore
            .try_acquire()
            .map_err(|_| BufferError::PoolExhausted)?;
        permit.forget();
        let segment = {
            let mut free = self.free.lock().expect("pool lock poisoned");
            free.ring.pop().expect("semaphore accounting out of sync with free list")
        };
        Ok(self.wrap(segment))
    }

    /// Blocking acquisition: waits for a segment to be returned to the
    /// free list rather than failing immediately. Unblocks with
    /// [`BufferError::ShuttingDown`] once [`BufferPool::shutdown`] has
    /// closed the pool.
    pub async fn acquire_blocking(self: &Arc<Self>) -> Result<RecordBuffer, BufferError> {
        let permit = self
            .semaphore
            .acquire()
            .await
            .map_err(|_| BufferError::ShuttingDown)?;
        permit.forget();
        let segment = {
            let mut free = self.free.lock().expect("pool lock poisoned");
            free.ring.pop().expect("semaphore accounting out of sync with free list")
        };
        Ok(self.wrap(segment))
    }

    /// Allocate a one-off, oversized segment outside the pooled capacity.
    /// Charged against `unpooled_budget` and never returned to the free
    /// list; it's simply dropped (and the budget released) when the last
    /// reference to the buffer goes away.
    pub fn acquire_unpooled(self: &Arc<Self>, size: usize) -> Result<RecordBuffer, BufferError> {
        {
            let mut outstanding = self.unpooled_outstanding.lock().expect("pool lock poisoned");
            let remaining = self.config.unpooled_budget.saturating_sub(*outstanding);
            if size > remaining {
                return Err(BufferError::UnpooledBudgetExceeded {
                    requested: size,
                    remaining,
                });
            }
            *outstanding += size;
        }
        let recycler: Arc<dyn SegmentRecycler> = Arc::new(UnpooledRecycler {
            pool: self.clone(),
            size,
        });
        let bcb = Arc::new(BufferControlBlock::with_leak_tracking(
            Segment::zeroed(size),
            recycler,
            unix_micros(),
            self.config.leak_tracking,
        ));
        self.track(&bcb);
        Ok(RecordBuffer::new(bcb, self.schema.clone()))
    }

    pub fn pooled_available(&self) -> usize {
        self.free.lock().expect("pool lock poisoned").ring.len()
    }

    pub fn unpooled_outstanding(&self) -> usize {
        *self.unpooled_outstanding.lock().expect("pool lock poisoned")
    }

    fn wrap(self: &Arc<Self>, segment: Segment) -> RecordBuffer {
        let recycler: Arc<dyn SegmentRecycler> = Arc::new(PooledRecycler { pool: self.clone() });
        let bcb = Arc::new(BufferControlBlock::with_leak_tracking(
            segment,
            recycler,
            unix_micros(),
            self.config.leak_tracking,
        ));
        self.track(&bcb);
        RecordBuffer::new(bcb, self.schema.clone())
    }

    fn track(&self, bcb: &Arc<BufferControlBlock>) {
        if !self.config.leak_tracking {
            return;
        }
        let mut outstanding = self.outstanding.lock().expect("pool lock poisoned");
        outstanding.retain(|weak| weak.strong_count() > 0);
        outstanding.push(Arc::downgrade(bcb));
    }

    /// Wake every parked `acquire_blocking` caller with an error, then log
    /// any buffer still outstanding with unreleased pins. Only buffers
    /// acquired while `leak_tracking` was enabled are inspected.
    pub fn shutdown(&self) {
        self.semaphore.close();
        let outstanding = self.outstanding.lock().expect("pool lock poisoned");
        for weak in outstanding.iter() {
            let Some(bcb) = weak.upgrade() else { continue };
            let owners = bcb.leaked_owners();
            if !owners.is_empty() {
                tracing::warn!(
                    pinned = bcb.pinned_count(),
                    owners = ?owners,
                    "buffer pool shutdown: buffer control block has unreleased pins"
                );
            }
        }
    }
}

fn unix_micros() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

struct PooledRecycler {
    pool: Arc<BufferPool>,
}

impl SegmentRecycler for PooledRecycler {
    fn recycle(&self, reclaimed: ReclaimedSegments) {
        // Children were allocated ad hoc (e.g. for var-sized payloads) and
        // are simply dropped; only the main segment returns to the pool's
        // fixed-size free list.
        drop(reclaimed.children);
        if let Some(main) = reclaimed.main {
            let mut free = self.pool.free.lock().expect("pool lock poisoned");
            let _ = free.ring.push(main);
            drop(free);
            self.pool.semaphore.add_permits(1);
        } else {
            // Segment was stolen for spilling before the data counter hit
            // zero; the permit still needs releasing, just with no segment
            // to give back.
            self.pool.semaphore.add_permits(1);
        }
    }
}

struct UnpooledRecycler {
    pool: Arc<BufferPool>,
    size: usize,
}

impl SegmentRecycler for UnpooledRecycler {
    fn recycle(&self, reclaimed: ReclaimedSegments) {
        drop(reclaimed);
        let mut outstanding = self.pool.unpooled_outstanding.lock().expect("pool lock poisoned");
        *outstanding = outstanding.saturating_sub(self.size);
    }
}
