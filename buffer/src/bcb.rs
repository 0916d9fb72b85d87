use std::panic::Location;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::BufferError;
use crate::segment::Segment;

/// Identifies which segment a field reference or structural operation
/// targets: the one main segment, or one of the out-of-line children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKey {
    Main,
    Child(ChildKey),
}

/// A stable index into a buffer's child-segment table, written into a
/// `VarSized` field's fixed-width slot in place of the payload itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChildKey(pub usize);

/// Segments reclaimed when a buffer's data counter reaches zero, handed
/// back to whatever recycler the owning pool installed at acquisition time.
pub struct ReclaimedSegments {
    pub main: Option<Segment>,
    pub children: Vec<Segment>,
}

/// Installed by the pool that handed out a buffer, so the control block
/// can recycle its segments without knowing about the pool itself.
pub trait SegmentRecycler: Send + Sync {
    fn recycle(&self, reclaimed: ReclaimedSegments);
}

struct Inner {
    main: Option<Segment>,
    children: Vec<Option<Segment>>,
}

/// Total order over segment keys for the spill progress markers: the main
/// segment sorts before every child.
fn key_rank(key: SegmentKey) -> usize {
    match key {
        SegmentKey::Main => 0,
        SegmentKey::Child(child) => child.0 + 1,
    }
}

/// The control block backing one record buffer.
///
/// Two independent atomic counters track liveness: `pinned` (data must
/// stay memory-resident and may be read/written right now) and `data`
/// (the buffer's identity is still referenced by someone, resident or
/// not). `data >= pinned` holds at all times because every pinned holder
/// also counts as a data holder. Structural mutation of the segment table
/// (registering a child, swapping the main segment, stealing it for
/// spilling) goes through a `RwLock` so concurrent readers never observe
/// a torn segment table; the counters themselves are lock-free.
pub struct BufferControlBlock {
    pinned: AtomicI32,
    data: AtomicI32,
    repinning: AtomicBool,
    /// Spiller coordination: segments with keys up to this one must not be
    /// stolen (a writer is about to touch them), and segments up to
    /// `is_spilled_up_to` have already been stolen.
    skip_spilling_up_to: Mutex<Option<SegmentKey>>,
    is_spilled_up_to: Mutex<Option<SegmentKey>>,
    num_tuples: AtomicU64,
    watermark: AtomicU64,
    sequence_number: AtomicU64,
    chunk_number: AtomicU64,
    last_chunk: AtomicBool,
    origin_id: AtomicU64,
    creation_timestamp: u64,
    inner: RwLock<Inner>,
    recycler: Arc<dyn SegmentRecycler>,
    leak_tracking: bool,
    owners: Mutex<Vec<&'static Location<'static>>>,
}

impl BufferControlBlock {
    pub fn new(main: Segment, recycler: Arc<dyn SegmentRecycler>, creation_timestamp: u64) -> Self {
        Self::with_leak_tracking(main, recycler, creation_timestamp, false)
    }

    /// As [`BufferControlBlock::new`], but with leak tracking turned on:
    /// every `pinned_retain` records its caller's source location, popped
    /// again on `pinned_release`, so an unbalanced pin can be attributed
    /// to a call site at pool shutdown.
    pub fn with_leak_tracking(
        main: Segment,
        recycler: Arc<dyn SegmentRecycler>,
        creation_timestamp: u64,
        leak_tracking: bool,
    ) -> Self {
        Self {
            pinned: AtomicI32::new(1),
            data: AtomicI32::new(1),
            repinning: AtomicBool::new(false),
            skip_spilling_up_to: Mutex::new(None),
            is_spilled_up_to: Mutex::new(None),
            num_tuples: AtomicU64::new(0),
            watermark: AtomicU64::new(0),
            sequence_number: AtomicU64::new(0),
            chunk_number: AtomicU64::new(0),
            last_chunk: AtomicBool::new(true),
            origin_id: AtomicU64::new(0),
            creation_timestamp,
            inner: RwLock::new(Inner {
                main: Some(main),
                children: Vec::new(),
            }),
            recycler,
            leak_tracking,
            owners: Mutex::new(Vec::new()),
        }
    }

    // --- pinned/data reference counting ---------------------------------

    /// Increment the pinned counter. Spins while a swap is in flight
    /// (signalled by the sentinel value `-1`) rather than failing outright,
    /// since that window is always short-lived. When leak tracking is
    /// enabled, records the caller's location so an unreleased pin can be
    /// attributed to a call site at pool shutdown.
    #[track_caller]
    pub fn pinned_retain(&self) {
        loop {
            let current = self.pinned.load(Ordering::Acquire);
            if current < 0 {
                std::hint::spin_loop();
                continue;
            }
            if self
                .pinned
                .compare_exchange_weak(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                if self.leak_tracking {
                    self.owners.lock().expect("bcb owners lock poisoned").push(Location::caller());
                }
                return;
            }
        }
    }

    /// Decrement the pinned counter. `true` means this was the last pinned
    /// holder; the data may still be live through data holders.
    pub fn pinned_release(&self) -> bool {
        let previous = self.pinned.fetch_sub(1, Ordering::AcqRel);
        if previous <= 0 {
            panic!("invariant violation: pinned_release on a buffer with no pinned holders");
        }
        if self.leak_tracking {
            self.owners.lock().expect("bcb owners lock poisoned").pop();
        }
        previous == 1
    }

    /// Source locations of every `pinned_retain` not yet matched by a
    /// `pinned_release`, used by [`crate::BufferPool::shutdown`] to report
    /// leaks. Always empty when leak tracking is disabled.
    pub fn leaked_owners(&self) -> Vec<&'static Location<'static>> {
        self.owners.lock().expect("bcb owners lock poisoned").clone()
    }

    pub fn pinned_count(&self) -> i32 {
        self.pinned.load(Ordering::Acquire).max(0)
    }

    pub fn data_retain(&self) {
        self.data.fetch_add(1, Ordering::AcqRel);
    }

    /// Decrement the data counter. When it reaches zero (returning
    /// `true`), takes every segment off the buffer and hands them to the
    /// recycler; the buffer itself stays alive (the pool may reuse the
    /// control block) but its segment table is now empty.
    pub fn data_release(&self) -> bool {
        let previous = self.data.fetch_sub(1, Ordering::AcqRel);
        if previous <= 0 {
            panic!("invariant violation: data_release on a buffer with no data holders");
        }
        if previous == 1 {
            let mut inner = self.inner.write().expect("bcb lock poisoned");
            let main = inner.main.take();
            let children = inner.children.drain(..).flatten().collect();
            drop(inner);
            self.recycler.recycle(ReclaimedSegments { main, children });
        }
        previous == 1
    }

    pub fn data_count(&self) -> i32 {
        self.data.load(Ordering::Acquire).max(0)
    }

    // --- structural mutation ---------------------------------------------

    /// Append a child segment under the unique BCB lock. `None` if the
    /// lock is unavailable, either genuinely contended or refused because
    /// repinning is in progress.
    pub fn register_child(&self, segment: Segment) -> Option<ChildKey> {
        let mut guard = self.try_lock_unique()?;
        let inner = &mut *guard.0;
        Some(if let Some(slot) = inner.children.iter().position(|c| c.is_none()) {
            inner.children[slot] = Some(segment);
            ChildKey(slot)
        } else {
            inner.children.push(Some(segment));
            ChildKey(inner.children.len() - 1)
        })
    }

    /// Remove a child segment. Only safe when nothing else shares this
    /// buffer's identity (`data_count == 1`); otherwise another holder may
    /// still resolve the key and observe stale data.
    pub fn unregister_child(&self, key: ChildKey) -> Result<Segment, BufferError> {
        if self.data_count() != 1 {
            return Err(BufferError::ChildRemovalNotExclusive);
        }
        let mut inner = self.inner.write().expect("bcb lock poisoned");
        let slot = inner
            .children
            .get_mut(key.0)
            .ok_or(BufferError::UnknownChildKey(key.0))?;
        slot.take().ok_or(BufferError::UnknownChildKey(key.0))
    }

    /// Replace the main segment (`key == Main`) or a child segment
    /// (`key == Child(_)`) with `new_segment`, but only while nothing is
    /// pinned. Sets the pinned counter to the sentinel `-1` for the
    /// duration of the swap so concurrent `pinned_retain` calls spin rather
    /// than observe a half-swapped buffer. Fails fast, without touching the
    /// pinned counter, if repinning is in progress and `new_segment` is
    /// itself spilled; installing another spilled segment mid-repin would
    /// let a reader race the repin and observe the wrong data.
    pub fn swap_segment(&self, key: SegmentKey, new_segment: Segment) -> Result<Option<Segment>, BufferError> {
        if self.is_repinning() && !new_segment.is_resident() {
            return Err(BufferError::Repinning);
        }
        let installed_resident = new_segment.is_resident();
        self.pinned
            .compare_exchange(0, -1, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| BufferError::SegmentPinned)?;
        let result = {
            let mut inner = self.inner.write().expect("bcb lock poisoned");
            match key {
                SegmentKey::Main => Ok(inner.main.replace(new_segment)),
                SegmentKey::Child(child_key) => match inner.children.get_mut(child_key.0) {
                    Some(slot) => Ok(slot.replace(new_segment)),
                    None => Err(BufferError::UnknownChildKey(child_key.0)),
                },
            }
        };
        self.pinned.store(0, Ordering::Release);
        if result.is_ok() && installed_resident {
            // Reinstalling resident data at the spill high-water mark
            // means that steal has been undone.
            let mut spilled = self.is_spilled_up_to.lock().expect("spill marker lock poisoned");
            if *spilled == Some(key) {
                *spilled = None;
            }
        }
        result
    }

    /// Remove the main segment (`key == Main`) or a child segment
    /// (`key == Child(_)`) entirely, for handing off to a spiller. Like
    /// `swap_segment`, requires nothing is currently pinned. Refuses keys
    /// covered by the skip marker, and records a successful steal in the
    /// spill progress marker.
    pub fn steal_data_segment(&self, key: SegmentKey) -> Result<Segment, BufferError> {
        if let Some(limit) = *self.skip_spilling_up_to.lock().expect("spill marker lock poisoned") {
            if key_rank(key) <= key_rank(limit) {
                return Err(BufferError::SpillSkipped);
            }
        }
        self.pinned
            .compare_exchange(0, -1, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| BufferError::SegmentPinned)?;
        let result = {
            let mut inner = self.inner.write().expect("bcb lock poisoned");
            match key {
                SegmentKey::Main => inner.main.take().ok_or(BufferError::SegmentPinned),
                SegmentKey::Child(child_key) => match inner.children.get_mut(child_key.0) {
                    Some(slot) => slot.take().ok_or(BufferError::UnknownChildKey(child_key.0)),
                    None => Err(BufferError::UnknownChildKey(child_key.0)),
                },
            }
        };
        self.pinned.store(0, Ordering::Release);
        if result.is_ok() {
            let mut spilled = self.is_spilled_up_to.lock().expect("spill marker lock poisoned");
            *spilled = Some(match *spilled {
                Some(prev) if key_rank(prev) >= key_rank(key) => prev,
                _ => key,
            });
        }
        result
    }

    /// Tell the spiller to leave segments with keys up to `key` alone
    /// (`None` lifts the restriction). Set by writers about to touch a
    /// segment that must stay resident.
    pub fn set_skip_spilling_up_to(&self, key: Option<SegmentKey>) {
        *self.skip_spilling_up_to.lock().expect("spill marker lock poisoned") = key;
    }

    pub fn skip_spilling_up_to(&self) -> Option<SegmentKey> {
        *self.skip_spilling_up_to.lock().expect("spill marker lock poisoned")
    }

    /// High-water mark of segments stolen by the spiller, cleared per key
    /// as repinning reinstalls resident segments.
    pub fn is_spilled_up_to(&self) -> Option<SegmentKey> {
        *self.is_spilled_up_to.lock().expect("spill marker lock poisoned")
    }

    /// Non-blocking shared acquisition of the structural lock. Refuses
    /// (`None`) while repinning is in progress, to stop a new reference
    /// from escaping during a spill, and also whenever the lock is
    /// momentarily contended.
    pub fn try_lock_shared(&self) -> Option<MainSegmentView<'_>> {
        if self.is_repinning() {
            return None;
        }
        self.inner.try_read().ok().map(MainSegmentView)
    }

    /// Non-blocking unique acquisition of the structural lock. Same
    /// refusal rule as `try_lock_shared`.
    pub fn try_lock_unique(&self) -> Option<UniqueSegmentGuard<'_>> {
        if self.is_repinning() {
            return None;
        }
        self.inner.try_write().ok().map(UniqueSegmentGuard)
    }

    /// Copy out the bytes of a resident child segment. Returns `None` if
    /// the key is stale (already unregistered) or the child has been
    /// spilled rather than kept in memory.
    pub fn child_bytes(&self, key: ChildKey) -> Option<Vec<u8>> {
        let inner = self.inner.read().expect("bcb lock poisoned");
        inner.children.get(key.0)?.as_ref()?.as_bytes().map(|b| b.to_vec())
    }

    /// Run `f` against the main segment's bytes under the unique lock.
    /// Used by sources/sinks writing straight into a freshly acquired
    /// buffer's memory before anyone else can observe it; panics if the
    /// main segment has been spilled (callers must repin first) or is
    /// absent (stolen for spilling).
    pub fn with_main_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut inner = self.inner.write().expect("bcb lock poisoned");
        let segment = inner
            .main
            .as_mut()
            .expect("with_main_mut called on a buffer with no main segment");
        let bytes = segment
            .as_bytes_mut()
            .expect("with_main_mut called on a spilled segment");
        f(bytes)
    }

    // --- repinning coordination --------------------------------------------

    /// Mark that this buffer is about to be repinned (e.g. moved back from a
    /// spilled segment into memory). Only one repin may be in flight at a
    /// time; the returned guard clears the flag on drop.
    pub fn start_repinning(&self) -> Result<RepinGuard<'_>, BufferError> {
        self.repinning
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| BufferError::RepinAlreadyInProgress)?;
        Ok(RepinGuard { bcb: self })
    }

    pub fn is_repinning(&self) -> bool {
        self.repinning.load(Ordering::Acquire)
    }

    // --- metadata -----------------------------------------------------------

    pub fn num_tuples(&self) -> u64 {
        self.num_tuples.load(Ordering::Acquire)
    }

    pub fn set_num_tuples(&self, value: u64) {
        self.num_tuples.store(value, Ordering::Release);
    }

    pub fn watermark(&self) -> u64 {
        self.watermark.load(Ordering::Acquire)
    }

    pub fn set_watermark(&self, value: u64) {
        self.watermark.store(value, Ordering::Release);
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number.load(Ordering::Acquire)
    }

    pub fn set_sequence_number(&self, value: u64) {
        self.sequence_number.store(value, Ordering::Release);
    }

    pub fn chunk_number(&self) -> u64 {
        self.chunk_number.load(Ordering::Acquire)
    }

    pub fn set_chunk_number(&self, value: u64) {
        self.chunk_number.store(value, Ordering::Release);
    }

    pub fn is_last_chunk(&self) -> bool {
        self.last_chunk.load(Ordering::Acquire)
    }

    pub fn set_last_chunk(&self, value: bool) {
        self.last_chunk.store(value, Ordering::Release);
    }

    pub fn origin_id(&self) -> u64 {
        self.origin_id.load(Ordering::Acquire)
    }

    pub fn set_origin_id(&self, value: u64) {
        self.origin_id.store(value, Ordering::Release);
    }

    pub fn creation_timestamp(&self) -> u64 {
        self.creation_timestamp
    }
}

/// Read-only view of the segment table obtained via
/// [`BufferControlBlock::try_lock_shared`].
pub struct MainSegmentView<'a>(RwLockReadGuard<'a, Inner>);

impl MainSegmentView<'_> {
    pub fn segment(&self) -> Option<&Segment> {
        self.0.main.as_ref()
    }

    pub fn child(&self, key: ChildKey) -> Option<&Segment> {
        self.0.children.get(key.0)?.as_ref()
    }
}

/// Exclusive view of the segment table obtained via
/// [`BufferControlBlock::try_lock_unique`].
pub struct UniqueSegmentGuard<'a>(RwLockWriteGuard<'a, Inner>);

/// Clears the repinning flag when dropped, whether `mark_repinning_done`
/// was reached normally or the caller unwound through an error path.
pub struct RepinGuard<'a> {
    bcb: &'a BufferControlBlock,
}

impl RepinGuard<'_> {
    pub fn mark_done(self) {
        // Drop does the actual clearing; this just gives call sites a
        // named point to call instead of relying on scope exit.
    }
}

impl Drop for RepinGuard<'_> {
    fn drop(&mut self) {
        self.bcb.repinning.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    struct NullRecycler;
    impl SegmentRecycler for NullRecycler {
        fn recycle(&self, _reclaimed: ReclaimedSegments) {}
    }

    fn bcb() -> BufferControlBlock {
        BufferControlBlock::new(Segment::zeroed(128), Arc::new(NullRecycler), 0)
    }

    #[test]
    fn pinned_release_without_retain_past_initial_panics() {
        let b = bcb();
        b.pinned_release();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| b.pinned_release()));
        assert!(result.is_err());
    }

    #[test]
    fn data_release_to_zero_recycles_segments() {
        use std::sync::Mutex;

        struct CapturingRecycler(Mutex<Option<ReclaimedSegments>>);
        impl SegmentRecycler for CapturingRecycler {
            fn recycle(&self, reclaimed: ReclaimedSegments) {
                *self.0.lock().unwrap() = Some(reclaimed);
            }
        }

        let recycler = Arc::new(CapturingRecycler(Mutex::new(None)));
        let b = BufferControlBlock::new(Segment::zeroed(64), recycler.clone(), 0);
        b.register_child(Segment::zeroed(16)).unwrap();
        assert!(b.data_release());

        let captured = recycler.0.lock().unwrap();
        let reclaimed = captured.as_ref().unwrap();
        assert!(reclaimed.main.is_some());
        assert_eq!(reclaimed.children.len(), 1);
    }

    #[test]
    fn swap_segment_fails_while_pinned() {
        let b = bcb();
        b.pinned_retain();
        assert!(matches!(
            b.swap_segment(SegmentKey::Main, Segment::zeroed(32)),
            Err(BufferError::SegmentPinned)
        ));
        b.pinned_release();
        b.pinned_release();
        let old = b.swap_segment(SegmentKey::Main, Segment::zeroed(32)).unwrap();
        assert!(old.is_some());
    }

    #[test]
    fn register_and_unregister_child_reuses_slot() {
        let b = bcb();
        let k1 = b.register_child(Segment::zeroed(8)).unwrap();
        b.unregister_child(k1).unwrap();
        let k2 = b.register_child(Segment::zeroed(8)).unwrap();
        assert_eq!(k1, k2);
    }

    #[test]
    fn start_repinning_is_exclusive() {
        let b = bcb();
        let guard = b.start_repinning().unwrap();
        assert!(b.is_repinning());
        assert!(matches!(
            b.start_repinning(),
            Err(BufferError::RepinAlreadyInProgress)
        ));
        drop(guard);
        assert!(!b.is_repinning());
        assert!(b.start_repinning().is_ok());
    }

    #[test]
    fn steal_data_segment_requires_unpinned() {
        let b = bcb();
        b.pinned_retain();
        assert!(matches!(
            b.steal_data_segment(SegmentKey::Main),
            Err(BufferError::SegmentPinned)
        ));
        b.pinned_release();
        b.pinned_release();
        let stolen = b.steal_data_segment(SegmentKey::Main).unwrap();
        assert_eq!(stolen.len(), 128);
        assert!(b.try_lock_shared().unwrap().segment().is_none());
    }

    #[test]
    fn steal_records_spill_progress_and_honors_skip_marker() {
        let b = bcb();
        b.pinned_release();
        assert_eq!(b.is_spilled_up_to(), None);

        b.set_skip_spilling_up_to(Some(SegmentKey::Main));
        assert!(matches!(
            b.steal_data_segment(SegmentKey::Main),
            Err(BufferError::SpillSkipped)
        ));
        b.set_skip_spilling_up_to(None);

        b.steal_data_segment(SegmentKey::Main).unwrap();
        assert_eq!(b.is_spilled_up_to(), Some(SegmentKey::Main));
    }

    #[test]
    fn repin_reinstall_clears_spill_progress() {
        let b = bcb();
        b.pinned_release();
        b.steal_data_segment(SegmentKey::Main).unwrap();
        assert_eq!(b.is_spilled_up_to(), Some(SegmentKey::Main));

        let guard = b.start_repinning().unwrap();
        assert!(matches!(
            b.swap_segment(SegmentKey::Main, Segment::Spilled { key: "k".into(), len: 128 }),
            Err(BufferError::Repinning)
        ));
        b.swap_segment(SegmentKey::Main, Segment::zeroed(128)).unwrap();
        guard.mark_done();

        assert_eq!(b.is_spilled_up_to(), None);
        assert!(b.try_lock_shared().unwrap().segment().is_some());
    }
}
