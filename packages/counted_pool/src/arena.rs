use std::fmt;
use std::marker::PhantomData;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU64, Ordering};

use tracing::debug;

use crate::Slot;

/// The first segment holds `1 << FIRST_SEGMENT_SHIFT` slots, every following segment
/// doubles the capacity of the previous one.
const FIRST_SEGMENT_SHIFT: u32 = 3;
const FIRST_SEGMENT_CAPACITY: u64 = 1 << FIRST_SEGMENT_SHIFT;

/// Enough segments to address every index below `NIL_INDEX`.
const SEGMENT_COUNT: usize = 29;

/// Total number of slots the arena can ever hold.
pub(crate) const MAX_SLOTS: u64 = (FIRST_SEGMENT_CAPACITY << SEGMENT_COUNT) - FIRST_SEGMENT_CAPACITY;

/// Grow-only storage for pool slots, addressed by a 32-bit index.
///
/// Slots are allocated in segments of geometrically increasing size. A segment is created by
/// whichever thread first needs it and published with a compare-and-swap; the loser of a race
/// discards its own copy. Once published, a segment is never moved or freed until the arena
/// itself is dropped, so a reference to a slot remains valid for as long as the arena lives.
///
/// Slot indices are stable, which is what allows the free lists to link slots by index instead
/// of by pointer.
pub(crate) struct Arena<T> {
    /// Each entry is either null or points to the first slot of a leaked `Box<[Slot<T>]>`
    /// whose length is `segment_capacity(i)`.
    segments: [AtomicPtr<Slot<T>>; SEGMENT_COUNT],

    /// How many slot indices have been handed out by `allocate()`.
    claimed: AtomicU64,

    // The atomic pointers are unconditionally thread-safe, this makes the arena exactly as
    // thread-safe as the slots it owns.
    _owns_slots: PhantomData<Box<[Slot<T>]>>,
}

impl<T> Arena<T> {
    pub(crate) fn new() -> Self {
        Self {
            segments: [const { AtomicPtr::new(ptr::null_mut()) }; SEGMENT_COUNT],
            claimed: AtomicU64::new(0),
            _owns_slots: PhantomData,
        }
    }

    /// Number of slots that have been allocated so far.
    pub(crate) fn len(&self) -> u64 {
        self.claimed.load(Ordering::Relaxed).min(MAX_SLOTS)
    }

    /// Claims a new, never before used slot.
    ///
    /// The returned slot is idle (reference count zero, no payload) and owned exclusively by
    /// the caller until the caller publishes it.
    ///
    /// # Panics
    ///
    /// Panics if the arena already holds [`MAX_SLOTS`] slots.
    pub(crate) fn allocate(&self) -> &Slot<T> {
        let claimed = self.claimed.fetch_add(1, Ordering::Relaxed);

        assert!(
            claimed < MAX_SLOTS,
            "a pool cannot hold more than {MAX_SLOTS} cells"
        );

        #[allow(
            clippy::cast_possible_truncation,
            reason = "MAX_SLOTS fits in u32, checked above"
        )]
        let index = claimed as u32;

        let (segment, offset) = locate(index);
        let first = self.ensure_segment(segment);

        // SAFETY: `first` points to a published segment of `segment_capacity(segment)` slots and
        // `locate()` guarantees `offset` is within that capacity. Published segments live as
        // long as the arena.
        unsafe { &*first.add(offset) }
    }

    /// Returns a slot that was previously allocated.
    ///
    /// # Panics
    ///
    /// Panics if the index was never handed out by [`allocate()`][Self::allocate]. Indices only
    /// ever come from slots the pool allocated, so this is a bookkeeping bug.
    pub(crate) fn slot(&self, index: u32) -> &Slot<T> {
        let (segment, offset) = locate(index);

        #[allow(
            clippy::indexing_slicing,
            reason = "locate() only returns segment numbers below SEGMENT_COUNT"
        )]
        let first = self.segments[segment].load(Ordering::Acquire);

        assert!(
            !first.is_null(),
            "slot {index} belongs to a segment that was never allocated"
        );

        // SAFETY: Same as in `allocate()` - the segment is published and `offset` is in bounds.
        unsafe { &*first.add(offset) }
    }

    #[cfg_attr(test, mutants::skip)] // Mutations leak memory or double-free, not observable in tests.
    fn ensure_segment(&self, segment: usize) -> *mut Slot<T> {
        #[allow(
            clippy::indexing_slicing,
            reason = "locate() only returns segment numbers below SEGMENT_COUNT"
        )]
        let entry = &self.segments[segment];

        let existing = entry.load(Ordering::Acquire);
        if !existing.is_null() {
            return existing;
        }

        let capacity = segment_capacity(segment);
        let start = segment_start(segment);

        let slots = (0..capacity)
            .map(|offset| Slot::new(start.wrapping_add(offset)))
            .collect::<Box<[Slot<T>]>>();

        let fresh = Box::into_raw(slots).cast::<Slot<T>>();

        match entry.compare_exchange(ptr::null_mut(), fresh, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => {
                debug!(segment, capacity, "allocated cell segment");
                fresh
            }
            Err(winner) => {
                // SAFETY: We created this segment above and it was never published, so we are
                // still its only owner. The length matches what we allocated.
                drop(unsafe {
                    Box::from_raw(ptr::slice_from_raw_parts_mut(
                        fresh,
                        capacity as usize,
                    ))
                });

                winner
            }
        }
    }
}

impl<T> Drop for Arena<T> {
    fn drop(&mut self) {
        for (segment, entry) in self.segments.iter_mut().enumerate() {
            let first = *entry.get_mut();

            if first.is_null() {
                continue;
            }

            // SAFETY: Every non-null entry was produced by `Box::into_raw` on a boxed slice of
            // `segment_capacity(segment)` slots, and we have exclusive access via `&mut self`.
            drop(unsafe {
                Box::from_raw(ptr::slice_from_raw_parts_mut(
                    first,
                    segment_capacity(segment) as usize,
                ))
            });
        }
    }
}

impl<T> fmt::Debug for Arena<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arena")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

/// Splits a slot index into (segment, offset within segment).
fn locate(index: u32) -> (usize, usize) {
    let biased = u64::from(index).wrapping_add(FIRST_SEGMENT_CAPACITY);

    // `biased` is at least FIRST_SEGMENT_CAPACITY, so its highest set bit is at least
    // FIRST_SEGMENT_SHIFT and the subtraction cannot underflow.
    let highest_bit = 63_u32.wrapping_sub(biased.leading_zeros());
    let segment = highest_bit.wrapping_sub(FIRST_SEGMENT_SHIFT);
    let offset = biased.wrapping_sub(1 << highest_bit);

    #[allow(
        clippy::cast_possible_truncation,
        reason = "offsets are below the largest segment capacity, which fits in u32"
    )]
    (segment as usize, offset as usize)
}

#[allow(
    clippy::cast_possible_truncation,
    reason = "the largest segment capacity is 2^31"
)]
fn segment_capacity(segment: usize) -> u32 {
    (FIRST_SEGMENT_CAPACITY << segment) as u32
}

#[allow(
    clippy::cast_possible_truncation,
    reason = "segment starts are below MAX_SLOTS, which fits in u32"
)]
fn segment_start(segment: usize) -> u32 {
    ((FIRST_SEGMENT_CAPACITY << segment) - FIRST_SEGMENT_CAPACITY) as u32
}
