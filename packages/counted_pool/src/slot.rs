use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};

use crate::{Error, Result};

/// Marks the end of a free list chain.
pub(crate) const NIL_INDEX: u32 = u32::MAX;

/// The highest reference count a cell is allowed to reach via `copy()`.
pub(crate) const MAX_REF_COUNT: i32 = i32::MAX - 1;

/// Storage for one pooled cell: its reference count, its payload and the link that threads it
/// onto a free list while it is idle.
///
/// A slot is created once, lives at a fixed index in the pool arena and is recycled for as long
/// as the pool exists. The slot and its free list link are inseparable, so returning a cell to
/// the pool never needs to look anything up.
///
/// # Ownership of the payload
///
/// The payload is only written while the reference count is zero and the slot is owned
/// exclusively by the thread that either popped it from a free list, allocated it, or drove the
/// reference count from 1 to 0. It is only read while the reference count is above zero.
pub(crate) struct Slot<T> {
    index: u32,

    /// Strictly positive while any handle is outstanding; zero while idle.
    ref_count: AtomicI32,

    /// Index of the next slot in whichever free list currently holds this slot.
    /// [`NIL_INDEX`] whenever the slot is not in a free list.
    next: AtomicU32,

    /// Consumers registered with the pool at the time the snapshot was taken.
    consumer_mask: AtomicU64,

    value: UnsafeCell<Option<T>>,
}

// SAFETY: Access to `value` is arbitrated by `ref_count`. Mutation only happens while a single
// thread owns the slot exclusively (count is zero and the slot is in no free list), shared
// reads only happen while the count is above zero. Handing `&T` to other threads requires
// `T: Sync` and moving the payload between threads (it is created and dropped wherever the
// pool happens to be used) requires `T: Send`.
unsafe impl<T: Send + Sync> Sync for Slot<T> {}

impl<T> Slot<T> {
    pub(crate) const fn new(index: u32) -> Self {
        Self {
            index,
            ref_count: AtomicI32::new(0),
            next: AtomicU32::new(NIL_INDEX),
            consumer_mask: AtomicU64::new(0),
            value: UnsafeCell::new(None),
        }
    }

    pub(crate) fn index(&self) -> u32 {
        self.index
    }

    pub(crate) fn ref_count(&self) -> i32 {
        self.ref_count.load(Ordering::Acquire)
    }

    pub(crate) fn next(&self) -> u32 {
        self.next.load(Ordering::Relaxed)
    }

    pub(crate) fn set_next(&self, next: u32) {
        self.next.store(next, Ordering::Relaxed);
    }

    pub(crate) fn consumer_mask(&self) -> u64 {
        self.consumer_mask.load(Ordering::Relaxed)
    }

    /// Replaces the consumer mask snapshot.
    ///
    /// Only called while the slot is owned exclusively. The new value is published to other
    /// threads by the reference count transition that follows.
    pub(crate) fn set_consumer_mask(&self, mask: u64) {
        self.consumer_mask.store(mask, Ordering::Relaxed);
    }

    /// Moves the reference count from exactly 0 to exactly 1.
    ///
    /// # Panics
    ///
    /// Panics if the count is not zero. That means the pool handed out a slot that was still in
    /// use, which is a bug in the pool's bookkeeping that must not be papered over.
    pub(crate) fn initialize_reference(&self) {
        if let Err(current) =
            self.ref_count
                .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
        {
            panic!(
                "slot {} was handed out with reference count {current} instead of 0",
                self.index
            );
        }
    }

    /// Adds one reference, returning the count observed before the increment.
    pub(crate) fn increment(&self) -> Result<i32> {
        let mut current = self.ref_count.load(Ordering::Acquire);

        loop {
            if current <= 0 {
                return Err(Error::ZeroReference);
            }

            if current >= MAX_REF_COUNT {
                return Err(Error::Overflow { count: current });
            }

            // Cannot overflow, we just checked against MAX_REF_COUNT.
            let new = current.wrapping_add(1);

            match self.ref_count.compare_exchange_weak(
                current,
                new,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(current),
                Err(actual) => current = actual,
            }
        }
    }

    /// Removes one reference, returning the count observed immediately before the successful
    /// decrement. A return value of 1 means the caller now owns the idle slot exclusively.
    pub(crate) fn decrement(&self) -> Result<i32> {
        let mut current = self.ref_count.load(Ordering::Acquire);

        loop {
            if current <= 0 {
                return Err(Error::Underflow);
            }

            // Cannot underflow, we just checked that it is positive.
            let new = current.wrapping_sub(1);

            // Release publishes our reads of the payload to whoever reuses the slot next.
            // Acquire makes every other holder's reads visible to us before we touch the payload.
            match self.ref_count.compare_exchange_weak(
                current,
                new,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(current),
                Err(actual) => current = actual,
            }
        }
    }

    /// # Safety
    ///
    /// The caller must hold a reference (count above zero) for the entire lifetime of the
    /// returned reference.
    pub(crate) unsafe fn value(&self) -> Option<&T> {
        // SAFETY: Forwarding the caller's guarantee - nobody mutates the payload while a
        // reference is held.
        unsafe { (*self.value.get()).as_ref() }
    }

    /// # Safety
    ///
    /// The caller must hold the only reference (count exactly one, observed by the caller) for
    /// the entire lifetime of the returned reference.
    #[allow(
        clippy::mut_from_ref,
        reason = "exclusivity is guaranteed by the reference count, not by the borrow"
    )]
    pub(crate) unsafe fn value_mut(&self) -> Option<&mut T> {
        // SAFETY: Forwarding the caller's guarantee - the caller is the only one who can
        // reach the payload.
        unsafe { (*self.value.get()).as_mut() }
    }

    /// Whether the payload is present.
    ///
    /// # Safety
    ///
    /// The caller must own the slot exclusively (count zero and not in any free list).
    pub(crate) unsafe fn has_value(&self) -> bool {
        // SAFETY: Forwarding the caller's guarantee of exclusive ownership.
        unsafe { (*self.value.get()).is_some() }
    }

    /// Stores the payload, dropping any previous one.
    ///
    /// # Safety
    ///
    /// The caller must own the slot exclusively (count zero and not in any free list).
    pub(crate) unsafe fn set_value(&self, value: T) {
        // SAFETY: Forwarding the caller's guarantee of exclusive ownership.
        unsafe {
            *self.value.get() = Some(value);
        }
    }

    #[cfg(test)]
    pub(crate) fn force_ref_count(&self, count: i32) {
        self.ref_count.store(count, Ordering::Release);
    }

    /// Drops the payload, leaving the slot empty.
    ///
    /// # Safety
    ///
    /// The caller must own the slot exclusively (count zero and not in any free list).
    pub(crate) unsafe fn clear_value(&self) {
        // SAFETY: Forwarding the caller's guarantee of exclusive ownership.
        let evicted = unsafe { (*self.value.get()).take() };

        drop(evicted);
    }
}

impl<T> fmt::Debug for Slot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot")
            .field("index", &self.index)
            .field("ref_count", &self.ref_count.load(Ordering::Relaxed))
            .field("next", &self.next.load(Ordering::Relaxed))
            .field("consumer_mask", &self.consumer_mask.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
