use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::{Arena, NIL_INDEX, Slot};

/// A lock-free LIFO stack of idle slots, linked through [`Slot::next()`] by arena index.
///
/// The head packs a 32-bit generation tag next to the 32-bit index of the top slot. Every
/// successful push or pop bumps the tag, so a thread that read the head, got preempted and
/// then tries to swing it based on a stale `next` link fails its compare-and-swap even if the
/// same slot has meanwhile been popped and pushed back (the ABA problem of naive Treiber stacks).
///
/// Slots are never deallocated while the arena lives, so reading the `next` link of a slot that
/// another thread has just popped is harmless: the value may be stale but the CAS rejects it.
pub(crate) struct FreeList {
    head: AtomicU64,

    /// Advisory number of slots in the stack. Incremented before a slot becomes visible to
    /// poppers and decremented after it has been taken, so it never underflows.
    len: AtomicUsize,
}

impl FreeList {
    pub(crate) fn new() -> Self {
        Self {
            head: AtomicU64::new(pack(0, NIL_INDEX)),
            len: AtomicUsize::new(0),
        }
    }

    /// Eventually consistent with the number of slots in the stack.
    pub(crate) fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed)
    }

    /// Pushes the slot unless the stack already holds `max_len` slots.
    ///
    /// The length is reserved atomically before the push, so any number of concurrent callers
    /// can never take the stack above `max_len`.
    ///
    /// Returns `false` (without touching the slot) if there was no room.
    ///
    /// The caller must own the slot exclusively; ownership passes to the stack on success.
    pub(crate) fn try_push<T>(&self, slot: &Slot<T>, max_len: usize) -> bool {
        let reserved = self
            .len
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |len| {
                (len < max_len).then(|| len.wrapping_add(1))
            })
            .is_ok();

        if reserved {
            self.link(slot);
        }

        reserved
    }

    /// Pushes the slot without any length limit.
    ///
    /// The caller must own the slot exclusively; ownership passes to the stack.
    pub(crate) fn push<T>(&self, slot: &Slot<T>) {
        self.len.fetch_add(1, Ordering::Relaxed);
        self.link(slot);
    }

    /// Takes the top slot, if any. The caller becomes its exclusive owner.
    pub(crate) fn pop<'a, T>(&self, arena: &'a Arena<T>) -> Option<&'a Slot<T>> {
        let mut head = self.head.load(Ordering::Acquire);

        loop {
            let index = index_of(head);

            if index == NIL_INDEX {
                return None;
            }

            let slot = arena.slot(index);
            let new_head = pack(tag_of(head).wrapping_add(1), slot.next());

            // Acquire pairs with the Release in `link()`, making the pusher's writes to the
            // slot (payload, reference count) visible to us before we hand the slot out.
            match self.head.compare_exchange_weak(
                head,
                new_head,
                Ordering::Acquire,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    slot.set_next(NIL_INDEX);
                    self.len.fetch_sub(1, Ordering::Relaxed);
                    return Some(slot);
                }
                Err(actual) => head = actual,
            }
        }
    }

    #[cfg_attr(test, mutants::skip)] // Mutations cause infinite loops or lost slots.
    fn link<T>(&self, slot: &Slot<T>) {
        let mut head = self.head.load(Ordering::Relaxed);

        loop {
            slot.set_next(index_of(head));
            let new_head = pack(tag_of(head).wrapping_add(1), slot.index());

            match self.head.compare_exchange_weak(
                head,
                new_head,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }
}

impl fmt::Debug for FreeList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let head = self.head.load(Ordering::Relaxed);

        f.debug_struct("FreeList")
            .field("top", &index_of(head))
            .field("tag", &tag_of(head))
            .field("len", &self.len())
            .finish()
    }
}

fn pack(tag: u32, index: u32) -> u64 {
    (u64::from(tag) << 32) | u64::from(index)
}

#[allow(
    clippy::cast_possible_truncation,
    reason = "the index is the lower half of the packed head"
)]
fn index_of(head: u64) -> u32 {
    head as u32
}

#[allow(
    clippy::cast_possible_truncation,
    reason = "the tag is the upper half of the packed head"
)]
fn tag_of(head: u64) -> u32 {
    (head >> 32) as u32
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::thread;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(FreeList: Send, Sync);

    fn arena_with(count: usize) -> Arena<u32> {
        let arena = Arena::new();

        for _ in 0..count {
            arena.allocate();
        }

        arena
    }

    #[test]
    fn pack_round_trip() {
        let head = pack(0xDEAD_BEEF, 42);

        assert_eq!(tag_of(head), 0xDEAD_BEEF);
        assert_eq!(index_of(head), 42);
        assert_eq!(index_of(pack(0, NIL_INDEX)), NIL_INDEX);
    }

    #[test]
    fn empty_pop_returns_none() {
        let arena = arena_with(0);
        let list = FreeList::new();

        assert!(list.pop(&arena).is_none());
        assert_eq!(list.len(), 0);
    }

    #[test]
    fn lifo_order() {
        let arena = arena_with(3);
        let list = FreeList::new();

        list.push(arena.slot(0));
        list.push(arena.slot(1));
        list.push(arena.slot(2));
        assert_eq!(list.len(), 3);

        assert_eq!(list.pop(&arena).unwrap().index(), 2);
        assert_eq!(list.pop(&arena).unwrap().index(), 1);
        assert_eq!(list.pop(&arena).unwrap().index(), 0);
        assert!(list.pop(&arena).is_none());
        assert_eq!(list.len(), 0);
    }

    #[test]
    fn popped_slot_has_cleared_link() {
        let arena = arena_with(2);
        let list = FreeList::new();

        list.push(arena.slot(0));
        list.push(arena.slot(1));
        assert_eq!(arena.slot(1).next(), 0);

        let slot = list.pop(&arena).unwrap();
        assert_eq!(slot.next(), NIL_INDEX);
    }

    #[test]
    fn try_push_respects_limit() {
        let arena = arena_with(3);
        let list = FreeList::new();

        assert!(list.try_push(arena.slot(0), 2));
        assert!(list.try_push(arena.slot(1), 2));
        assert!(!list.try_push(arena.slot(2), 2));
        assert_eq!(list.len(), 2);

        // The rejected slot was not linked anywhere.
        assert_eq!(arena.slot(2).next(), NIL_INDEX);

        list.pop(&arena).unwrap();
        assert!(list.try_push(arena.slot(2), 2));
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn try_push_with_zero_limit_never_pushes() {
        let arena = arena_with(1);
        let list = FreeList::new();

        assert!(!list.try_push(arena.slot(0), 0));
        assert!(list.pop(&arena).is_none());
    }

    #[test]
    fn head_tag_advances() {
        let arena = arena_with(1);
        let list = FreeList::new();

        list.push(arena.slot(0));
        list.pop(&arena).unwrap();
        list.push(arena.slot(0));

        let head = list.head.load(Ordering::Relaxed);
        assert_eq!(index_of(head), 0);
        assert_eq!(tag_of(head), 3);
    }

    #[cfg_attr(miri, ignore)] // Too slow under Miri.
    #[test]
    fn concurrent_pop_push_keeps_every_slot_exactly_once() {
        const SLOTS: usize = 16;
        const THREADS: usize = 8;
        const ITERATIONS: usize = 5_000;

        let arena = arena_with(SLOTS);
        let list = FreeList::new();

        for index in 0..SLOTS {
            list.push(arena.slot(u32::try_from(index).unwrap()));
        }

        thread::scope(|s| {
            for _ in 0..THREADS {
                s.spawn(|| {
                    for _ in 0..ITERATIONS {
                        if let Some(slot) = list.pop(&arena) {
                            // While we own the slot nobody else may own it.
                            slot.initialize_reference();
                            assert_eq!(slot.decrement().unwrap(), 1);
                            list.push(slot);
                        }
                    }
                });
            }
        });

        assert_eq!(list.len(), SLOTS);

        let mut seen = Vec::new();
        while let Some(slot) = list.pop(&arena) {
            seen.push(slot.index());
        }

        seen.sort_unstable();
        assert_eq!(seen, (0..SLOTS).map(|i| i as u32).collect::<Vec<_>>());
    }
}
