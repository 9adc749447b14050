use std::any::type_name;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, trace};

use crate::metrics::{
    ACQUIRE_CREATED, ACQUIRE_REUSED, ACQUIRE_REVIVED, FACTORY_INVOKED, PAYLOAD_EVICTED,
};
use crate::{
    Arena, Cell, ConsumerMaskPolicy, ConsumerToken, Error, FreeList, PoolBuilder, Result, Slot,
    next_consumer_bit,
};

/// Global counter for generating unique pool IDs.
static POOL_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Generates a unique pool ID.
fn generate_pool_id() -> u64 {
    POOL_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

pub(crate) type Factory<T> = Box<dyn Fn() -> T + Send + Sync>;

/// The state shared by a pool and every cell it has handed out.
pub(crate) struct PoolInner<T> {
    /// Identifies the pool to consumer tokens, so a token of one pool never grants access to
    /// the cells of another.
    id: u64,

    arena: Arena<T>,

    /// Idle cells that still carry their payload. Bounded by `max_pool_size`.
    idle: FreeList,

    /// Idle cells whose payload was dropped because `idle` was full. Their storage is reused
    /// before the arena grows, but the factory has to produce a new payload for them.
    vacant: FreeList,

    max_pool_size: usize,

    factory: Factory<T>,

    /// Bits of all consumers registered so far. Only ever grows.
    consumer_mask: AtomicU64,

    consumer_mask_policy: ConsumerMaskPolicy,
}

impl<T> PoolInner<T> {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    /// Takes back a cell whose reference count the caller has just moved from 1 to 0.
    ///
    /// The payload stays in place for the next acquirer if there is room in the pool, otherwise
    /// it is dropped and only the empty cell is kept for reuse.
    pub(crate) fn return_object(&self, slot: &Slot<T>) {
        if self.idle.try_push(slot, self.max_pool_size) {
            return;
        }

        // SAFETY: The caller moved the reference count from 1 to 0 and the slot was not pushed
        // above, so it is in no free list and we are its exclusive owner.
        unsafe {
            slot.clear_value();
        }

        PAYLOAD_EVICTED.with(|e| e.observe_once());
        trace!(
            slot = slot.index(),
            max_pool_size = self.max_pool_size,
            "pool at capacity, dropped payload of released cell"
        );

        self.vacant.push(slot);
    }
}

impl<T> fmt::Debug for PoolInner<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("id", &self.id)
            .field("arena", &self.arena)
            .field("idle", &self.idle)
            .field("vacant", &self.vacant)
            .field("max_pool_size", &self.max_pool_size)
            .field("consumer_mask", &self.consumer_mask.load(Ordering::Relaxed))
            .field("consumer_mask_policy", &self.consumer_mask_policy)
            .finish_non_exhaustive()
    }
}

/// A lock-free pool of reference-counted [`Cell`]s that recycles payloads.
///
/// [`acquire()`][Self::acquire] hands out a cell with a reference count of 1. The holder may
/// [`copy()`][Cell::copy] it to create more handles to the same payload and must
/// [`release()`][Cell::release] every handle it holds. When the last handle is released, the
/// cell goes back to the pool together with its payload, so the next `acquire()` reuses both
/// instead of calling the payload factory again.
///
/// At most [`max_pool_size()`][Self::max_pool_size] released payloads are kept. Releasing a cell
/// into a full pool drops its payload.
///
/// # Lifetime management
///
/// The pool type itself acts as a handle - any clones of it are functionally equivalent,
/// similar to `Arc`. Every cell keeps the pool storage alive, so cells may outlive all pool
/// handles.
///
/// # Thread safety
///
/// The pool and its cells are thread-safe (`Send` and `Sync`) if `T` is `Send` and `Sync`. All
/// operations are lock-free: contention only causes compare-and-swap retries, never blocking.
///
/// # Examples
///
/// ```
/// use counted_pool::Pool;
///
/// let pool = Pool::new(|| vec![0_u8; 1024], 8);
///
/// let mut cell = pool.acquire();
/// assert_eq!(cell.get()?.len(), 1024);
///
/// // Hand a second handle to someone else. Each handle is released separately.
/// let mut other = cell.copy()?;
/// assert_eq!(cell.ref_count(), 2);
///
/// other.release()?;
/// cell.release()?;
///
/// // The buffer is now idle in the pool, ready for the next acquire.
/// assert_eq!(pool.pool_size(), 1);
/// # Ok::<(), counted_pool::Error>(())
/// ```
pub struct Pool<T> {
    inner: Arc<PoolInner<T>>,
}

impl<T> Pool<T> {
    /// Creates a pool that uses `factory` to produce payloads and keeps at most
    /// `max_pool_size` released payloads for reuse.
    ///
    /// Use [`Pool::builder()`] for further configuration.
    ///
    /// # Examples
    ///
    /// ```
    /// use counted_pool::Pool;
    ///
    /// let pool = Pool::new(String::new, 64);
    ///
    /// assert_eq!(pool.max_pool_size(), 64);
    /// assert_eq!(pool.pool_size(), 0);
    /// ```
    #[must_use]
    pub fn new<F>(factory: F, max_pool_size: usize) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Self::builder()
            .factory(factory)
            .max_pool_size(max_pool_size)
            .build()
    }

    /// Creates a builder for configuring the pool.
    pub fn builder() -> PoolBuilder<T> {
        PoolBuilder::new()
    }

    pub(crate) fn new_inner(
        factory: Factory<T>,
        max_pool_size: usize,
        consumer_mask_policy: ConsumerMaskPolicy,
    ) -> Self {
        let id = generate_pool_id();

        debug!(
            pool_id = id,
            item_type = type_name::<T>(),
            max_pool_size,
            ?consumer_mask_policy,
            "created pool"
        );

        Self {
            inner: Arc::new(PoolInner {
                id,
                arena: Arena::new(),
                idle: FreeList::new(),
                vacant: FreeList::new(),
                max_pool_size,
                factory,
                consumer_mask: AtomicU64::new(0),
                consumer_mask_policy,
            }),
        }
    }

    /// Hands out a cell with a reference count of exactly 1 and a present payload.
    ///
    /// Reuses an idle cell and its payload if the pool has one. Otherwise the payload factory is
    /// called, either to fill a previously evicted cell or a brand new one.
    ///
    /// # Panics
    ///
    /// Panics if the payload factory panics. The empty cell that was being filled goes back to
    /// the pool for the next acquire to fill.
    #[must_use]
    pub fn acquire(&self) -> Cell<T> {
        let inner = &*self.inner;

        // A cell without a payload counts as newly constructed, whether it comes from the arena
        // or had its payload evicted earlier.
        let (slot, is_new) = if let Some(slot) = inner.idle.pop(&inner.arena) {
            ACQUIRE_REUSED.with(|e| e.observe_once());
            (slot, false)
        } else if let Some(slot) = inner.vacant.pop(&inner.arena) {
            ACQUIRE_REVIVED.with(|e| e.observe_once());
            (slot, true)
        } else {
            ACQUIRE_CREATED.with(|e| e.observe_once());
            (inner.arena.allocate(), true)
        };

        if is_new || inner.consumer_mask_policy == ConsumerMaskPolicy::RefreshOnAcquire {
            slot.set_consumer_mask(inner.consumer_mask.load(Ordering::Acquire));
        }

        // SAFETY: The slot was either just popped from a free list or freshly allocated. In both
        // cases its reference count is zero and no other thread can reach it until we publish
        // it below by handing out the cell.
        if !unsafe { slot.has_value() } {
            let mut guard = FillGuard {
                vacant: &inner.vacant,
                slot: Some(slot),
            };

            let value = (inner.factory)();
            FACTORY_INVOKED.with(|e| e.observe_once());

            // SAFETY: See above, we are still the exclusive owner.
            unsafe {
                slot.set_value(value);
            }

            guard.slot = None;
        }

        trace!(
            pool_id = inner.id,
            slot = slot.index(),
            is_new,
            "acquired cell"
        );

        slot.initialize_reference();

        Cell::new(Arc::clone(&self.inner), slot)
    }

    /// Number of released payloads currently held for reuse.
    ///
    /// The value is advisory: under concurrent use it may briefly lag behind the true number of
    /// idle cells, but it never exceeds [`max_pool_size()`][Self::max_pool_size].
    #[must_use]
    pub fn pool_size(&self) -> usize {
        self.inner.idle.len()
    }

    /// Maximum number of released payloads the pool keeps for reuse.
    #[must_use]
    pub fn max_pool_size(&self) -> usize {
        self.inner.max_pool_size
    }

    /// Number of cells the pool has created over its lifetime, whether in use, idle or empty.
    ///
    /// This is bounded by the peak number of simultaneously held cells.
    #[must_use]
    pub fn allocated_cells(&self) -> u64 {
        self.inner.arena.len()
    }

    /// How the pool refreshes the consumer snapshot of its cells.
    #[must_use]
    pub fn consumer_mask_policy(&self) -> ConsumerMaskPolicy {
        self.inner.consumer_mask_policy
    }

    /// Registers a new consumer and returns the token representing it.
    ///
    /// Consumers receive bits in strictly increasing order (1, 2, 4, ...) and bits are never
    /// reused, so at most [`MAX_CONSUMERS`][crate::MAX_CONSUMERS] consumers can be registered
    /// with one pool.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConsumerCapacityExceeded`] if all 64 consumer bits have been handed out.
    ///
    /// # Examples
    ///
    /// ```
    /// use counted_pool::Pool;
    ///
    /// let pool = Pool::new(|| 0_u32, 4);
    ///
    /// let first = pool.register_consumer()?;
    /// let second = pool.register_consumer()?;
    ///
    /// assert_eq!(first.bit(), 0b01);
    /// assert_eq!(second.bit(), 0b10);
    /// assert_eq!(pool.consumer_mask(), 0b11);
    /// # Ok::<(), counted_pool::Error>(())
    /// ```
    pub fn register_consumer(&self) -> Result<ConsumerToken> {
        let mask = &self.inner.consumer_mask;
        let mut current = mask.load(Ordering::Acquire);

        loop {
            let bit = next_consumer_bit(current).ok_or(Error::ConsumerCapacityExceeded)?;

            match mask.compare_exchange_weak(
                current,
                current | bit,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    debug!(pool_id = self.inner.id, consumer_bit = bit, "registered consumer");
                    return Ok(ConsumerToken::new(self.inner.id, bit));
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// Bits of every consumer registered with the pool so far.
    #[must_use]
    pub fn consumer_mask(&self) -> u64 {
        self.inner.consumer_mask.load(Ordering::Acquire)
    }

    /// Whether both handles refer to the same pool.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Puts an empty slot on the vacant list if the payload factory panics while filling it.
struct FillGuard<'a, T> {
    vacant: &'a FreeList,

    /// `None` once the slot has been filled.
    slot: Option<&'a Slot<T>>,
}

impl<T> Drop for FillGuard<'_, T> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.vacant.push(slot);
        }
    }
}

impl<T> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("inner", &self.inner)
            .finish()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use std::cell::RefCell;
    use std::panic::{self, AssertUnwindSafe};
    use std::rc::Rc;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::thread;

    use nm::Report;

    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;
    use crate::MAX_CONSUMERS;

    assert_impl_all!(Pool<String>: Send, Sync, Clone, fmt::Debug);
    assert_not_impl_any!(Pool<Rc<u32>>: Send, Sync);
    assert_not_impl_any!(Pool<RefCell<u32>>: Sync);

    /// A pool whose factory counts how often it has been called.
    fn counting_pool(max_pool_size: usize) -> (Pool<usize>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));

        let pool = Pool::new(
            {
                let calls = Arc::clone(&calls);
                move || calls.fetch_add(1, Ordering::Relaxed)
            },
            max_pool_size,
        );

        (pool, calls)
    }

    #[test]
    fn acquire_calls_factory_for_new_cell() {
        let (pool, calls) = counting_pool(4);

        let mut cell = pool.acquire();

        assert_eq!(*cell.get().unwrap(), 0);
        assert_eq!(cell.ref_count(), 1);
        assert_eq!(calls.load(Ordering::Relaxed), 1);
        assert_eq!(pool.pool_size(), 0);
        assert_eq!(pool.allocated_cells(), 1);

        cell.release().unwrap();
    }

    #[test]
    fn release_returns_cell_with_payload() {
        let (pool, calls) = counting_pool(1);

        let mut first = pool.acquire();
        first.release().unwrap();
        assert_eq!(pool.pool_size(), 1);

        let mut second = pool.acquire();
        assert!(second.ptr_eq(&first));
        assert_eq!(*second.get().unwrap(), 0);
        assert_eq!(second.ref_count(), 1);
        assert_eq!(pool.pool_size(), 0);
        assert_eq!(calls.load(Ordering::Relaxed), 1);

        second.release().unwrap();
    }

    #[test]
    fn concurrent_holders_get_distinct_cells() {
        let (pool, calls) = counting_pool(1);

        let mut a = pool.acquire();
        let mut b = pool.acquire();

        assert!(!a.ptr_eq(&b));
        assert_eq!(calls.load(Ordering::Relaxed), 2);
        assert_eq!(pool.pool_size(), 0);

        a.release().unwrap();
        b.release().unwrap();

        // Only one payload fits, the other one was dropped.
        assert_eq!(pool.pool_size(), 1);
        assert_eq!(pool.allocated_cells(), 2);
    }

    #[test]
    fn zero_capacity_never_reuses_payload() {
        let (pool, calls) = counting_pool(0);

        let mut first = pool.acquire();
        first.release().unwrap();
        assert_eq!(pool.pool_size(), 0);

        let mut second = pool.acquire();
        assert_eq!(*second.get().unwrap(), 1);
        assert_eq!(calls.load(Ordering::Relaxed), 2);

        // The storage of the evicted cell is recycled even though its payload is not.
        assert!(second.ptr_eq(&first));
        assert_eq!(pool.allocated_cells(), 1);

        second.release().unwrap();
    }

    #[test]
    fn evicted_payload_is_dropped_on_release() {
        let payload = Arc::new(());
        let pool = Pool::new(
            {
                let payload = Arc::clone(&payload);
                move || Arc::clone(&payload)
            },
            0,
        );

        // The factory holds one reference of its own.
        let mut cell = pool.acquire();
        assert_eq!(Arc::strong_count(&payload), 3);

        cell.release().unwrap();
        assert_eq!(Arc::strong_count(&payload), 2);
    }

    #[test]
    fn idle_payloads_are_dropped_with_pool() {
        let payload = Arc::new(());

        {
            let pool = Pool::new(
                {
                    let payload = Arc::clone(&payload);
                    move || Arc::clone(&payload)
                },
                8,
            );

            let mut cells = (0..3).map(|_| pool.acquire()).collect::<Vec<_>>();
            for cell in &mut cells {
                cell.release().unwrap();
            }

            assert_eq!(pool.pool_size(), 3);
            assert_eq!(Arc::strong_count(&payload), 5);
        }

        assert_eq!(Arc::strong_count(&payload), 1);
    }

    #[test]
    fn cells_keep_pool_storage_alive() {
        let pool = Pool::new(|| "kept".to_string(), 4);

        let mut cell = pool.acquire();
        drop(pool);

        assert_eq!(cell.get().unwrap(), "kept");
        cell.release().unwrap();
    }

    #[test]
    fn register_consumer_assigns_increasing_bits() {
        let pool = Pool::new(|| 0_u8, 1);

        for shift in 0..MAX_CONSUMERS {
            let token = pool.register_consumer().unwrap();
            assert_eq!(token.bit(), 1 << shift);
        }

        assert_eq!(pool.consumer_mask(), u64::MAX);
        assert!(matches!(
            pool.register_consumer(),
            Err(Error::ConsumerCapacityExceeded)
        ));
    }

    #[cfg_attr(miri, ignore)] // Too slow under Miri.
    #[test]
    fn concurrent_registration_hands_out_unique_bits() {
        let pool = Pool::new(|| 0_u8, 1);

        let bits = thread::scope(|s| {
            let workers = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        (0..8)
                            .map(|_| pool.register_consumer().unwrap().bit())
                            .collect::<Vec<_>>()
                    })
                })
                .collect::<Vec<_>>();

            workers
                .into_iter()
                .flat_map(|worker| worker.join().unwrap())
                .fold(0_u64, |mask, bit| {
                    assert_eq!(mask & bit, 0, "bit {bit:#x} handed out twice");
                    mask | bit
                })
        });

        assert_eq!(bits, u64::MAX);
    }

    #[test]
    fn clones_share_state() {
        let pool = Pool::new(|| 0_u8, 2);
        let clone = pool.clone();

        assert!(pool.ptr_eq(&clone));

        let mut cell = clone.acquire();
        cell.release().unwrap();

        assert_eq!(pool.pool_size(), 1);
    }

    #[test]
    fn distinct_pools_are_not_equal() {
        let a = Pool::new(|| 0_u8, 2);
        let b = Pool::new(|| 0_u8, 2);

        assert!(!a.ptr_eq(&b));
        assert_ne!(a.inner.id(), b.inner.id());
    }

    #[cfg_attr(miri, ignore)] // Too slow under Miri.
    #[test]
    fn concurrent_release_never_exceeds_capacity() {
        const MAX_POOL_SIZE: usize = 4;

        let (pool, _) = counting_pool(MAX_POOL_SIZE);

        thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..2_000 {
                        let mut cells = (0..3).map(|_| pool.acquire()).collect::<Vec<_>>();

                        for cell in &mut cells {
                            cell.release().unwrap();
                        }

                        assert!(pool.pool_size() <= MAX_POOL_SIZE);
                    }
                });
            }
        });

        assert!(pool.pool_size() <= MAX_POOL_SIZE);
    }

    #[test]
    fn evicted_cell_takes_fresh_snapshot_under_first_construction() {
        let pool = Pool::builder()
            .factory(|| 0_u8)
            .max_pool_size(0)
            .consumer_mask_policy(ConsumerMaskPolicy::FirstConstruction)
            .build();

        let mut first = pool.acquire();
        first.release().unwrap();

        let late = pool.register_consumer().unwrap();

        // The payload was evicted, so the cell is rebuilt as if it were new.
        let mut second = pool.acquire();
        assert!(second.ptr_eq(&first));
        assert_eq!(second.consumer_mask(), late.bit());
        assert!(late.check_access(&second).is_ok());

        second.release().unwrap();
    }

    #[test]
    fn panicking_factory_keeps_cell_for_reuse() {
        let fail_next = Arc::new(AtomicBool::new(true));

        let pool = Pool::new(
            {
                let fail_next = Arc::clone(&fail_next);
                move || {
                    assert!(
                        !fail_next.swap(false, Ordering::Relaxed),
                        "factory failure"
                    );
                    7_u32
                }
            },
            4,
        );

        let result = panic::catch_unwind(AssertUnwindSafe(|| pool.acquire()));
        assert!(result.is_err());
        assert_eq!(pool.allocated_cells(), 1);

        let mut cell = pool.acquire();
        assert_eq!(*cell.get().unwrap(), 7);

        // The cell abandoned by the failed acquire was filled instead of allocating another.
        assert_eq!(pool.allocated_cells(), 1);

        cell.release().unwrap();
    }

    fn event_count(report: &Report, name: &str) -> u64 {
        report
            .events()
            .find(|event| event.name().as_ref() == name)
            .map_or(0, |event| event.count())
    }

    #[test]
    fn acquire_paths_are_counted() {
        const EVENTS: [&str; 5] = [
            "counted_pool_acquire_created",
            "counted_pool_acquire_reused",
            "counted_pool_acquire_revived",
            "counted_pool_factory_invoked",
            "counted_pool_payload_evicted",
        ];

        let pool = Pool::new(|| 0_u8, 1);

        let before = Report::collect();

        // Two new cells, one of which does not fit into the pool on release.
        let mut a = pool.acquire();
        let mut b = pool.acquire();
        a.release().unwrap();
        b.release().unwrap();

        // One comes back with its payload, the other one without.
        let mut reused = pool.acquire();
        let mut revived = pool.acquire();
        reused.release().unwrap();
        revived.release().unwrap();

        let after = Report::collect();

        // Other tests may record events concurrently, so only lower bounds hold.
        let expected = [2, 1, 1, 3, 2];

        for (name, expected) in EVENTS.into_iter().zip(expected) {
            let delta = event_count(&after, name) - event_count(&before, name);
            assert!(delta >= expected, "{name}: expected at least {expected}, got {delta}");
        }
    }
}
