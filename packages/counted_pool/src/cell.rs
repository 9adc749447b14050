use std::any::type_name;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::ptr::{self, NonNull};
use std::sync::Arc;

use tracing::{error, warn};

use crate::{Error, PoolInner, Result, Slot};

/// One handle to a reference-counted payload owned by a [`Pool`][crate::Pool].
///
/// A cell is obtained from [`Pool::acquire()`][crate::Pool::acquire] with a reference count of
/// 1. Every [`copy()`][Self::copy] creates another handle to the same payload and adds one
/// reference. Every handle must be given up with [`release()`][Self::release]. The release that
/// takes the count to zero returns the cell and its payload to the pool.
///
/// Handles are not `Clone`: copying is fallible and must be explicit. Dropping a handle that was
/// never released leaks its reference. The payload is then never recycled, and a warning is
/// logged. Use [`scoped()`][Self::scoped] if the handle should be released automatically.
///
/// # Thread safety
///
/// A cell is `Send` and `Sync` if `T` is `Send` and `Sync`. Copies may be handed to other
/// threads and released there.
///
/// # Examples
///
/// ```
/// use counted_pool::{Error, Pool};
///
/// let pool = Pool::new(|| 42_u32, 4);
///
/// let mut cell = pool.acquire();
/// assert_eq!(*cell.get()?, 42);
///
/// cell.release()?;
///
/// // A released handle gives access to nothing.
/// assert!(matches!(cell.get(), Err(Error::ZeroReference)));
/// assert!(matches!(cell.release(), Err(Error::Underflow)));
/// # Ok::<(), Error>(())
/// ```
pub struct Cell<T> {
    pool: Arc<PoolInner<T>>,

    // Points into the arena owned by `pool`, which never frees slots while it is alive.
    slot: NonNull<Slot<T>>,

    released: bool,
}

// SAFETY: The slot pointer refers to storage kept alive by the `Arc` we hold. All shared state in
// the slot is atomic except the payload, which requires `T: Send + Sync` to be shared across
// threads the way copies of a cell share it.
unsafe impl<T: Send + Sync> Send for Cell<T> {}

// SAFETY: See above. `&Cell` only gives out `&T`, which is fine for `T: Sync`.
unsafe impl<T: Send + Sync> Sync for Cell<T> {}

impl<T> Cell<T> {
    /// The caller must have just moved the slot's reference count from 0 to 1 (or added a
    /// reference on behalf of this handle).
    pub(crate) fn new(pool: Arc<PoolInner<T>>, slot: &Slot<T>) -> Self {
        Self {
            pool,
            slot: NonNull::from(slot),
            released: false,
        }
    }

    fn slot(&self) -> &Slot<T> {
        // SAFETY: The arena owned by `self.pool` keeps every slot at a fixed address until it is
        // dropped, and we hold the pool alive.
        unsafe { self.slot.as_ref() }
    }

    pub(crate) fn pool_id(&self) -> u64 {
        self.pool.id()
    }

    /// Borrows the payload.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ZeroReference`] if this handle has already been released.
    pub fn get(&self) -> Result<&T> {
        if self.released {
            return Err(Error::ZeroReference);
        }

        // SAFETY: This handle holds a reference until it is released, which requires `&mut self`
        // and therefore cannot happen while the returned borrow is alive.
        let value = unsafe { self.slot().value() };

        // An acquired cell always carries a payload.
        value.ok_or(Error::ZeroReference)
    }

    /// Mutably borrows the payload if this handle is the only one referring to it.
    ///
    /// Returns `Ok(None)` while other handles to the same payload exist.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ZeroReference`] if this handle has already been released.
    ///
    /// # Examples
    ///
    /// ```
    /// use counted_pool::Pool;
    ///
    /// let pool = Pool::new(Vec::<u8>::new, 4);
    /// let mut cell = pool.acquire();
    ///
    /// cell.get_mut()?.expect("only handle").push(1);
    ///
    /// let mut copy = cell.copy()?;
    /// assert!(cell.get_mut()?.is_none());
    ///
    /// copy.release()?;
    /// assert_eq!(cell.get_mut()?.map(|v| v.len()), Some(1));
    ///
    /// cell.release()?;
    /// # Ok::<(), counted_pool::Error>(())
    /// ```
    pub fn get_mut(&mut self) -> Result<Option<&mut T>> {
        if self.released {
            return Err(Error::ZeroReference);
        }

        let slot = self.slot();

        if slot.ref_count() != 1 {
            return Ok(None);
        }

        // SAFETY: We hold a reference and the count is 1, so ours is the only handle. New
        // handles can only be created by copying ours, which needs `&self` and is excluded by
        // the `&mut self` borrow we hold for as long as the returned reference lives.
        Ok(unsafe { slot.value_mut() })
    }

    /// Creates another handle to the same payload, adding one reference.
    ///
    /// # Errors
    ///
    /// * [`Error::ZeroReference`] if this handle has already been released.
    /// * [`Error::Overflow`] if the reference count is already at its maximum of `i32::MAX - 1`.
    pub fn copy(&self) -> Result<Self> {
        if self.released {
            return Err(Error::ZeroReference);
        }

        self.slot().increment()?;

        Ok(Self::new(Arc::clone(&self.pool), self.slot()))
    }

    /// Gives up the reference held by this handle.
    ///
    /// If this was the last reference, the cell goes back to the pool. The payload is kept for
    /// reuse if the pool has room for it and dropped otherwise.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Underflow`] if this handle has already been released. Nothing changes in
    /// that case.
    pub fn release(&mut self) -> Result<()> {
        if self.released {
            return Err(Error::Underflow);
        }

        let previous = self.slot().decrement()?;

        self.released = true;

        if previous == 1 {
            self.pool.return_object(self.slot());
        }

        Ok(())
    }

    /// Current number of handles referring to the payload.
    ///
    /// This is a snapshot that other threads may change at any moment. After this handle has
    /// been released, the count belongs to whoever holds the cell next.
    #[must_use]
    pub fn ref_count(&self) -> i32 {
        self.slot().ref_count()
    }

    /// Whether [`release()`][Self::release] has already been called on this handle.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Consumers that may access this cell, as captured according to the pool's
    /// [`ConsumerMaskPolicy`][crate::ConsumerMaskPolicy].
    #[must_use]
    pub fn consumer_mask(&self) -> u64 {
        self.slot().consumer_mask()
    }

    /// Whether both handles refer to the same pooled cell.
    ///
    /// Cells are recycled, so a released handle compares equal to whichever handle later
    /// acquires the same cell.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        ptr::eq(self.slot.as_ptr(), other.slot.as_ptr())
    }

    /// Wraps the handle so that it is released automatically when dropped.
    #[must_use]
    pub fn scoped(self) -> ScopedCell<T> {
        ScopedCell { cell: self }
    }
}

impl<T> Drop for Cell<T> {
    fn drop(&mut self) {
        if !self.released {
            warn!(
                pool_id = self.pool.id(),
                slot = self.slot().index(),
                "cell dropped without being released, its payload will not be recycled"
            );
        }
    }
}

impl<T> fmt::Debug for Cell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("pool_id", &self.pool.id())
            .field("slot", &self.slot().index())
            .field("ref_count", &self.ref_count())
            .field("released", &self.released)
            .finish()
    }
}

/// A [`Cell`] that releases itself when dropped.
///
/// Created by [`Cell::scoped()`]. Dereferences to the wrapped cell, so the payload is reached via
/// [`get()`][Cell::get] as usual.
///
/// # Examples
///
/// ```
/// use counted_pool::Pool;
///
/// let pool = Pool::new(String::new, 4);
///
/// {
///     let cell = pool.acquire().scoped();
///     assert!(cell.get()?.is_empty());
/// }
///
/// assert_eq!(pool.pool_size(), 1);
/// # Ok::<(), counted_pool::Error>(())
/// ```
pub struct ScopedCell<T> {
    cell: Cell<T>,
}

impl<T> ScopedCell<T> {
    /// Creates another self-releasing handle to the same payload.
    ///
    /// # Errors
    ///
    /// See [`Cell::copy()`].
    pub fn copy(&self) -> Result<Self> {
        self.cell.copy().map(Cell::scoped)
    }
}

impl<T> Deref for ScopedCell<T> {
    type Target = Cell<T>;

    fn deref(&self) -> &Self::Target {
        &self.cell
    }
}

impl<T> DerefMut for ScopedCell<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.cell
    }
}

impl<T> Drop for ScopedCell<T> {
    fn drop(&mut self) {
        if self.cell.is_released() {
            return;
        }

        if let Err(e) = self.cell.release() {
            error!(error = %e, "failed to release scoped cell");
        }
    }
}

impl<T> fmt::Debug for ScopedCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("cell", &self.cell)
            .finish()
    }
}
