use crate::{Cell, Error, Result};

/// Maximum number of consumers that can be registered with one pool.
pub const MAX_CONSUMERS: u32 = u64::BITS;

/// Determines when a cell takes its snapshot of the consumers registered with the pool.
///
/// A [`ConsumerToken`] only grants access to a cell whose snapshot contains the token's bit.
///
/// # Examples
///
/// ```
/// use counted_pool::{ConsumerMaskPolicy, Pool};
///
/// let pool = Pool::builder()
///     .factory(|| 0_u64)
///     .consumer_mask_policy(ConsumerMaskPolicy::FirstConstruction)
///     .build();
/// # _ = pool;
/// ```
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum ConsumerMaskPolicy {
    /// Every acquisition refreshes the snapshot from the consumers currently registered with the
    /// pool. A consumer gains access to all cells acquired after its registration. This is the
    /// default.
    #[default]
    RefreshOnAcquire,

    /// The snapshot is taken when the cell is constructed and kept for as long as the cell is
    /// recycled together with its payload.
    ///
    /// Consumers registered after a cell was created are not granted access to that cell. A cell
    /// whose payload was dropped because the pool was full is constructed anew on its next
    /// acquisition and takes a new snapshot then.
    FirstConstruction,
}

/// A capability representing one consumer registered with a pool.
///
/// Obtained from [`Pool::register_consumer()`][crate::Pool::register_consumer]. Each token
/// carries a distinct bit of the pool's 64-bit consumer mask.
///
/// # Examples
///
/// ```
/// use counted_pool::Pool;
///
/// let pool = Pool::new(String::new, 16);
///
/// let token = pool.register_consumer()?;
/// assert_eq!(token.bit(), 1);
///
/// let mut cell = pool.acquire();
/// token.check_access(&cell)?;
/// cell.release()?;
/// # Ok::<(), counted_pool::Error>(())
/// ```
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ConsumerToken {
    pool_id: u64,
    bit: u64,
}

impl ConsumerToken {
    pub(crate) fn new(pool_id: u64, bit: u64) -> Self {
        debug_assert!(bit.is_power_of_two());

        Self { pool_id, bit }
    }

    /// The single-bit mask assigned to this consumer.
    #[must_use]
    pub fn bit(&self) -> u64 {
        self.bit
    }

    /// Verifies that this consumer may access the cell, returning the same cell on success.
    ///
    /// # Errors
    ///
    /// * [`Error::AccessDenied`] if the cell comes from a different pool or its consumer snapshot
    ///   does not include this consumer (see [`ConsumerMaskPolicy`]).
    /// * [`Error::ZeroReference`] if the handle has already been released.
    pub fn check_access<'c, T>(&self, cell: &'c Cell<T>) -> Result<&'c Cell<T>> {
        if cell.is_released() {
            return Err(Error::ZeroReference);
        }

        if cell.pool_id() != self.pool_id || cell.consumer_mask() & self.bit == 0 {
            return Err(Error::AccessDenied {
                consumer_bit: self.bit,
            });
        }

        Ok(cell)
    }
}

/// Selects the bit for the next consumer: the bit immediately above the highest bit already set
/// in `mask`, or bit 0 for an empty mask.
///
/// Returns `None` once bit 63 has been handed out.
pub(crate) fn next_consumer_bit(mask: u64) -> Option<u64> {
    if mask == 0 {
        return Some(1);
    }

    let highest = u64::BITS.wrapping_sub(1).wrapping_sub(mask.leading_zeros());

    1_u64.checked_shl(highest.wrapping_add(1))
}
