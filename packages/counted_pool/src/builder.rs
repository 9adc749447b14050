use std::any::type_name;
use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;

use crate::{ConsumerMaskPolicy, Pool, pool::Factory};

/// Number of released payloads a pool keeps for reuse unless configured otherwise.
pub const DEFAULT_MAX_POOL_SIZE: usize = 512;

/// Builder for creating an instance of [`Pool`].
///
/// The payload factory is mandatory, whereas other settings are optional.
///
/// # Examples
///
/// ```
/// use counted_pool::{ConsumerMaskPolicy, Pool};
///
/// let pool = Pool::builder()
///     .factory(|| Vec::<u8>::with_capacity(4096))
///     .max_pool_size(32)
///     .consumer_mask_policy(ConsumerMaskPolicy::FirstConstruction)
///     .build();
///
/// assert_eq!(pool.max_pool_size(), 32);
/// ```
///
/// # Thread safety
///
/// The builder is thread-mobile ([`Send`]) and can be safely transferred between threads,
/// allowing pool configuration to happen on different threads than where the pool is used.
/// However, it is not thread-safe ([`Sync`]) as it contains mutable configuration state.
#[must_use]
pub struct PoolBuilder<T> {
    factory: Option<Factory<T>>,
    max_pool_size: usize,
    consumer_mask_policy: ConsumerMaskPolicy,

    // Prevents Sync while allowing Send - builders are thread-mobile but not thread-safe
    _not_sync: PhantomData<Cell<()>>,
}

impl<T> PoolBuilder<T> {
    pub(crate) fn new() -> Self {
        Self {
            factory: None,
            max_pool_size: DEFAULT_MAX_POOL_SIZE,
            consumer_mask_policy: ConsumerMaskPolicy::default(),
            _not_sync: PhantomData,
        }
    }

    /// Sets the function that produces a payload whenever the pool has none to reuse.
    ///
    /// The factory may be called from any thread that acquires from the pool.
    pub fn factory<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.factory = Some(Box::new(factory));
        self
    }

    /// Sets how many released payloads the pool keeps for reuse.
    ///
    /// Zero is allowed and disables payload reuse entirely. Defaults to
    /// [`DEFAULT_MAX_POOL_SIZE`].
    pub fn max_pool_size(mut self, max_pool_size: usize) -> Self {
        self.max_pool_size = max_pool_size;
        self
    }

    /// Sets when cells take their snapshot of the registered consumers.
    ///
    /// Defaults to [`ConsumerMaskPolicy::RefreshOnAcquire`].
    pub fn consumer_mask_policy(mut self, policy: ConsumerMaskPolicy) -> Self {
        self.consumer_mask_policy = policy;
        self
    }

    /// Builds the pool with the specified configuration.
    ///
    /// # Panics
    ///
    /// Panics if no factory has been set using [`factory`](Self::factory).
    #[must_use]
    pub fn build(self) -> Pool<T> {
        let factory = self
            .factory
            .expect("factory must be set using .factory() before calling .build()");

        Pool::new_inner(factory, self.max_pool_size, self.consumer_mask_policy)
    }
}

impl<T> fmt::Debug for PoolBuilder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(type_name::<Self>())
            .field("has_factory", &self.factory.is_some())
            .field("max_pool_size", &self.max_pool_size)
            .field("consumer_mask_policy", &self.consumer_mask_policy)
            .finish()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;

    assert_impl_all!(PoolBuilder<String>: Send, fmt::Debug);
    assert_not_impl_any!(PoolBuilder<String>: Sync);

    #[test]
    fn defaults() {
        let pool = Pool::builder().factory(|| 0_u8).build();

        assert_eq!(pool.max_pool_size(), DEFAULT_MAX_POOL_SIZE);
        assert_eq!(
            pool.consumer_mask_policy(),
            ConsumerMaskPolicy::RefreshOnAcquire
        );
    }

    #[test]
    fn settings_are_applied() {
        let pool = Pool::builder()
            .factory(|| 0_u8)
            .max_pool_size(0)
            .consumer_mask_policy(ConsumerMaskPolicy::FirstConstruction)
            .build();

        assert_eq!(pool.max_pool_size(), 0);
        assert_eq!(
            pool.consumer_mask_policy(),
            ConsumerMaskPolicy::FirstConstruction
        );
    }

    #[test]
    fn later_factory_wins() {
        let pool = Pool::builder().factory(|| 1_u8).factory(|| 2_u8).build();

        let mut cell = pool.acquire();
        assert_eq!(*cell.get().unwrap(), 2);
        cell.release().unwrap();
    }

    #[test]
    #[should_panic]
    fn build_without_factory_panics() {
        drop(Pool::<u8>::builder().build());
    }

    #[test]
    fn debug_reports_configuration() {
        let builder = Pool::builder().factory(|| 0_u8).max_pool_size(3);

        let output = format!("{builder:?}");

        assert!(output.contains("has_factory: true"));
        assert!(output.contains("max_pool_size: 3"));
    }
}
