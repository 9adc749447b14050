use std::any::{Any, type_name};
use std::fmt;
use std::sync::LazyLock;

use foldhash::{HashMap, HashMapExt};
use parking_lot::Mutex;
use tracing::debug;

use crate::{Error, Pool, Result};

/// A name-keyed collection of pools, so that unrelated parts of a program can share a pool
/// without passing it around.
///
/// The first [`get_or_create()`][Self::get_or_create] for a name creates the pool. Every later
/// call for the same name returns a handle to that same pool and ignores its own factory and
/// capacity. Lookups are linearizable: concurrent first calls for one name agree on a single pool.
///
/// Pools registered here live until the registry itself is dropped, which for
/// [`PoolRegistry::global()`] means for the rest of the process.
///
/// # Examples
///
/// ```
/// use counted_pool::PoolRegistry;
///
/// let registry = PoolRegistry::new();
///
/// let a = registry.get_or_create("buffers", || vec![0_u8; 256], 16)?;
/// let b = registry.get_or_create("buffers", || vec![1_u8; 1], 1)?;
///
/// assert!(a.ptr_eq(&b));
/// assert_eq!(b.max_pool_size(), 16);
/// # Ok::<(), counted_pool::Error>(())
/// ```
pub struct PoolRegistry {
    pools: Mutex<HashMap<String, Entry>>,
}

struct Entry {
    /// Always a `Pool<T>` for the `T` named by `item_type`.
    pool: Box<dyn Any + Send + Sync>,
    item_type: &'static str,
}

static GLOBAL: LazyLock<PoolRegistry> = LazyLock::new(PoolRegistry::new);

impl PoolRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            pools: Mutex::new(HashMap::new()),
        }
    }

    /// The process-wide registry.
    #[must_use]
    pub fn global() -> &'static Self {
        &GLOBAL
    }

    /// Returns the pool registered under `name`, creating it with `factory` and `max_pool_size`
    /// if the name is not registered yet.
    ///
    /// The factory is not called here, only stored in the new pool.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolTypeMismatch`] if `name` is registered for a different payload type.
    pub fn get_or_create<T, F>(
        &self,
        name: &str,
        factory: F,
        max_pool_size: usize,
    ) -> Result<Pool<T>>
    where
        T: Send + Sync + 'static,
        F: Fn() -> T + Send + Sync + 'static,
    {
        let mut pools = self.pools.lock();

        if let Some(entry) = pools.get(name) {
            return entry.downcast(name);
        }

        let pool = Pool::new(factory, max_pool_size);

        debug!(name, item_type = type_name::<T>(), max_pool_size, "registered named pool");

        pools.insert(
            name.to_string(),
            Entry {
                pool: Box::new(pool.clone()),
                item_type: type_name::<T>(),
            },
        );

        Ok(pool)
    }

    /// Returns the pool registered under `name`, if any.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolTypeMismatch`] if `name` is registered for a different payload type.
    pub fn get<T>(&self, name: &str) -> Result<Option<Pool<T>>>
    where
        T: Send + Sync + 'static,
    {
        self.pools
            .lock()
            .get(name)
            .map(|entry| entry.downcast(name))
            .transpose()
    }

    /// Number of registered pools.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pools.lock().len()
    }

    /// Whether no pool has been registered yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pools.lock().is_empty()
    }
}

impl Entry {
    fn downcast<T>(&self, name: &str) -> Result<Pool<T>>
    where
        T: Send + Sync + 'static,
    {
        self.pool
            .downcast_ref::<Pool<T>>()
            .cloned()
            .ok_or_else(|| Error::PoolTypeMismatch {
                name: name.to_string(),
                existing_type: self.item_type,
            })
    }
}

impl Default for PoolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PoolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pools = self.pools.lock();

        f.debug_map()
            .entries(pools.iter().map(|(name, entry)| (name, entry.item_type)))
            .finish()
    }
}

impl<T> Pool<T>
where
    T: Send + Sync + 'static,
{
    /// Returns the pool registered under `name` in the [global registry][PoolRegistry::global],
    /// creating it if necessary.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolTypeMismatch`] if `name` is registered for a different payload type.
    ///
    /// # Examples
    ///
    /// ```
    /// use counted_pool::Pool;
    ///
    /// let pool = Pool::get_or_create_named("doc-example-strings", String::new, 8)?;
    /// let same = Pool::<String>::get_or_create_named("doc-example-strings", String::new, 8)?;
    ///
    /// assert!(pool.ptr_eq(&same));
    /// # Ok::<(), counted_pool::Error>(())
    /// ```
    pub fn get_or_create_named<F>(name: &str, factory: F, max_pool_size: usize) -> Result<Self>
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        PoolRegistry::global().get_or_create(name, factory, max_pool_size)
    }
}
