#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

//! A lock-free pool of manually reference-counted cells that recycles their payloads.
//!
//! Payloads that are expensive to construct (large buffers, parsers, connections) are produced
//! once by a factory and then handed out again and again. A [`Pool`] hands out [`Cell`]s with a
//! reference count of 1. Holders [`copy()`][Cell::copy] a cell to share its payload, for example
//! with several consumer threads, and [`release()`][Cell::release] every handle they hold. When
//! the last handle is released, the cell returns to the pool with its payload intact.
//!
//! Reference counting is explicit instead of being tied to `Clone` and `Drop`, so that misuse
//! such as releasing a handle twice is reported as an [`Error`] instead of silently corrupting
//! the count. [`ScopedCell`] is available where automatic release on drop is preferred.
//!
//! # Quick start
//!
//! ```
//! use counted_pool::Pool;
//!
//! let pool = Pool::new(|| vec![0_u8; 64 * 1024], 16);
//!
//! let mut buffer = pool.acquire();
//! buffer.get_mut()?.expect("fresh cell has one handle")[0] = 1;
//!
//! let mut shared = buffer.copy()?;
//! assert_eq!(shared.get()?[0], 1);
//!
//! shared.release()?;
//! buffer.release()?;
//!
//! // The next acquire gets the same buffer back without calling the factory.
//! let mut again = pool.acquire();
//! assert_eq!(again.get()?[0], 1);
//! again.release()?;
//! # Ok::<(), counted_pool::Error>(())
//! ```
//!
//! # Consumers
//!
//! A pool can hand out up to 64 [`ConsumerToken`]s. Each cell carries a snapshot of the consumers
//! registered with its pool and a token only grants access to cells whose snapshot contains it.
//! When the snapshot is taken is governed by [`ConsumerMaskPolicy`].
//!
//! ```
//! use counted_pool::{Error, Pool};
//!
//! let pool = Pool::new(String::new, 16);
//!
//! let early = pool.register_consumer()?;
//! let mut cell = pool.acquire();
//! let late = pool.register_consumer()?;
//!
//! assert!(early.check_access(&cell).is_ok());
//! assert!(matches!(late.check_access(&cell), Err(Error::AccessDenied { .. })));
//!
//! cell.release()?;
//! # Ok::<(), Error>(())
//! ```
//!
//! # Named pools
//!
//! [`PoolRegistry`] maps names to pools so that unrelated components can share one pool. The
//! process-wide registry is reached via [`PoolRegistry::global()`] or the
//! [`Pool::get_or_create_named()`] shortcut.
//!
//! # Metrics
//!
//! Acquisitions and payload evictions are recorded as [`nm`] events named `counted_pool_*`.
//!
//! # Capacity
//!
//! [`Pool::max_pool_size()`] bounds the number of released payloads the pool keeps. The storage
//! of the cells themselves is never freed while the pool lives and is bounded by the highest
//! number of cells ever held at the same time.

mod arena;
mod builder;
mod cell;
mod consumer;
mod error;
mod free_list;
mod metrics;
mod pool;
mod registry;
mod slot;

pub(crate) use arena::*;
pub use builder::*;
pub use cell::*;
pub use consumer::*;
pub use error::*;
pub(crate) use free_list::*;
pub use pool::Pool;
pub(crate) use pool::PoolInner;
pub use registry::*;
pub(crate) use slot::*;
