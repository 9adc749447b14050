//! Metrics for pool activity.
//!
//! The events are per-thread instances to avoid contention on the hot path. Use
//! [`nm::Report::collect()`] to read them.

use nm::Event;

thread_local! {
    /// A cell was acquired by reusing an idle cell together with its payload.
    pub(crate) static ACQUIRE_REUSED: Event = Event::builder()
        .name("counted_pool_acquire_reused")
        .build();

    /// A cell was acquired by reusing a cell whose payload had been evicted.
    pub(crate) static ACQUIRE_REVIVED: Event = Event::builder()
        .name("counted_pool_acquire_revived")
        .build();

    /// A cell was acquired by creating a brand new cell.
    pub(crate) static ACQUIRE_CREATED: Event = Event::builder()
        .name("counted_pool_acquire_created")
        .build();

    /// The payload factory was called.
    pub(crate) static FACTORY_INVOKED: Event = Event::builder()
        .name("counted_pool_factory_invoked")
        .build();

    /// A released payload was dropped because the pool was already at capacity.
    pub(crate) static PAYLOAD_EVICTED: Event = Event::builder()
        .name("counted_pool_payload_evicted")
        .build();
}
