//! Two independent components share market data snapshots through a named pool.
//!
//! The feed handler and the strategy never pass the pool to each other. Both look it up by name
//! in the global registry. The strategy registers itself as a consumer and checks each snapshot
//! it receives with its token before reading it.

use std::sync::mpsc;
use std::thread;

use counted_pool::{Cell, ConsumerToken, Pool};

const POOL_NAME: &str = "market-data";

#[derive(Debug)]
struct MarketData {
    security_id: u64,
    bid: f64,
    ask: f64,
}

impl MarketData {
    fn new() -> Self {
        Self {
            security_id: 0,
            bid: f64::NAN,
            ask: f64::NAN,
        }
    }

    fn clear(&mut self) -> &mut Self {
        *self = Self::new();
        self
    }

    fn set_security_id(&mut self, security_id: u64) -> &mut Self {
        self.security_id = security_id;
        self
    }

    fn set_bid(&mut self, bid: f64) -> &mut Self {
        self.bid = bid;
        self
    }

    fn set_ask(&mut self, ask: f64) -> &mut Self {
        self.ask = ask;
        self
    }
}

fn market_data_pool() -> Result<Pool<MarketData>, counted_pool::Error> {
    Pool::get_or_create_named(POOL_NAME, MarketData::new, 64)
}

fn main() -> Result<(), counted_pool::Error> {
    // The strategy registers before any snapshot is acquired, so it can read all of them.
    let token = market_data_pool()?.register_consumer()?;

    let (sender, receiver) = mpsc::channel();

    thread::scope(|s| {
        let feed = s.spawn(move || run_feed_handler(&sender));
        let strategy = s.spawn(move || run_strategy(token, &receiver));

        feed.join().expect("feed handler panicked")?;
        strategy.join().expect("strategy panicked")
    })?;

    let pool = market_data_pool()?;
    println!(
        "pool size = {}, cells allocated = {}",
        pool.pool_size(),
        pool.allocated_cells()
    );

    Ok(())
}

fn run_feed_handler(strategy: &mpsc::Sender<Cell<MarketData>>) -> Result<(), counted_pool::Error> {
    let pool = market_data_pool()?;

    for tick in 0..1_000_u32 {
        let mut cell = pool.acquire();

        cell.get_mut()?
            .expect("a freshly acquired cell has exactly one handle")
            .clear()
            .set_security_id(u64::from(tick % 4))
            .set_bid(100.0 + f64::from(tick) / 100.0)
            .set_ask(100.5 + f64::from(tick) / 100.0);

        // Hand ownership of our reference over to the strategy.
        strategy.send(cell).expect("strategy outlives the feed handler");
    }

    Ok(())
}

fn run_strategy(
    token: ConsumerToken,
    feed: &mpsc::Receiver<Cell<MarketData>>,
) -> Result<(), counted_pool::Error> {
    let mut spread_sum = 0.0;
    let mut count = 0_u32;
    let mut securities = 0_u64;

    while let Ok(cell) = feed.recv() {
        // Released when it goes out of scope, also if the access check fails.
        let cell = cell.scoped();

        let snapshot = token.check_access(&*cell)?.get()?;
        spread_sum += snapshot.ask - snapshot.bid;
        securities |= 1 << snapshot.security_id;
        count = count.wrapping_add(1);
    }

    println!(
        "strategy processed {count} snapshots of {} securities, average spread {:.3}",
        securities.count_ones(),
        spread_sum / f64::from(count.max(1))
    );

    Ok(())
}
