//! One producer fans pooled payloads out to several consumer threads while a separate runner
//! thread acquires and releases payloads from the same pool.
//!
//! Every consumer receives its own copy of each cell and releases it when done. Once the last
//! consumer is finished with a payload, the pool recycles it. The payload factory is therefore
//! called far fewer times than there are acquisitions.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use counted_pool::{Cell, Pool};

const PRODUCER_ROUNDS: usize = 201;
const RUNNER_ROUNDS: usize = 201;

static OBJECTS_CREATED: AtomicUsize = AtomicUsize::new(0);

/// Stands in for something that is costly to construct.
#[derive(Debug)]
struct ExpensiveObject {
    id: usize,
    exit_signal: bool,
}

impl ExpensiveObject {
    fn new() -> Self {
        let id = OBJECTS_CREATED.fetch_add(1, Ordering::Relaxed).wrapping_add(1);

        Self {
            id,
            exit_signal: false,
        }
    }

    fn do_something(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

fn main() -> Result<(), counted_pool::Error> {
    let pool = Pool::new(ExpensiveObject::new, 512);

    let consumer_delays = [1, 2, 5].map(Duration::from_millis);

    let (senders, receivers): (Vec<_>, Vec<_>) = consumer_delays
        .iter()
        .map(|_| mpsc::channel::<Cell<ExpensiveObject>>())
        .unzip();

    thread::scope(|s| {
        let mut workers = receivers
            .into_iter()
            .zip(consumer_delays)
            .enumerate()
            .map(|(index, (receiver, delay))| s.spawn(move || consume(index, &receiver, delay)))
            .collect::<Vec<_>>();

        let pool = &pool;

        // The producer owns the senders, so consumers stop waiting once it is done.
        workers.push(s.spawn(move || produce(pool, senders, Duration::from_millis(2))));
        workers.push(s.spawn(move || run(pool, Duration::from_millis(5))));

        workers
            .into_iter()
            .try_for_each(|worker| worker.join().expect("worker thread panicked"))
    })?;

    println!(
        "Objects created = {}",
        OBJECTS_CREATED.load(Ordering::Relaxed)
    );
    println!("Pool size = {}", pool.pool_size());
    println!("Cells allocated = {}", pool.allocated_cells());

    Ok(())
}

fn produce(
    pool: &Pool<ExpensiveObject>,
    consumers: Vec<mpsc::Sender<Cell<ExpensiveObject>>>,
    delay: Duration,
) -> Result<(), counted_pool::Error> {
    for round in 0..PRODUCER_ROUNDS {
        let mut cell = pool.acquire();

        // A recycled payload may still carry the signal of an earlier round.
        let object = cell
            .get_mut()?
            .expect("a freshly acquired cell has exactly one handle");
        object.exit_signal = round == PRODUCER_ROUNDS - 1;

        if object.exit_signal {
            println!("producer: setting exit signal on object {}", object.id);
        }

        for consumer in &consumers {
            consumer
                .send(cell.copy()?)
                .expect("consumers outlive the producer");
        }

        cell.release()?;

        if round % 100 == 0 {
            println!("producer: total operations = {round}");
        }

        thread::sleep(delay);
    }

    Ok(())
}

fn consume(
    index: usize,
    queue: &mpsc::Receiver<Cell<ExpensiveObject>>,
    delay: Duration,
) -> Result<(), counted_pool::Error> {
    println!("consumer {index}: starting");

    let mut work_count = 0_usize;

    while let Ok(mut cell) = queue.recv() {
        let object = cell.get()?;
        object.do_something(delay);
        let exit = object.exit_signal;

        cell.release()?;

        work_count = work_count.wrapping_add(1);
        if work_count % 100 == 0 {
            println!("consumer {index}: work count = {work_count}");
        }

        if exit {
            break;
        }
    }

    println!("consumer {index}: exiting after {work_count} items");

    Ok(())
}

fn run(pool: &Pool<ExpensiveObject>, duration: Duration) -> Result<(), counted_pool::Error> {
    for round in 0..RUNNER_ROUNDS {
        let mut cell = pool.acquire().scoped();

        let object = cell
            .get_mut()?
            .expect("a freshly acquired cell has exactly one handle");
        object.exit_signal = false;
        object.do_something(duration);

        if round % 100 == 0 {
            println!("runner: total operations = {round}");
        }
    }

    println!("runner: exiting");

    Ok(())
}
