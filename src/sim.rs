//! Worker simulation driving a pool the way a busy client would.
//!
//! [`Dialer`] produces fake [`Conn`] resources and keeps a [`Ledger`] of everything it dialed
//! and everything the pool closed. [`run_workers`] hammers a pool with worker threads, some of
//! which break their connections, then shuts the pool down.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, trace, warn};

use crate::{
    error::Error,
    pool::Pool,
    resource::{Manager, Resource},
};

/// Errors of simulated connections.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SimError {
    /// Dialer was told to refuse new connections.
    #[error("connection refused")]
    Refused,
    /// Connection was closed twice.
    #[error("connection {0} is already closed")]
    AlreadyClosed(u64),
}

/// Record of simulated connection lifecycle events.
#[derive(Debug, Default)]
pub struct Ledger {
    /// Next connection identifier, also the number of connections dialed so far.
    next_id: AtomicU64,
    /// Whether new dials must fail.
    refuse: AtomicBool,
    /// Delay before each dial completes.
    delay: Mutex<Duration>,
    /// Close calls per connection identifier.
    closes: Mutex<BTreeMap<u64, usize>>,
}

impl Ledger {
    /// Number of connections dialed so far.
    #[must_use]
    pub fn dialed(&self) -> u64 {
        self.next_id.load(Ordering::SeqCst)
    }

    /// Number of distinct connections closed so far.
    #[must_use]
    pub fn closed(&self) -> usize {
        self.closes.lock().len()
    }

    /// Number of times connection `id` was closed.
    #[must_use]
    pub fn close_count(&self, id: u64) -> usize {
        self.closes.lock().get(&id).copied().unwrap_or(0)
    }

    /// Identifiers of connections closed more than once.
    #[must_use]
    pub fn double_closed(&self) -> Vec<u64> {
        self.closes
            .lock()
            .iter()
            .filter_map(|(id, count)| (*count > 1).then_some(*id))
            .collect()
    }

    fn record_close(&self, id: u64) -> usize {
        let mut closes = self.closes.lock();
        let count = closes.entry(id).or_insert(0);
        *count += 1;
        *count
    }
}

/// Simulated network connection.
#[derive(Debug)]
pub struct Conn {
    id: u64,
    /// Set by application code when the connection misbehaves.
    broken: bool,
    /// Set once torn down.
    closed: bool,
    ledger: Arc<Ledger>,
}

impl Conn {
    /// Connection identifier, unique per [`Dialer`].
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Flag this connection as broken, so that the pool discards it on release.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl Resource for Conn {
    type Error = SimError;

    fn is_closed(&self) -> bool {
        self.broken || self.closed
    }

    fn close(&mut self) -> Result<(), Self::Error> {
        let count = self.ledger.record_close(self.id);
        if self.closed || count > 1 {
            return Err(SimError::AlreadyClosed(self.id));
        }
        self.closed = true;
        trace!(conn = self.id, "closed connection");
        Ok(())
    }
}

/// Resource manager producing [`Conn`] objects.
///
/// Clones share the same [`Ledger`], so a test can keep a clone after handing one to a pool.
#[derive(Clone, Debug, Default)]
pub struct Dialer {
    ledger: Arc<Ledger>,
}

impl Dialer {
    /// Create new dialer with an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared ledger of this dialer.
    #[must_use]
    pub fn ledger(&self) -> Arc<Ledger> {
        self.ledger.clone()
    }

    /// Make subsequent dials fail, or succeed again.
    pub fn refuse(&self, refuse: bool) {
        self.ledger.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Set delay before each dial completes.
    pub fn set_delay(&self, delay: Duration) {
        *self.ledger.delay.lock() = delay;
    }
}

impl Manager for Dialer {
    type Resource = Conn;
    type Error = SimError;

    fn create(&self) -> Result<Self::Resource, Self::Error> {
        // Outcome is decided when dialing starts, the delay only stretches it.
        let refuse = self.ledger.refuse.load(Ordering::SeqCst);
        let delay = *self.ledger.delay.lock();
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        if refuse {
            return Err(SimError::Refused);
        }
        let id = self.ledger.next_id.fetch_add(1, Ordering::SeqCst);
        debug!(conn = id, "dialed connection");
        Ok(Conn {
            id,
            broken: false,
            closed: false,
            ledger: self.ledger.clone(),
        })
    }
}

/// Configuration for a worker simulation run.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
#[non_exhaustive]
pub struct SimConfig {
    /// Number of worker threads.
    ///
    /// Default is 5.
    #[serde(default = "SimConfig::default_workers")]
    pub workers: usize,
    /// Time before the pool is shut down.
    ///
    /// Default is 2 seconds.
    #[serde(default = "SimConfig::default_duration", with = "humantime_serde")]
    pub duration: Duration,
    /// Shortest time a worker holds a connection.
    ///
    /// Default is 500 milliseconds.
    #[serde(default = "SimConfig::default_hold_min", with = "humantime_serde")]
    pub hold_min: Duration,
    /// Longest time a worker holds a connection.
    ///
    /// Default is 1 second.
    #[serde(default = "SimConfig::default_hold_max", with = "humantime_serde")]
    pub hold_max: Duration,
    /// Probability of a worker breaking a connection it holds.
    ///
    /// Default is 0.1.
    #[serde(default = "SimConfig::default_broken_ratio")]
    pub broken_ratio: f64,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            workers: Self::default_workers(),
            duration: Self::default_duration(),
            hold_min: Self::default_hold_min(),
            hold_max: Self::default_hold_max(),
            broken_ratio: Self::default_broken_ratio(),
        }
    }
}

impl SimConfig {
    /// Default value for [`Self::workers`].
    #[must_use]
    #[inline]
    fn default_workers() -> usize {
        5
    }

    /// Default value for [`Self::duration`].
    #[must_use]
    #[inline]
    fn default_duration() -> Duration {
        Duration::from_secs(2)
    }

    /// Default value for [`Self::hold_min`].
    #[must_use]
    #[inline]
    fn default_hold_min() -> Duration {
        Duration::from_millis(500)
    }

    /// Default value for [`Self::hold_max`].
    #[must_use]
    #[inline]
    fn default_hold_max() -> Duration {
        Duration::from_secs(1)
    }

    /// Default value for [`Self::broken_ratio`].
    #[must_use]
    #[inline]
    fn default_broken_ratio() -> f64 {
        0.1
    }

    /// Set number of worker threads.
    #[must_use]
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set time before the pool is shut down.
    #[must_use]
    pub fn duration(mut self, duration: Duration) -> Self {
        self.duration = duration;
        self
    }

    /// Set range of times a worker holds a connection.
    #[must_use]
    pub fn hold(mut self, min: Duration, max: Duration) -> Self {
        self.hold_min = min;
        self.hold_max = max;
        self
    }

    /// Set probability of breaking a held connection.
    #[must_use]
    pub fn broken_ratio(mut self, ratio: f64) -> Self {
        self.broken_ratio = ratio;
        self
    }

    fn hold_time<R: Rng>(&self, rng: &mut R) -> Duration {
        let (lo, hi) = if self.hold_min <= self.hold_max {
            (self.hold_min, self.hold_max)
        } else {
            (self.hold_max, self.hold_min)
        };
        rng.random_range(lo..=hi)
    }

    fn break_chance(&self) -> f64 {
        if (0.0..=1.0).contains(&self.broken_ratio) {
            self.broken_ratio
        } else {
            0.0
        }
    }
}

/// Per-worker counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    /// Successful acquisitions.
    pub acquisitions: usize,
    /// Connections marked broken before release.
    pub broken: usize,
    /// Acquisitions failing with anything but [`Error::PoolClosed`].
    pub errors: usize,
    /// Acquisitions which succeeded although the pool already reported being closed.
    pub acquired_after_close: usize,
}

/// Outcome of a simulation run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SimReport {
    /// Counters for each worker, in spawn order.
    pub workers: Vec<WorkerStats>,
    /// Workers which panicked.
    pub panicked: usize,
}

impl SimReport {
    /// Sum of counters over all workers.
    #[must_use]
    pub fn total(&self) -> WorkerStats {
        self.workers
            .iter()
            .fold(WorkerStats::default(), |acc, w| WorkerStats {
                acquisitions: acc.acquisitions + w.acquisitions,
                broken: acc.broken + w.broken,
                errors: acc.errors + w.errors,
                acquired_after_close: acc.acquired_after_close + w.acquired_after_close,
            })
    }
}

/// Run worker threads against `pool`, then shut it down.
///
/// Each worker loops acquiring a connection, holding it for a random time, occasionally
/// breaking it, and releasing it. After [`SimConfig::duration`] the pool is shut down, which
/// makes every worker stop once its next acquisition fails. Returns when all workers are done.
pub fn run_workers<P>(pool: &P, config: &SimConfig) -> SimReport
where
    P: Pool<Resource = Conn> + ?Sized,
{
    let results = thread::scope(|scope| {
        let handles: Vec<_> = (0..config.workers)
            .map(|worker| scope.spawn(move || work(worker, pool, config)))
            .collect();
        thread::sleep(config.duration);
        info!(pool = pool.name(), "closing pool");
        pool.shutdown();
        handles.into_iter().map(|h| h.join()).collect::<Vec<_>>()
    });
    let mut report = SimReport::default();
    for result in results {
        match result {
            Ok(stats) => report.workers.push(stats),
            Err(_) => report.panicked += 1,
        }
    }
    report
}

fn work<P>(worker: usize, pool: &P, config: &SimConfig) -> WorkerStats
where
    P: Pool<Resource = Conn> + ?Sized,
{
    let mut rng = rand::rng();
    let mut stats = WorkerStats::default();
    loop {
        // Closing is monotonic, so anything acquired after this reads true is a violation.
        let closed_before = pool.is_closed();
        let mut conn = match pool.acquire() {
            Ok(conn) => conn,
            Err(Error::PoolClosed) => break,
            Err(err) => {
                warn!(worker, %err, "unable to acquire connection");
                stats.errors += 1;
                break;
            }
        };
        stats.acquisitions += 1;
        if closed_before {
            stats.acquired_after_close += 1;
        }
        trace!(worker, conn = conn.id(), "got connection");
        // Simulate making a request on the connection.
        thread::sleep(config.hold_time(&mut rng));
        if rng.random_bool(config.break_chance()) {
            conn.mark_broken();
            stats.broken += 1;
        }
        pool.release(conn);
    }
    debug!(worker, acquisitions = stats.acquisitions, "worker done");
    stats
}
