//! Strategy B: counting semaphore bounding concurrency, bounded queue holding idle resources.

use std::{
    fmt,
    num::NonZeroUsize,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use crossbeam_channel::{bounded, select, Receiver, Sender, TryRecvError};
use parking_lot::Mutex;
use tracing::{debug, debug_span, trace, warn};

use crate::{
    cancel::CancelToken,
    config::Strategy,
    error::{Error, Interrupt},
    impls::Settings,
    pool::Pool,
    resource::{discard, discard_all, Manager, Resource},
    state::PoolState,
};

/// Counting semaphore built from a bounded channel pre-filled with permits.
struct Permits {
    tx: Sender<()>,
    rx: Receiver<()>,
}

impl Permits {
    fn new(count: usize) -> Self {
        let (tx, rx) = bounded(count);
        for _ in 0..count {
            // Channel capacity matches permit count.
            let _ = tx.try_send(());
        }
        Self { tx, rx }
    }

    /// Take a permit, waiting until one is released, `closed` disconnects or `cancel` fires.
    fn acquire(&self, closed: &Receiver<()>, cancel: &CancelToken) -> Result<(), Interrupt> {
        if self.rx.try_recv().is_ok() {
            return Ok(());
        }
        if cancel.is_cancelled() {
            return Err(Interrupt::Cancelled);
        }
        let done = cancel.done();
        let expired = cancel.expired();
        select! {
            // Sender half lives as long as `self`, so this never disconnects.
            recv(self.rx) -> permit => permit.map_err(|_| Interrupt::Closed),
            recv(closed) -> _ => Err(Interrupt::Closed),
            recv(done) -> _ => Err(Interrupt::Cancelled),
            recv(expired) -> _ => Err(Interrupt::Cancelled),
        }
    }

    /// Take a permit, waiting as long as needed.
    fn acquire_uninterruptible(&self) {
        let _ = self.rx.recv();
    }

    fn release(&self) {
        if self.tx.try_send(()).is_err() {
            warn!("semaphore released more permits than it holds");
        }
    }
}

/// Pool bounding concurrency with a counting semaphore.
///
/// Idle resources wait in a queue with capacity equal to pool size, so returning one never
/// blocks. Blocked callers wait on the semaphore together with the close signal and their own
/// cancellation token, whichever comes first.
pub struct SemaphorePool<M: Manager> {
    /// Common pool settings.
    settings: Settings,
    /// Resource factory.
    manager: M,
    /// One permit per slot.
    permits: Permits,
    idle_tx: Sender<M::Resource>,
    idle_rx: Receiver<M::Resource>,
    /// Close signal sender, dropped when shutdown starts.
    ///
    /// Releases check this under the lock before queueing, so nothing is queued after the
    /// signal fires.
    gate: Mutex<Option<Sender<()>>>,
    /// Disconnects when shutdown starts.
    closed: Receiver<()>,
    /// Serializes shutdown calls, set once shutdown has finished.
    finished: Mutex<bool>,
    /// Handed out resources, used only for reporting.
    in_use: AtomicUsize,
}

super::settings_builder!(SemaphorePool);

impl<M: Manager> SemaphorePool<M> {
    /// Create new empty pool with capacity of `size` resources.
    #[must_use]
    pub fn new(size: NonZeroUsize, manager: M) -> Self {
        let (idle_tx, idle_rx) = bounded(size.get());
        let (gate, closed) = bounded(0);
        Self {
            settings: Settings::new(size),
            manager,
            permits: Permits::new(size.get()),
            idle_tx,
            idle_rx,
            gate: Mutex::new(Some(gate)),
            closed,
            finished: Mutex::new(false),
            in_use: AtomicUsize::new(0),
        }
    }

    fn is_shut(&self) -> bool {
        matches!(self.closed.try_recv(), Err(TryRecvError::Disconnected))
    }
}

impl<M> Pool for SemaphorePool<M>
where
    M: Manager,
    M::Resource: 'static,
{
    type Resource = M::Resource;
    type Error = M::Error;

    fn acquire_with(&self, cancel: &CancelToken) -> Result<Self::Resource, Error<Self::Error>> {
        let _span = debug_span!(
            "pool_acquire",
            pool = %self.settings.name,
            strategy = Strategy::Semaphore.as_str()
        )
        .entered();
        if self.is_shut() {
            return Err(Error::PoolClosed);
        }
        self.permits.acquire(&self.closed, cancel)?;
        if self.is_shut() {
            // Permit won the race against the close signal.
            self.permits.release();
            return Err(Error::PoolClosed);
        }
        self.in_use.fetch_add(1, Ordering::Relaxed);
        if let Ok(res) = self.idle_rx.try_recv() {
            trace!("reusing idle resource");
            return Ok(res);
        }
        match self.manager.create() {
            Ok(res) => {
                debug!("created new resource");
                Ok(res)
            }
            Err(err) => {
                self.in_use.fetch_sub(1, Ordering::Relaxed);
                self.permits.release();
                debug!(%err, "unable to create resource");
                Err(Error::Create(err))
            }
        }
    }

    fn release(&self, resource: Self::Resource) {
        let rejected = if resource.is_closed() {
            Some(resource)
        } else {
            let gate = self.gate.lock();
            match gate.as_ref() {
                Some(_) => self.idle_tx.try_send(resource).err().map(|e| e.into_inner()),
                None => Some(resource),
            }
        };
        if let Some(res) = rejected {
            trace!(pool = %self.settings.name, "discarding released resource");
            discard(&self.settings.name, res);
        }
        self.in_use.fetch_sub(1, Ordering::Relaxed);
        // Only after the resource is queued, so a woken acquirer finds it.
        self.permits.release();
    }

    fn shutdown(&self) {
        let mut finished = self.finished.lock();
        if self.gate.lock().take().is_some() {
            debug!(pool = %self.settings.name, "shutting down pool");
        }
        if *finished {
            return;
        }
        for _ in 0..self.settings.size {
            self.permits.acquire_uninterruptible();
        }
        let count = discard_all(&self.settings.name, self.idle_rx.try_iter());
        if count > 0 {
            debug!(pool = %self.settings.name, count, "closed idle resources");
        }
        for _ in 0..self.settings.size {
            self.permits.release();
        }
        *finished = true;
    }

    fn state(&self) -> PoolState {
        PoolState {
            max_size: self.settings.size,
            idle: self.idle_rx.len(),
            in_use: self.in_use.load(Ordering::Relaxed),
            closed: self.is_shut(),
        }
    }

    fn strategy(&self) -> Strategy {
        Strategy::Semaphore
    }

    fn name(&self) -> &str {
        &self.settings.name
    }

    fn default_timeout(&self) -> Option<Duration> {
        self.settings.acquire_timeout
    }
}

impl<M: Manager> fmt::Debug for SemaphorePool<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SemaphorePool")
            .field("name", &self.settings.name)
            .field("size", &self.settings.size)
            .field("idle", &self.idle_rx.len())
            .field("available_permits", &self.permits.rx.len())
            .field("closed", &self.is_shut())
            .finish()
    }
}
