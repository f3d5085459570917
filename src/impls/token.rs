//! Strategy C: availability token passed through a single-slot channel.
//!
//! Pool availability is a small value, `{slots, closed}`. Whoever holds the value owns the
//! right to change it, so there is no lock around capacity accounting. Tokens are never
//! overwritten: a deposit that finds the slot occupied takes the other token out, merges both
//! and tries again. Tokens carrying neither slots nor the closed flag are never deposited, so
//! a taken token always grants something.

use std::{
    fmt,
    num::NonZeroUsize,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use crossbeam_channel::{bounded, select, Receiver, Sender, TryRecvError, TrySendError};
use parking_lot::Mutex;
use tracing::{debug, debug_span, trace};

use crate::{
    cancel::CancelToken,
    config::Strategy,
    error::Error,
    impls::Settings,
    pool::Pool,
    resource::{discard, discard_all, Manager, Resource},
    state::PoolState,
};

/// Availability token.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Availability {
    /// Free slots carried by this token.
    slots: usize,
    closed: bool,
}

impl Availability {
    /// Marker deposited by shutdown.
    const CLOSED: Self = Self {
        slots: 0,
        closed: true,
    };

    fn slots(slots: usize) -> Self {
        Self {
            slots,
            closed: false,
        }
    }

    fn merge(self, other: Self) -> Self {
        Self {
            slots: self.slots + other.slots,
            closed: self.closed || other.closed,
        }
    }

    fn is_empty(&self) -> bool {
        self.slots == 0 && !self.closed
    }
}

/// Pool serializing capacity accounting through a single-slot channel.
///
/// Idle resources are kept on a separate mutex-protected stack. Blocked callers wait for the
/// token together with the close signal and their own cancellation token.
pub struct TokenPool<M: Manager> {
    /// Common pool settings.
    settings: Settings,
    /// Resource factory.
    manager: M,
    /// Single-slot channel carrying the availability token.
    state_tx: Sender<Availability>,
    state_rx: Receiver<Availability>,
    /// Idle stack, most recently released last.
    idle: Mutex<Vec<M::Resource>>,
    /// Close signal sender, dropped when shutdown starts.
    gate: Mutex<Option<Sender<()>>>,
    /// Disconnects when shutdown starts.
    closed: Receiver<()>,
    /// Serializes shutdown calls, set once shutdown has finished.
    finished: Mutex<bool>,
    /// Handed out resources, used only for reporting.
    in_use: AtomicUsize,
}

super::settings_builder!(TokenPool);

impl<M: Manager> TokenPool<M> {
    /// Create new empty pool with capacity of `size` resources.
    #[must_use]
    pub fn new(size: NonZeroUsize, manager: M) -> Self {
        let (state_tx, state_rx) = bounded(1);
        let (gate, closed) = bounded(0);
        let pool = Self {
            settings: Settings::new(size),
            manager,
            state_tx,
            state_rx,
            idle: Mutex::new(Vec::with_capacity(size.get())),
            gate: Mutex::new(Some(gate)),
            closed,
            finished: Mutex::new(false),
            in_use: AtomicUsize::new(0),
        };
        pool.deposit(Availability::slots(size.get()));
        pool
    }

    fn is_shut(&self) -> bool {
        matches!(self.closed.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Put availability back, merging with any token deposited in the meantime.
    ///
    /// Never blocks.
    fn deposit(&self, mut avail: Availability) {
        if avail.is_empty() {
            return;
        }
        loop {
            match self.state_tx.try_send(avail) {
                Ok(()) => return,
                Err(TrySendError::Full(back)) => {
                    avail = back;
                    if let Ok(other) = self.state_rx.try_recv() {
                        avail = avail.merge(other);
                    }
                }
                // Both halves are owned by the pool.
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }

    /// Take the availability token, waiting for one to be deposited.
    fn take(&self, cancel: &CancelToken) -> Result<Availability, Error<M::Error>> {
        if let Ok(avail) = self.state_rx.try_recv() {
            return Ok(avail);
        }
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let done = cancel.done();
        let expired = cancel.expired();
        select! {
            recv(self.state_rx) -> avail => avail.map_err(|_| Error::PoolClosed),
            recv(self.closed) -> _ => Err(Error::PoolClosed),
            recv(done) -> _ => Err(Error::Cancelled),
            recv(expired) -> _ => Err(Error::Cancelled),
        }
    }
}

impl<M> Pool for TokenPool<M>
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
            strategy = Strategy::Token.as_str()
        )
        .entered();
        if self.is_shut() {
            return Err(Error::PoolClosed);
        }
        let avail = self.take(cancel)?;
        if avail.closed || self.is_shut() {
            self.deposit(avail);
            return Err(Error::PoolClosed);
        }
        self.deposit(Availability {
            slots: avail.slots - 1,
            ..avail
        });
        self.in_use.fetch_add(1, Ordering::Relaxed);
        if let Some(res) = self.idle.lock().pop() {
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
                self.deposit(Availability::slots(1));
                debug!(%err, "unable to create resource");
                Err(Error::Create(err))
            }
        }
    }

    fn release(&self, resource: Self::Resource) {
        let rejected = if resource.is_closed() {
            Some(resource)
        } else {
            let mut idle = self.idle.lock();
            if self.is_shut() {
                Some(resource)
            } else {
                idle.push(resource);
                None
            }
        };
        if let Some(res) = rejected {
            trace!(pool = %self.settings.name, "discarding released resource");
            discard(&self.settings.name, res);
        }
        self.in_use.fetch_sub(1, Ordering::Relaxed);
        self.deposit(Availability::slots(1));
    }

    fn shutdown(&self) {
        let mut finished = self.finished.lock();
        if self.gate.lock().take().is_some() {
            debug!(pool = %self.settings.name, "shutting down pool");
            self.deposit(Availability::CLOSED);
        }
        if *finished {
            return;
        }
        // Every slot is either in the token or backs an acquired resource, which gives it
        // back on release.
        let mut collected = 0;
        while collected < self.settings.size {
            match self.state_rx.recv() {
                Ok(avail) => collected += avail.slots,
                Err(_) => break,
            }
            trace!(pool = %self.settings.name, collected, "collecting slots");
        }
        let idle = std::mem::take(&mut *self.idle.lock());
        let count = discard_all(&self.settings.name, idle);
        if count > 0 {
            debug!(pool = %self.settings.name, count, "closed idle resources");
        }
        self.deposit(Availability::CLOSED.merge(Availability::slots(collected)));
        *finished = true;
    }

    fn state(&self) -> PoolState {
        PoolState {
            max_size: self.settings.size,
            idle: self.idle.lock().len(),
            in_use: self.in_use.load(Ordering::Relaxed),
            closed: self.is_shut(),
        }
    }

    fn strategy(&self) -> Strategy {
        Strategy::Token
    }

    fn name(&self) -> &str {
        &self.settings.name
    }

    fn default_timeout(&self) -> Option<Duration> {
        self.settings.acquire_timeout
    }
}

impl<M: Manager> fmt::Debug for TokenPool<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenPool")
            .field("name", &self.settings.name)
            .field("size", &self.settings.size)
            .field("idle", &self.idle.lock().len())
            .field("closed", &self.is_shut())
            .finish()
    }
}
