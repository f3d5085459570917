//! Strategy A: mutex-guarded free list with waiters parked on a condition variable.

use std::{fmt, num::NonZeroUsize, sync::Arc, time::Duration};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, debug_span, trace, warn};

use crate::{
    cancel::CancelToken,
    config::Strategy,
    error::Error,
    impls::Settings,
    pool::Pool,
    resource::{discard, discard_all, Manager, Resource},
    state::PoolState,
};

/// Pool parking blocked callers on a condition variable.
///
/// All bookkeeping lives behind one mutex. Waiters are woken by `release` and race for the
/// lock, so there is no FIFO guarantee among them.
pub struct CondPool<M: Manager> {
    /// Common pool settings.
    settings: Settings,
    /// Resource factory.
    manager: M,
    /// Bookkeeping shared with cancellation hooks.
    shared: Arc<Shared<M::Resource>>,
}

struct Shared<R> {
    state: Mutex<State<R>>,
    /// Signalled on every change that could unblock `acquire` or `shutdown`.
    cond: Condvar,
}

struct State<R> {
    /// Idle resources, most recently released last.
    idle: Vec<R>,
    /// Slots backing resources handed out or being created.
    active: usize,
    closed: bool,
}

super::settings_builder!(CondPool);

impl<M: Manager> CondPool<M> {
    /// Create new empty pool with capacity of `size` resources.
    #[must_use]
    pub fn new(size: NonZeroUsize, manager: M) -> Self {
        Self {
            settings: Settings::new(size),
            manager,
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    idle: Vec::with_capacity(size.get()),
                    active: 0,
                    closed: false,
                }),
                cond: Condvar::new(),
            }),
        }
    }

    /// Create a resource in an already claimed slot, giving the slot back on failure.
    fn create(&self) -> Result<M::Resource, Error<M::Error>> {
        match self.manager.create() {
            Ok(res) => {
                debug!("created new resource");
                Ok(res)
            }
            Err(err) => {
                self.shared.state.lock().active -= 1;
                self.shared.cond.notify_all();
                debug!(%err, "unable to create resource");
                Err(Error::Create(err))
            }
        }
    }
}

impl<M> Pool for CondPool<M>
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
            strategy = Strategy::Condvar.as_str()
        )
        .entered();
        let mut hook = None;
        let mut state = self.shared.state.lock();
        loop {
            if state.closed {
                drop(state);
                // Let other blocked callers and shutdown re-check.
                self.shared.cond.notify_all();
                return Err(Error::PoolClosed);
            }
            if let Some(res) = state.idle.pop() {
                state.active += 1;
                trace!(active = state.active, "reusing idle resource");
                return Ok(res);
            }
            if state.active < self.settings.size {
                state.active += 1;
                drop(state);
                return self.create();
            }
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            if hook.is_none() {
                let shared = self.shared.clone();
                // Hook takes the lock before notifying, so it cannot slip in between our check
                // above and the wait below.
                let registered = cancel.register(Box::new(move || {
                    let _state = shared.state.lock();
                    shared.cond.notify_all();
                }));
                match registered {
                    Some(guard) => hook = Some(guard),
                    None => return Err(Error::Cancelled),
                }
            }
            trace!(active = state.active, "pool exhausted, waiting");
            match cancel.deadline() {
                Some(deadline) => {
                    // Timeout is detected by the cancellation check on the next iteration.
                    let _ = self.shared.cond.wait_until(&mut state, deadline);
                }
                None => self.shared.cond.wait(&mut state),
            }
        }
    }

    fn release(&self, resource: Self::Resource) {
        let mut state = self.shared.state.lock();
        if resource.is_closed() || state.closed {
            drop(state);
            trace!(pool = %self.settings.name, "discarding released resource");
            discard(&self.settings.name, resource);
            state = self.shared.state.lock();
        } else {
            state.idle.push(resource);
        }
        match state.active.checked_sub(1) {
            Some(active) => state.active = active,
            None => warn!(pool = %self.settings.name, "released more resources than acquired"),
        }
        let closed = state.closed;
        drop(state);
        if closed {
            self.shared.cond.notify_all();
        } else {
            self.shared.cond.notify_one();
        }
    }

    fn shutdown(&self) {
        let mut state = self.shared.state.lock();
        if !state.closed {
            state.closed = true;
            debug!(pool = %self.settings.name, active = state.active, "shutting down pool");
        }
        while state.active > 0 {
            self.shared.cond.notify_all();
            trace!(pool = %self.settings.name, active = state.active, "waiting for resources");
            self.shared.cond.wait(&mut state);
        }
        let idle = std::mem::take(&mut state.idle);
        // Closed under the lock, so a concurrent shutdown returns only after teardown.
        let count = discard_all(&self.settings.name, idle);
        drop(state);
        self.shared.cond.notify_all();
        if count > 0 {
            debug!(pool = %self.settings.name, count, "closed idle resources");
        }
    }

    fn state(&self) -> PoolState {
        let state = self.shared.state.lock();
        PoolState {
            max_size: self.settings.size,
            idle: state.idle.len(),
            in_use: state.active,
            closed: state.closed,
        }
    }

    fn strategy(&self) -> Strategy {
        Strategy::Condvar
    }

    fn name(&self) -> &str {
        &self.settings.name
    }

    fn default_timeout(&self) -> Option<Duration> {
        self.settings.acquire_timeout
    }
}

impl<M: Manager> fmt::Debug for CondPool<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("CondPool")
            .field("name", &self.settings.name)
            .field("size", &self.settings.size)
            .field("idle", &state.idle.len())
            .field("active", &state.active)
            .field("closed", &state.closed)
            .finish()
    }
}
