//! Pool contract shared by all strategies.

use std::{
    fmt,
    ops::{Deref, DerefMut},
    sync::Arc,
    time::Duration,
};

use crate::{cancel::CancelToken, config::Strategy, error::Error, resource::Resource, state::PoolState};

/// Pool which is shared between threads, with strategy chosen at runtime.
pub type SharedPool<R, E> = Arc<dyn Pool<Resource = R, Error = E>>;

/// Bounded pool of reusable resources.
///
/// At most [`PoolState::max_size`] resources exist at any time. Acquisition reuses idle
/// resources, creates new ones while capacity remains, and otherwise blocks until a resource
/// is released, the pool is shut down, or the caller cancels.
///
/// Blocked callers are not served in FIFO order: every strategy wakes waiters and lets them
/// race for the freed slot.
pub trait Pool: Send + Sync {
    /// Resource type contained in the pool.
    type Resource: Resource;
    /// Error type returned by the resource manager on creation.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Acquire a resource, waiting until `cancel` fires at most.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolClosed`] if the pool was shut down before or while waiting,
    /// [`Error::Cancelled`] if `cancel` fired while waiting, and [`Error::Create`] if a new
    /// resource was needed but could not be created.
    fn acquire_with(&self, cancel: &CancelToken) -> Result<Self::Resource, Error<Self::Error>>;

    /// Return a resource to the pool.
    ///
    /// Never blocks. Broken resources, and all resources returned after shutdown started, are
    /// closed instead of being kept.
    fn release(&self, resource: Self::Resource);

    /// Shut the pool down.
    ///
    /// Wakes every blocked acquisition, waits until all acquired resources are released,
    /// then closes all idle resources. Calling this more than once is safe.
    fn shutdown(&self);

    /// Get current pool counts.
    fn state(&self) -> PoolState;

    /// Synchronization strategy used by this pool.
    fn strategy(&self) -> Strategy;

    /// Pool label used in logs.
    fn name(&self) -> &str;

    /// Default deadline for [`Pool::acquire`], if configured.
    fn default_timeout(&self) -> Option<Duration> {
        None
    }

    /// Acquire a resource, waiting as long as needed, or until the default timeout.
    ///
    /// # Errors
    ///
    /// See [`Pool::acquire_with`].
    fn acquire(&self) -> Result<Self::Resource, Error<Self::Error>> {
        match self.default_timeout() {
            Some(timeout) => self.acquire_timeout(timeout),
            None => self.acquire_with(&CancelToken::never()),
        }
    }

    /// Try to acquire a resource, waiting for a bounded time.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Cancelled`] if waiting time was exhausted. See [`Pool::acquire_with`]
    /// for other errors.
    fn acquire_timeout(&self, timeout: Duration) -> Result<Self::Resource, Error<Self::Error>> {
        self.acquire_with(&CancelToken::with_timeout(timeout))
    }

    /// Instantly acquire a resource from the pool.
    ///
    /// # Errors
    ///
    /// Returns [`Error::WouldBlock`] if waiting is required. See [`Pool::acquire_with`] for
    /// other errors.
    fn try_acquire(&self) -> Result<Self::Resource, Error<Self::Error>> {
        match self.acquire_with(&CancelToken::cancelled()) {
            Err(Error::Cancelled) => Err(Error::WouldBlock),
            other => other,
        }
    }

    /// Whether pool shutdown has started.
    fn is_closed(&self) -> bool {
        self.state().closed
    }
}

/// Guarded acquisition for any [`Pool`].
pub trait PoolExt: Pool {
    /// Acquire a resource wrapped in a guard which releases it on drop.
    ///
    /// # Errors
    ///
    /// See [`Pool::acquire`].
    fn get(&self) -> Result<Pooled<'_, Self>, Error<Self::Error>> {
        self.acquire().map(|res| Pooled::new(self, res))
    }

    /// Acquire a guarded resource, waiting until `cancel` fires at most.
    ///
    /// # Errors
    ///
    /// See [`Pool::acquire_with`].
    fn get_with(&self, cancel: &CancelToken) -> Result<Pooled<'_, Self>, Error<Self::Error>> {
        self.acquire_with(cancel).map(|res| Pooled::new(self, res))
    }

    /// Acquire a guarded resource, waiting for a bounded time.
    ///
    /// # Errors
    ///
    /// See [`Pool::acquire_timeout`].
    fn get_timeout(&self, timeout: Duration) -> Result<Pooled<'_, Self>, Error<Self::Error>> {
        self.acquire_timeout(timeout).map(|res| Pooled::new(self, res))
    }
}

impl<P: Pool + ?Sized> PoolExt for P {}

/// Only drop and detach take the resource out, and both consume the guard.
const PRESENT: &str = "pooled resource is present until guard is consumed";

/// Resource borrowed from a pool, released back when dropped.
pub struct Pooled<'p, P: Pool + ?Sized> {
    /// Originating pool.
    pool: &'p P,
    /// Borrowed resource, taken out on drop or detach.
    resource: Option<P::Resource>,
}

impl<'p, P: Pool + ?Sized> Pooled<'p, P> {
    fn new(pool: &'p P, resource: P::Resource) -> Self {
        Self {
            pool,
            resource: Some(resource),
        }
    }

    /// Take the resource out of the guard.
    ///
    /// The resource still occupies a pool slot, and must eventually be passed to
    /// [`Pool::release`] of the same pool.
    #[must_use = "detached resource must be released manually"]
    pub fn detach(mut self) -> P::Resource {
        self.resource.take().expect(PRESENT)
    }
}

impl<P: Pool + ?Sized> Deref for Pooled<'_, P> {
    type Target = P::Resource;

    fn deref(&self) -> &Self::Target {
        self.resource.as_ref().expect(PRESENT)
    }
}

impl<P: Pool + ?Sized> DerefMut for Pooled<'_, P> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.resource.as_mut().expect(PRESENT)
    }
}

impl<P> fmt::Debug for Pooled<'_, P>
where
    P: Pool + ?Sized,
    P::Resource: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pooled")
            .field("pool", &self.pool.name())
            .field("resource", &self.resource)
            .finish()
    }
}

impl<P: Pool + ?Sized> Drop for Pooled<'_, P> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            self.pool.release(resource);
        }
    }
}
