//! Resource abstraction consumed by the pools.

use tracing::{trace, warn};

/// Resource which can be kept in a pool.
///
/// The pool never looks inside a resource, apart from checking [`Resource::is_closed`] on
/// release.
pub trait Resource: Send {
    /// Error returned when tearing the resource down.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Whether this resource is closed or broken.
    ///
    /// Application code may set this flag between acquiring and releasing a resource to signal
    /// that it must not be reused. Such resources are closed and discarded on release.
    fn is_closed(&self) -> bool;

    /// Tear the resource down.
    ///
    /// Called by the pool at most once per resource. Errors are logged and ignored.
    ///
    /// # Errors
    ///
    /// Returns `Err` if teardown failed. The pool has no way to retry, so this is only logged.
    fn close(&mut self) -> Result<(), Self::Error>;
}

/// Factory for pooled resources.
pub trait Manager: Send + Sync {
    /// Resource type produced by this manager.
    type Resource: Resource;
    /// Error type returned when resource creation fails.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Create a new resource.
    ///
    /// May be slow. Pools never call this while holding their own locks.
    ///
    /// # Errors
    ///
    /// Returns `Err` if resource could not be created. The error is passed verbatim to the
    /// caller of `acquire`.
    fn create(&self) -> Result<Self::Resource, Self::Error>;
}

/// Close a resource which is leaving the pool for good.
pub(crate) fn discard<R: Resource>(pool: &str, mut resource: R) {
    match resource.close() {
        Ok(()) => trace!(pool, "closed discarded resource"),
        Err(err) => warn!(pool, %err, "error closing discarded resource"),
    }
}

/// Close every resource in an iterator, returning how many were closed.
pub(crate) fn discard_all<R, I>(pool: &str, resources: I) -> usize
where
    R: Resource,
    I: IntoIterator<Item = R>,
{
    resources.into_iter().fold(0, |count, res| {
        discard(pool, res);
        count + 1
    })
}
