//! Error types and error support code.

/// Error type returned by any pool when acquiring a resource.
///
/// `E` is the error type of the resource [`Manager`](crate::Manager).
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error<E> {
    /// Pool has been shut down, or shutdown started while waiting.
    ///
    /// This is terminal for the pool, retrying will not help.
    #[error("pool is closed")]
    PoolClosed,
    /// Cancellation token fired before a slot became available.
    ///
    /// No capacity was consumed, the call may be retried.
    #[error("resource acquisition was cancelled")]
    Cancelled,
    /// Call would block the thread, and non-blocking operation was requested.
    #[error("acquisition from pool would block execution")]
    WouldBlock,
    /// Resource manager failed to create a new resource.
    ///
    /// Slot claimed for this resource has already been returned to the pool.
    #[error("unable to create resource: {0}")]
    Create(#[source] E),
}

impl<E> Error<E> {
    /// Whether this error was caused by pool shutdown.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::PoolClosed)
    }

    /// Whether this error was caused by caller-side cancellation or deadline.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Reason a blocking wait inside a pool was interrupted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Interrupt {
    /// Close signal fired.
    Closed,
    /// Caller's cancellation token fired.
    Cancelled,
}

impl<E> From<Interrupt> for Error<E> {
    fn from(value: Interrupt) -> Self {
        match value {
            Interrupt::Closed => Self::PoolClosed,
            Interrupt::Cancelled => Self::Cancelled,
        }
    }
}
