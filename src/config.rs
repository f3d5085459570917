//! Pool configuration.

use std::{fmt, num::NonZeroUsize, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    impls::{CondPool, SemaphorePool, TokenPool, DEFAULT_NAME},
    pool::SharedPool,
    resource::Manager,
};

/// Synchronization strategy used by a pool.
///
/// All strategies implement the same [`Pool`](crate::Pool) contract.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum Strategy {
    /// Mutex-guarded free list, waiters parked on a condition variable.
    #[default]
    Condvar,
    /// Counting semaphore with a bounded queue of idle resources.
    Semaphore,
    /// Availability token passed through a single-slot channel.
    Token,
}

impl Strategy {
    /// All available strategies.
    pub const ALL: [Strategy; 3] = [Self::Condvar, Self::Semaphore, Self::Token];

    /// Strategy name, as used in configuration.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Condvar => "condvar",
            Self::Semaphore => "semaphore",
            Self::Token => "token",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Configuration for a resource pool.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[non_exhaustive]
pub struct PoolConfig {
    /// Maximum number of resources kept by the pool, both idle and in use.
    ///
    /// Default is 10.
    #[serde(default = "PoolConfig::default_size")]
    pub size: NonZeroUsize,
    /// Synchronization strategy.
    #[serde(default)]
    pub strategy: Strategy,
    /// Pool label used in logs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Deadline for plain [`Pool::acquire`](crate::Pool::acquire) calls.
    ///
    /// Default is to wait indefinitely.
    #[serde(
        default,
        with = "humantime_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub acquire_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: Self::default_size(),
            strategy: Strategy::default(),
            name: None,
            acquire_timeout: None,
        }
    }
}

impl PoolConfig {
    /// Default value for [`Self::size`].
    #[must_use]
    #[inline]
    fn default_size() -> NonZeroUsize {
        NonZeroUsize::new(10).unwrap_or(NonZeroUsize::MIN)
    }

    /// Create configuration for a pool of given size, keeping other values at default.
    #[must_use]
    pub fn with_size(size: NonZeroUsize) -> Self {
        Self {
            size,
            ..Self::default()
        }
    }

    /// Set synchronization strategy.
    #[must_use]
    pub fn strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Set pool label.
    #[must_use]
    pub fn name<L: Into<String>>(mut self, name: L) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set deadline for plain acquisition.
    #[must_use]
    pub fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }

    /// Build new empty pool using configured strategy.
    #[must_use]
    pub fn build<M>(&self, manager: M) -> SharedPool<M::Resource, M::Error>
    where
        M: Manager + 'static,
        M::Resource: 'static,
    {
        let name = self.name.clone().unwrap_or_else(|| DEFAULT_NAME.into());
        match self.strategy {
            Strategy::Condvar => Arc::new(
                CondPool::new(self.size, manager)
                    .named(name)
                    .with_acquire_timeout(self.acquire_timeout),
            ),
            Strategy::Semaphore => Arc::new(
                SemaphorePool::new(self.size, manager)
                    .named(name)
                    .with_acquire_timeout(self.acquire_timeout),
            ),
            Strategy::Token => Arc::new(
                TokenPool::new(self.size, manager)
                    .named(name)
                    .with_acquire_timeout(self.acquire_timeout),
            ),
        }
    }
}
