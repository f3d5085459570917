//! Pool strategies.

mod condvar;
mod semaphore;
mod token;

use std::{borrow::Cow, num::NonZeroUsize, time::Duration};

pub use self::{condvar::CondPool, semaphore::SemaphorePool, token::TokenPool};

/// Label used for pools which were not given a name.
pub(crate) const DEFAULT_NAME: &str = "default";

/// Settings common to every strategy.
#[derive(Clone, Debug)]
pub(crate) struct Settings {
    /// Pool label used in logs.
    pub(crate) name: Cow<'static, str>,
    /// Capacity of the pool.
    pub(crate) size: usize,
    /// Deadline applied by [`crate::Pool::acquire`].
    pub(crate) acquire_timeout: Option<Duration>,
}

impl Settings {
    pub(crate) fn new(size: NonZeroUsize) -> Self {
        Self {
            name: Cow::Borrowed(DEFAULT_NAME),
            size: size.get(),
            acquire_timeout: None,
        }
    }
}

/// Builder methods shared by all strategy types.
macro_rules! settings_builder {
    ($pool:ident) => {
        impl<M: $crate::resource::Manager> $pool<M> {
            /// Set pool label used in logs.
            #[must_use]
            pub fn named<L: Into<std::borrow::Cow<'static, str>>>(mut self, name: L) -> Self {
                self.settings.name = name.into();
                self
            }

            /// Set deadline applied by [`Pool::acquire`](crate::Pool::acquire).
            ///
            /// `None` means waiting indefinitely, which is the default.
            #[must_use]
            pub fn with_acquire_timeout(mut self, timeout: Option<std::time::Duration>) -> Self {
                self.settings.acquire_timeout = timeout;
                self
            }

            /// Resource manager used by this pool.
            #[must_use]
            pub fn manager(&self) -> &M {
                &self.manager
            }
        }
    };
}

pub(crate) use settings_builder;
