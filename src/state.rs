//! Point-in-time pool state.

use serde::Serialize;

/// State of a pool object.
///
/// Values are sampled without stopping the pool, so they may be stale by the time they are
/// read. For channel-based strategies `idle` and `in_use` are sampled separately and may
/// briefly disagree with each other.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PoolState {
    /// Maximum total (`idle` + `in_use`) number of resources in the pool.
    pub max_size: usize,
    /// Current number of idle (not acquired) resources.
    pub idle: usize,
    /// Current number of in-use (acquired) resources.
    pub in_use: usize,
    /// Whether pool shutdown has started.
    pub closed: bool,
}

impl PoolState {
    /// Current total (`idle` + `in_use`) number of resources in the pool.
    #[must_use]
    pub fn size(&self) -> usize {
        self.idle + self.in_use
    }

    /// Number of slots which could still be used to create new resources.
    #[must_use]
    pub fn available(&self) -> usize {
        self.max_size.saturating_sub(self.size())
    }
}
