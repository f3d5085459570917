//! Caller-side cancellation of blocking acquisition.

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;

/// Callback run once when a token is cancelled.
pub(crate) type Hook = Box<dyn FnOnce() + Send>;

/// Token used to abandon a blocking acquisition.
///
/// Tokens fire either when [`CancelToken::cancel`] is called on any clone, or when their
/// deadline passes. A fired token only matters when the pool would have to wait: if an idle
/// resource or a free slot is available, acquisition still succeeds.
#[derive(Clone, Default)]
pub struct CancelToken {
    /// Shared manual trigger, absent for tokens that can never be cancelled manually.
    trigger: Option<Arc<Trigger>>,
    /// Optional point in time after which the token counts as fired.
    deadline: Option<Instant>,
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .field("deadline", &self.deadline)
            .finish()
    }
}

impl CancelToken {
    /// Create new token which fires only when cancelled manually.
    #[must_use]
    pub fn new() -> Self {
        Self {
            trigger: Some(Arc::new(Trigger::new())),
            deadline: None,
        }
    }

    /// Token which never fires.
    #[must_use]
    pub fn never() -> Self {
        Self::default()
    }

    /// Token which has already fired.
    #[must_use]
    pub fn cancelled() -> Self {
        let token = Self::new();
        token.cancel();
        token
    }

    /// Create new token firing at `deadline`, or earlier if cancelled manually.
    #[must_use]
    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            ..Self::new()
        }
    }

    /// Create new token firing after `timeout` elapses, or earlier if cancelled manually.
    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        // Durations too large to represent are treated as "no deadline".
        match Instant::now().checked_add(timeout) {
            Some(deadline) => Self::with_deadline(deadline),
            None => Self::new(),
        }
    }

    /// Fire this token and all of its clones.
    ///
    /// Wakes every acquisition currently blocked on this token. Calling this more than once is
    /// a no-op.
    pub fn cancel(&self) {
        if let Some(trigger) = &self.trigger {
            trigger.fire();
        }
    }

    /// Whether this token has fired, either manually or by deadline.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.trigger.as_ref().is_some_and(|t| t.is_fired())
            || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Deadline of this token, if any.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Channel which becomes ready (disconnected) once the token is cancelled manually.
    pub(crate) fn done(&self) -> Receiver<()> {
        match &self.trigger {
            Some(trigger) => trigger.done.clone(),
            None => crossbeam_channel::never(),
        }
    }

    /// Channel which becomes ready once the deadline passes.
    pub(crate) fn expired(&self) -> Receiver<Instant> {
        match self.deadline {
            Some(deadline) => crossbeam_channel::at(deadline),
            None => crossbeam_channel::never(),
        }
    }

    /// Run `hook` when this token is cancelled manually.
    ///
    /// Returns `None` if the token has already fired, in which case `hook` is dropped unrun.
    /// Hook is unregistered when returned guard is dropped.
    pub(crate) fn register(&self, hook: Hook) -> Option<HookGuard> {
        match &self.trigger {
            Some(trigger) => trigger.register(hook).map(|id| HookGuard {
                slot: Some((trigger.clone(), id)),
            }),
            None => Some(HookGuard { slot: None }),
        }
    }
}

/// Shared state behind manually cancellable tokens.
struct Trigger {
    /// Fast path flag, set under `state` lock.
    fired: AtomicBool,
    /// Sender half is dropped when fired, hooks are drained.
    state: Mutex<TriggerState>,
    /// Disconnected once fired.
    done: Receiver<()>,
}

struct TriggerState {
    sender: Option<Sender<()>>,
    hooks: Vec<(u64, Hook)>,
    next_id: u64,
}

impl Trigger {
    fn new() -> Self {
        let (sender, done) = bounded(0);
        Self {
            fired: AtomicBool::new(false),
            state: Mutex::new(TriggerState {
                sender: Some(sender),
                hooks: Vec::new(),
                next_id: 0,
            }),
            done,
        }
    }

    fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }

    fn fire(&self) {
        let hooks = {
            let mut state = self.state.lock();
            if state.sender.take().is_none() {
                return;
            }
            self.fired.store(true, Ordering::Release);
            std::mem::take(&mut state.hooks)
        };
        // Hooks may take pool locks, so they run after our own lock is released.
        for (_, hook) in hooks {
            hook();
        }
    }

    fn register(&self, hook: Hook) -> Option<u64> {
        let mut state = self.state.lock();
        if state.sender.is_none() {
            return None;
        }
        let id = state.next_id;
        state.next_id += 1;
        state.hooks.push((id, hook));
        Some(id)
    }

    fn unregister(&self, id: u64) {
        self.state.lock().hooks.retain(|(hook_id, _)| *hook_id != id);
    }
}

/// Registration of a cancellation hook, removed on drop.
pub(crate) struct HookGuard {
    slot: Option<(Arc<Trigger>, u64)>,
}

impl Drop for HookGuard {
    fn drop(&mut self) {
        if let Some((trigger, id)) = self.slot.take() {
            trigger.unregister(id);
        }
    }
}
