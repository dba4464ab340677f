//! Cooperative cancellation contexts.
//!
//! A [`Context`] is handed to every task body and callback. It becomes *done*
//! when it is cancelled through its [`CancelHandle`], when its deadline
//! passes, or when an ancestor context becomes done. Cancellation is
//! cooperative: the scheduler checks the context once before dispatch, and a
//! running body is expected to observe it on its own (typically through
//! [`Context::done_within`]).

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

/// Execution context carried by a task.
///
/// The background context (the default) is never done. Derived contexts add
/// a cancel trigger and optionally a deadline; cancelling a context cancels
/// every context derived from it.
#[derive(Clone, Debug, Default)]
pub struct Context {
    state: Option<Arc<CancelState>>,
}

/// Cancels the context it was derived with. Idempotent and safe to call from
/// any thread.
#[derive(Clone, Debug)]
pub struct CancelHandle {
    state: Arc<CancelState>,
}

#[derive(Debug)]
struct CancelState {
    deadline: Option<Instant>,
    cancelled: AtomicBool,

    // Blocked `done_within` waiters sleep on this pair.
    lock: Mutex<()>,
    cond: Condvar,

    // Contexts derived from this one; cancellation walks down the tree.
    children: Mutex<Vec<Weak<CancelState>>>,
}

impl Context {
    /// The root context: no deadline, no cancel trigger, never done.
    pub fn background() -> Self {
        Self { state: None }
    }

    /// Derives a cancellable child context.
    pub fn with_cancel(&self) -> (Context, CancelHandle) {
        self.derive(None)
    }

    /// Derives a child context that is done once `timeout` elapses.
    pub fn with_timeout(&self, timeout: Duration) -> (Context, CancelHandle) {
        self.derive(Some(Instant::now() + timeout))
    }

    /// Derives a child context that is done at `deadline`.
    pub fn with_deadline(&self, deadline: Instant) -> (Context, CancelHandle) {
        self.derive(Some(deadline))
    }

    fn derive(&self, deadline: Option<Instant>) -> (Context, CancelHandle) {
        // A child can only tighten the deadline, never extend the parent's.
        let deadline = match (self.deadline(), deadline) {
            (Some(parent), Some(child)) => Some(parent.min(child)),
            (parent, child) => child.or(parent),
        };

        let state = Arc::new(CancelState {
            deadline,
            cancelled: AtomicBool::new(self.is_done()),
            lock: Mutex::new(()),
            cond: Condvar::new(),
            children: Mutex::new(Vec::new()),
        });

        if let Some(parent) = &self.state {
            parent.children.lock().push(Arc::downgrade(&state));
            // The parent may have been cancelled between the doneness snapshot
            // above and the registration; re-check so the child cannot miss it.
            if parent.is_done() {
                state.cancel();
            }
        }

        (
            Context {
                state: Some(state.clone()),
            },
            CancelHandle { state },
        )
    }

    /// Whether the context has been cancelled or its deadline has passed.
    pub fn is_done(&self) -> bool {
        self.state.as_ref().is_some_and(|s| s.is_done())
    }

    /// The absolute deadline, if one was set on this context or inherited.
    pub fn deadline(&self) -> Option<Instant> {
        self.state.as_ref().and_then(|s| s.deadline)
    }

    /// Blocks until the context is done or `timeout` elapses, whichever comes
    /// first. Returns `true` if the context became done.
    ///
    /// This is the select-against-a-timer primitive for task bodies: a body
    /// that wants to sleep responsively calls this instead of
    /// [`thread::sleep`].
    pub fn done_within(&self, timeout: Duration) -> bool {
        let until = Instant::now() + timeout;

        let Some(state) = &self.state else {
            // Background context: nothing can wake us early.
            thread::sleep(timeout);
            return false;
        };

        let mut guard = state.lock.lock();
        loop {
            if state.is_done() {
                return true;
            }

            let now = Instant::now();
            if now >= until {
                return false;
            }

            // Wake at our own deadline if it lands before the caller's timer.
            let target = match state.deadline {
                Some(deadline) if deadline < until => deadline,
                _ => until,
            };
            let _ = state.cond.wait_until(&mut guard, target);
        }
    }

    /// Whether both handles observe the same underlying context.
    pub(crate) fn same(&self, other: &Context) -> bool {
        match (&self.state, &other.state) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl CancelHandle {
    /// Cancels the context and all contexts derived from it. Idempotent.
    pub fn cancel(&self) {
        self.state.cancel();
    }
}

impl CancelState {
    fn is_done(&self) -> bool {
        if self.cancelled.load(Ordering::Acquire) {
            return true;
        }

        self.deadline.is_some_and(|deadline| deadline <= Instant::now())
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }

        // Take the waiter lock before notifying so a waiter between its
        // done-check and its wait cannot miss the wakeup.
        drop(self.lock.lock());
        self.cond.notify_all();

        for child in self.children.lock().drain(..) {
            if let Some(child) = child.upgrade() {
                child.cancel();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;
    use std::time::Duration;

    assert_impl_all!(Context: Send, Sync, Clone);
    assert_impl_all!(CancelHandle: Send, Sync, Clone);

    #[test]
    fn background_is_never_done() {
        let ctx = Context::background();
        assert!(!ctx.is_done());
        assert!(ctx.deadline().is_none());
        assert!(!ctx.done_within(Duration::from_millis(5)));
    }

    #[test]
    fn cancel_is_idempotent() {
        let (ctx, handle) = Context::background().with_cancel();
        assert!(!ctx.is_done());

        handle.cancel();
        handle.cancel();
        assert!(ctx.is_done());
    }

    #[test]
    fn deadline_expires() {
        let (ctx, _handle) = Context::background().with_timeout(Duration::from_millis(10));
        assert!(!ctx.is_done());
        assert!(ctx.done_within(Duration::from_secs(5)), "deadline should fire well before 5s");
        assert!(ctx.is_done());
    }

    #[test]
    fn child_tightens_parent_deadline() {
        let (parent, _p) = Context::background().with_timeout(Duration::from_millis(10));
        let (child, _c) = parent.with_timeout(Duration::from_secs(60));
        assert_eq!(child.deadline(), parent.deadline());
    }

    #[test]
    fn parent_cancel_propagates_and_wakes_waiters() {
        let (parent, handle) = Context::background().with_cancel();
        let (child, _child_handle) = parent.with_cancel();

        let waiter = std::thread::spawn(move || child.done_within(Duration::from_secs(10)));

        std::thread::sleep(Duration::from_millis(20));
        handle.cancel();

        assert!(waiter.join().expect("waiter panicked"), "child waiter should observe parent cancel");
    }

    #[test]
    fn deriving_from_done_parent_starts_done() {
        let (parent, handle) = Context::background().with_cancel();
        handle.cancel();

        let (child, _c) = parent.with_cancel();
        assert!(child.is_done());
    }
}
