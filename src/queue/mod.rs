//! Admission queues.
//!
//! [`OrderedQueue`] is the default: FIFO or comparator-ordered delivery with
//! re-entrancy suppression through its dirty/running sets. [`BoundedQueue`]
//! is the channel-style alternative for the comparator-less case: a bounded
//! FIFO buffer with no duplicate tracking. The scheduler and its workers
//! only consume the [`Queue`] seam.

use crate::task::Task;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

mod ordered;
pub use ordered::OrderedQueue;

mod bounded;
pub use bounded::BoundedQueue;

/// The admission buffer between `schedule` and the worker pool.
pub trait Queue: Send + Sync {
    /// Admits a task. Implementations suppressing re-entrancy treat an
    /// already-pending task as a no-op and a running task as intent to run
    /// once more after it completes.
    fn add(&self, task: Arc<Task>);

    /// Non-blocking admission, used for re-admission from a worker thread
    /// (which must never park on the very queue it is draining). Returns
    /// `false` if the task could not be accepted right now.
    fn try_add(&self, task: Arc<Task>) -> bool;

    /// Blocks until a task is available and hands exactly one out, recording
    /// it as running.
    fn get(&self) -> Arc<Task>;

    /// Completes the handoff for a task returned by [`Queue::get`]; may
    /// promote a pending re-admission back into the sequence.
    fn done(&self, task: &Arc<Task>);

    /// Installs the delivery order. The scheduler only calls this while the
    /// queue is empty.
    fn set_compare(&self, compare: CompareFn);

    /// Whether no task is queued or running.
    fn is_empty(&self) -> bool;

    /// Blocks until [`Queue::is_empty`] would report true.
    fn wait_empty(&self);
}

/// A strict weak ordering over tasks; `Less` means "runs first".
pub type CompareFn = fn(&Task, &Task) -> Ordering;

/// Orders tasks by ascending priority number (lower runs first).
pub fn compare_by_priority(a: &Task, b: &Task) -> Ordering {
    a.priority().cmp(&b.priority())
}

/// Orders tasks by deadline, earliest first. A task without a deadline sorts
/// ahead of every task with one.
pub fn compare_by_deadline(a: &Task, b: &Task) -> Ordering {
    match (a.deadline(), b.deadline()) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => a.cmp(&b),
    }
}

/// Identity-keyed task set backing the dirty/running protocol.
///
/// Identity is the `Arc` allocation address, not structural equality; the
/// address is only tracked while the queue, a worker or the caller still
/// holds the `Arc`, so addresses cannot be recycled underneath the set.
#[derive(Debug, Default)]
pub(crate) struct TaskSet(HashSet<usize>);

impl TaskSet {
    fn key(task: &Arc<Task>) -> usize {
        Arc::as_ptr(task) as usize
    }

    pub(crate) fn has(&self, task: &Arc<Task>) -> bool {
        self.0.contains(&Self::key(task))
    }

    pub(crate) fn insert(&mut self, task: &Arc<Task>) {
        self.0.insert(Self::key(task));
    }

    pub(crate) fn remove(&mut self, task: &Arc<Task>) {
        self.0.remove(&Self::key(task));
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use std::time::Duration;

    fn noop() -> Arc<Task> {
        Arc::new(Task::new(|_: &Context| Ok(())))
    }

    #[test]
    fn task_set_is_identity_keyed() {
        let a = noop();
        let b = noop();
        let a2 = a.clone();

        let mut set = TaskSet::default();
        set.insert(&a);

        assert!(set.has(&a));
        assert!(set.has(&a2), "clones of one Arc share identity");
        assert!(!set.has(&b), "structurally equal tasks stay distinct");

        set.remove(&a2);
        assert!(!set.has(&a));
        assert!(set.is_empty());
    }

    #[test]
    fn priority_comparator_orders_ascending() {
        let low = Arc::new(Task::new(|_: &Context| Ok(())).with_priority(1));
        let high = Arc::new(Task::new(|_: &Context| Ok(())).with_priority(5));

        assert_eq!(compare_by_priority(&low, &high), Ordering::Less);
        assert_eq!(compare_by_priority(&high, &low), Ordering::Greater);
        assert_eq!(compare_by_priority(&low, &low), Ordering::Equal);
    }

    #[test]
    fn deadline_comparator_sorts_missing_deadline_first() {
        let soon = Arc::new(
            Task::new(|_: &Context| Ok(())).with_timeout(Duration::from_millis(10)),
        );
        let late = Arc::new(
            Task::new(|_: &Context| Ok(())).with_timeout(Duration::from_secs(60)),
        );
        let never = noop();

        assert_eq!(compare_by_deadline(&soon, &late), Ordering::Less);
        assert_eq!(compare_by_deadline(&never, &soon), Ordering::Less);
        assert_eq!(compare_by_deadline(&late, &never), Ordering::Greater);
        assert_eq!(compare_by_deadline(&never, &never), Ordering::Equal);
    }
}
