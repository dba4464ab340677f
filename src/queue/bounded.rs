use crate::queue::{CompareFn, Queue};
use crate::task::Task;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::warn;

/// Channel-style bounded FIFO queue.
///
/// The lighter alternative for the comparator-less case: producers block at
/// capacity, consumers block when the buffer is empty, and nothing else is
/// tracked. In particular there is no re-entrancy suppression (the same task
/// handle can be resident twice), [`Queue::done`] is a no-op, comparators are
/// ignored, and [`Queue::is_empty`] always reports `false`, which is also
/// what makes the scheduler reject comparator installation on this variant.
///
/// [`Queue::wait_empty`] only waits for the buffer to drain; tasks already
/// handed to workers are not accounted for.
///
/// Retry re-admission goes through [`Queue::try_add`] and is dropped when
/// the buffer is full: a blocking re-admission from a worker would park the
/// worker on the queue it is supposed to drain, deadlocking the pool once
/// every worker hits a body error at capacity. And because duplicates are
/// not suppressed, retries of a handle scheduled more than once may run
/// concurrently.
pub struct BoundedQueue {
    buf: Mutex<VecDeque<Arc<Task>>>,
    capacity: usize,
    not_full: Condvar,
    not_empty: Condvar,
    drained: Condvar,
}

impl BoundedQueue {
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "bounded queue capacity cannot be 0");
        Self {
            buf: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            drained: Condvar::new(),
        }
    }
}

impl Queue for BoundedQueue {
    fn add(&self, task: Arc<Task>) {
        let mut buf = self.buf.lock();
        self.not_full.wait_while(&mut buf, |b| b.len() == self.capacity);

        buf.push_back(task);
        self.not_empty.notify_one();
    }

    fn try_add(&self, task: Arc<Task>) -> bool {
        let mut buf = self.buf.lock();
        if buf.len() == self.capacity {
            return false;
        }

        buf.push_back(task);
        self.not_empty.notify_one();
        true
    }

    fn get(&self) -> Arc<Task> {
        let mut buf = self.buf.lock();
        self.not_empty.wait_while(&mut buf, |b| b.is_empty());

        let task = buf.pop_front().expect("pop from an empty buffer");
        self.not_full.notify_one();
        if buf.is_empty() {
            self.drained.notify_all();
        }
        task
    }

    fn done(&self, _task: &Arc<Task>) {}

    fn set_compare(&self, _compare: CompareFn) {
        warn!("bounded queue does not support comparators; ignoring");
    }

    fn is_empty(&self) -> bool {
        false
    }

    fn wait_empty(&self) {
        let mut buf = self.buf.lock();
        self.drained.wait_while(&mut buf, |b| !b.is_empty());
    }
}
