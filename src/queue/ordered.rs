use crate::queue::{CompareFn, Queue, TaskSet};
use crate::task::Task;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;

/// The re-entrancy-suppressing admission queue.
///
/// Holds the pending sequence plus two identity sets: *running* (handed out
/// by [`OrderedQueue::get`], not yet completed) and *dirty* (pending, or
/// re-admission requested while running). The sets give every task handle at
/// most one in-flight execution:
///
/// - adding a dirty task is a no-op;
/// - adding a running task only marks it dirty, and [`OrderedQueue::done`]
///   promotes it back into the sequence.
///
/// Without a comparator the sequence is FIFO. With one it is a binary
/// min-heap; ties break arbitrarily.
pub struct OrderedQueue {
    inner: Mutex<Inner>,

    // `get` waiters; signalled by `add` and by promoting `done`.
    avail: Condvar,

    // `wait_empty` waiters; signalled when sequence and running both drain.
    empty: Condvar,
}

struct Inner {
    seq: VecDeque<Arc<Task>>,
    running: TaskSet,
    dirty: TaskSet,
    compare: Option<CompareFn>,
}

impl OrderedQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                seq: VecDeque::new(),
                running: TaskSet::default(),
                dirty: TaskSet::default(),
                compare: None,
            }),
            avail: Condvar::new(),
            empty: Condvar::new(),
        }
    }
}

impl Default for OrderedQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl Queue for OrderedQueue {
    fn add(&self, task: Arc<Task>) {
        let mut q = self.inner.lock();

        if q.dirty.has(&task) {
            return;
        }
        q.dirty.insert(&task);

        // Running tasks are never queued twice; `done` will promote the
        // dirty mark back into the sequence.
        if q.running.has(&task) {
            return;
        }

        q.push(task);
        self.avail.notify_one();
    }

    // Admission never blocks on this queue.
    fn try_add(&self, task: Arc<Task>) -> bool {
        self.add(task);
        true
    }

    fn get(&self) -> Arc<Task> {
        let mut q = self.inner.lock();
        self.avail.wait_while(&mut q, |q| q.seq.is_empty());

        let task = q.pop();
        q.running.insert(&task);
        q.dirty.remove(&task);
        task
    }

    fn done(&self, task: &Arc<Task>) {
        let mut q = self.inner.lock();
        q.running.remove(task);

        if q.dirty.has(task) {
            q.push(task.clone());
            self.avail.notify_one();
        } else if q.seq.is_empty() && q.running.is_empty() {
            self.empty.notify_all();
        }
    }

    fn set_compare(&self, compare: CompareFn) {
        let mut q = self.inner.lock();
        q.compare = Some(compare);

        // Re-establish the heap property over anything already resident.
        let len = q.seq.len();
        for i in (0..len / 2).rev() {
            q.sift_down(i);
        }
    }

    fn is_empty(&self) -> bool {
        let q = self.inner.lock();
        q.seq.is_empty() && q.running.is_empty()
    }

    fn wait_empty(&self) {
        let mut q = self.inner.lock();
        self.empty
            .wait_while(&mut q, |q| !(q.seq.is_empty() && q.running.is_empty()));
    }
}

impl Inner {
    fn push(&mut self, task: Arc<Task>) {
        self.seq.push_back(task);
        if self.compare.is_some() {
            self.sift_up(self.seq.len() - 1);
        }
    }

    fn pop(&mut self) -> Arc<Task> {
        if self.compare.is_none() {
            return self.seq.pop_front().expect("pop from an empty sequence");
        }

        let last = self.seq.len() - 1;
        self.seq.swap(0, last);
        let task = self.seq.pop_back().expect("pop from an empty sequence");
        if !self.seq.is_empty() {
            self.sift_down(0);
        }
        task
    }

    fn less(&self, i: usize, j: usize) -> bool {
        let compare = self.compare.expect("sift without a comparator");
        compare(&self.seq[i], &self.seq[j]) == std::cmp::Ordering::Less
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if !self.less(i, parent) {
                break;
            }
            self.seq.swap(i, parent);
            i = parent;
        }
    }

    fn sift_down(&mut self, mut i: usize) {
        loop {
            let left = 2 * i + 1;
            if left >= self.seq.len() {
                break;
            }

            let right = left + 1;
            let mut smallest = left;
            if right < self.seq.len() && self.less(right, left) {
                smallest = right;
            }

            if !self.less(smallest, i) {
                break;
            }
            self.seq.swap(i, smallest);
            i = smallest;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::queue::{compare_by_deadline, compare_by_priority};
    use std::time::Duration;

    fn noop() -> Arc<Task> {
        Arc::new(Task::new(|_: &Context| Ok(())))
    }

    fn with_priority(p: i32) -> Arc<Task> {
        Arc::new(Task::new(|_: &Context| Ok(())).with_priority(p))
    }

    #[test]
    fn fifo_delivery() {
        let q = OrderedQueue::new();
        let (a, b, c) = (noop(), noop(), noop());

        q.add(a.clone());
        q.add(b.clone());
        q.add(c.clone());

        assert!(Arc::ptr_eq(&q.get(), &a));
        assert!(Arc::ptr_eq(&q.get(), &b));
        assert!(Arc::ptr_eq(&q.get(), &c));
    }

    #[test]
    fn pending_duplicate_is_a_noop() {
        let q = OrderedQueue::new();
        let task = noop();

        q.add(task.clone());
        q.add(task.clone());

        let got = q.get();
        q.done(&got);
        assert!(q.is_empty(), "second add of a pending task must collapse");
    }

    #[test]
    fn running_add_records_intent_and_done_promotes_it() {
        let q = OrderedQueue::new();
        let task = noop();

        q.add(task.clone());
        let got = q.get();

        // Re-admitted while running: sequence stays empty, intent is marked.
        q.add(task.clone());
        assert!(!q.is_empty());

        q.done(&got);
        let again = q.get();
        assert!(Arc::ptr_eq(&again, &task), "done must promote the pending re-admission");

        q.done(&again);
        assert!(q.is_empty());
    }

    #[test]
    fn empty_tracks_running_tasks() {
        let q = OrderedQueue::new();
        assert!(q.is_empty());

        let task = noop();
        q.add(task.clone());
        assert!(!q.is_empty());

        let got = q.get();
        assert!(!q.is_empty(), "a running task keeps the queue non-empty");

        q.done(&got);
        assert!(q.is_empty());
    }

    #[test]
    fn priority_heap_delivery() {
        let q = OrderedQueue::new();
        q.set_compare(compare_by_priority);

        for p in [4, 1, 3, 5, 2] {
            q.add(with_priority(p));
        }

        let order: Vec<i32> = (0..5)
            .map(|_| {
                let t = q.get();
                q.done(&t);
                t.priority()
            })
            .collect();
        assert_eq!(order, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn comparator_reorders_resident_tasks() {
        let q = OrderedQueue::new();
        q.add(with_priority(3));
        q.add(with_priority(1));
        q.add(with_priority(2));

        q.set_compare(compare_by_priority);
        assert_eq!(q.get().priority(), 1);
    }

    #[test]
    fn deadline_heap_puts_undated_tasks_first() {
        let q = OrderedQueue::new();
        q.set_compare(compare_by_deadline);

        let dated = Arc::new(
            Task::new(|_: &Context| Ok(())).with_timeout(Duration::from_secs(60)),
        );
        let undated = noop();
        q.add(dated.clone());
        q.add(undated.clone());

        assert!(Arc::ptr_eq(&q.get(), &undated));
    }

    #[test]
    fn get_blocks_until_a_task_arrives() {
        let q = Arc::new(OrderedQueue::new());
        let task = noop();

        let producer = {
            let q = q.clone();
            let task = task.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                q.add(task);
            })
        };

        let got = q.get();
        assert!(Arc::ptr_eq(&got, &task));
        producer.join().expect("producer panicked");
    }

    #[test]
    fn wait_empty_returns_once_drained() {
        let q = Arc::new(OrderedQueue::new());
        q.wait_empty(); // already empty

        let task = noop();
        q.add(task.clone());

        let waiter = {
            let q = q.clone();
            std::thread::spawn(move || q.wait_empty())
        };

        let got = q.get();
        std::thread::sleep(Duration::from_millis(20));
        q.done(&got);

        waiter.join().expect("waiter panicked");
        assert!(q.is_empty());
    }
}
