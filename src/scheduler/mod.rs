//! Scheduler surface and dispatch loop.
//!
//! [`Scheduler`] is a cheap cloneable handle. `start` spawns the worker
//! threads and the dispatcher thread; the dispatcher matches idle workers to
//! queued tasks one handoff at a time. Admission (`schedule`) and execution
//! are fully decoupled: tasks can be admitted before `start` and are simply
//! held by the queue.

use crate::context::Context;
use crate::queue::{BoundedQueue, CompareFn, OrderedQueue, Queue, compare_by_deadline, compare_by_priority};
use crate::task::Task;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Once};
use std::thread;
use tracing::{debug, warn};

mod errors;
pub use errors::SchedulerError;

mod handoff;
use handoff::IdlePool;
mod worker;
use worker::Worker;


/// Handle to a running (or not-yet-started) scheduler.
#[derive(Clone)]
pub struct Scheduler {
    core: Arc<Core>,
}

/// Shared state behind every handle; tasks keep a weak back-reference to it
/// for retry re-admission.
pub(crate) struct Core {
    queue: Arc<dyn Queue>,
    pool: Arc<IdlePool>,
    started: AtomicBool,
    stop: Once,
    thread_name: String,
}

impl Core {
    /// Direct queue re-admission, bypassing the dispatcher handshake. Used
    /// by the retry path while the task is still running, on a worker
    /// thread, so it must not block: a worker parked on a full bounded
    /// buffer would be waiting for itself to drain it. Returns `false` when
    /// the queue could not accept the task.
    pub(crate) fn readmit(&self, task: Arc<Task>) -> bool {
        self.queue.try_add(task)
    }

    fn dispatch(&self) {
        debug!("dispatcher running");
        loop {
            let Some(gate) = self.pool.take() else {
                debug!("dispatcher observed shutdown");
                return;
            };

            // May block until a task arrives; shutdown is observed at the
            // next handshake.
            let task = self.queue.get();
            gate.give(task);
        }
    }
}

impl Scheduler {
    /// A scheduler over the re-entrancy-suppressing ordered queue.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> Builder {
        Builder::new()
    }

    /// Spawns `workers` worker threads (`0` means one per logical CPU) plus
    /// the dispatcher thread, then returns. Calling it again is a no-op.
    pub fn start(&self, workers: usize) {
        if self.core.started.swap(true, Ordering::SeqCst) {
            warn!("scheduler already started");
            return;
        }

        let count = if workers == 0 {
            thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        } else {
            workers
        };
        debug!(workers = count, "starting scheduler");

        for i in 0..count {
            let worker = Worker::new(self.core.pool.clone(), self.core.queue.clone());
            thread::Builder::new()
                .name(format!("{}-worker-{}", self.core.thread_name, i))
                .spawn(move || worker.run())
                .expect("failed to spawn worker thread");
        }

        let core = self.core.clone();
        thread::Builder::new()
            .name(format!("{}-dispatch", self.core.thread_name))
            .spawn(move || core.dispatch())
            .expect("failed to spawn dispatcher thread");
    }

    /// Admits a task. The task gets the background context unless one was
    /// installed at decoration time.
    pub fn schedule(&self, task: impl Into<Arc<Task>>) -> Result<(), SchedulerError> {
        let task = task.into();
        if self.core.pool.is_shutdown() {
            return Err(SchedulerError::Stopped);
        }

        task.bind_scheduler(Arc::downgrade(&self.core));
        task.ensure_context();
        self.core.queue.add(task);
        Ok(())
    }

    /// Admits a task under the given context, replacing any context the task
    /// carried.
    pub fn schedule_with_ctx(
        &self,
        ctx: Context,
        task: impl Into<Arc<Task>>,
    ) -> Result<(), SchedulerError> {
        let task = task.into();
        if self.core.pool.is_shutdown() {
            return Err(SchedulerError::Stopped);
        }

        task.set_context(ctx);
        task.bind_scheduler(Arc::downgrade(&self.core));
        self.core.queue.add(task);
        Ok(())
    }

    /// Orders the queue by ascending priority. Fails once any task has been
    /// admitted.
    pub fn sort_by_priority(&self) -> Result<(), SchedulerError> {
        self.install_compare(compare_by_priority)
    }

    /// Orders the queue by earliest deadline. Fails once any task has been
    /// admitted.
    pub fn sort_by_deadline(&self) -> Result<(), SchedulerError> {
        self.install_compare(compare_by_deadline)
    }

    fn install_compare(&self, compare: CompareFn) -> Result<(), SchedulerError> {
        if !self.core.queue.is_empty() {
            return Err(SchedulerError::NotEmpty);
        }

        self.core.queue.set_compare(compare);
        Ok(())
    }

    /// Fires the shutdown signal exactly once: rejects further admissions,
    /// stops the dispatcher at its next handshake and releases idle workers.
    pub fn stop(&self) {
        self.core.stop.call_once(|| {
            debug!("stopping scheduler");
            self.core.pool.shutdown();
        });
    }

    /// Blocks until the queue reports empty (no task queued or running).
    pub fn wait(&self) {
        self.core.queue.wait_empty();
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("thread_name", &self.core.thread_name)
            .field("started", &self.core.started.load(Ordering::SeqCst))
            .field("shutdown", &self.core.pool.is_shutdown())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy)]
enum QueueKind {
    Ordered,
    Bounded(usize),
}

/// Configures a [`Scheduler`] before any thread is spawned.
#[derive(Debug)]
pub struct Builder {
    kind: QueueKind,
    thread_name: String,
}

impl Builder {
    fn new() -> Self {
        Self {
            kind: QueueKind::Ordered,
            thread_name: "workq".to_owned(),
        }
    }

    /// Swaps the ordered queue for the bounded channel-style variant:
    /// admission blocks at `capacity`, duplicates are not suppressed and
    /// comparators are unavailable.
    pub fn bounded_queue(mut self, capacity: usize) -> Self {
        self.kind = QueueKind::Bounded(capacity);
        self
    }

    /// Prefix for the worker and dispatcher thread names (default: "workq").
    pub fn thread_name(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name = prefix.into();
        self
    }

    pub fn build(self) -> Scheduler {
        let queue: Arc<dyn Queue> = match self.kind {
            QueueKind::Ordered => Arc::new(OrderedQueue::new()),
            QueueKind::Bounded(capacity) => Arc::new(BoundedQueue::new(capacity)),
        };

        Scheduler {
            core: Arc::new(Core {
                queue,
                pool: Arc::new(IdlePool::new()),
                started: AtomicBool::new(false),
                stop: Once::new(),
                thread_name: self.thread_name,
            }),
        }
    }
}
