//! Task model and lifecycle decorations.
//!
//! [`Work`] is the capability a task exposes to the pool: run once against a
//! context. [`Task`] wraps a `Work` with the decorations the scheduler and
//! workers consume: context, cancel trigger, retry budget, priority,
//! deadline, callbacks and catch handler. Builders are chained by value and
//! the task is wrapped in an [`Arc`] at admission, so decorating an admitted
//! task is unrepresentable.

use crate::context::{CancelHandle, Context};
use crate::scheduler::Core;
use anyhow::Result;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

mod errors;
pub use errors::TaskError;

pub mod script;
pub use script::ScriptTask;

/// Something a worker can execute.
///
/// Implemented for plain closures and for [`ScriptTask`]. Bodies should
/// observe `ctx` if they run long enough for cancellation to matter.
pub trait Work: Send + Sync {
    fn run(&self, ctx: &Context) -> Result<()>;
}

impl<F> Work for F
where
    F: Fn(&Context) -> Result<()> + Send + Sync,
{
    fn run(&self, ctx: &Context) -> Result<()> {
        self(ctx)
    }
}

/// A start or finish callback. Errors are advisory: they reach the catch
/// handler but never abort the lifecycle.
pub type CallbackFn = Box<dyn Fn(&Context) -> Result<()> + Send + Sync>;

/// Receives every post-admission error of the task it is installed on.
pub type CatchFn = Box<dyn Fn(TaskError) + Send + Sync>;

/// A schedulable unit of work plus its lifecycle decorations.
///
/// Task identity is `Arc` identity: scheduling the same `Arc<Task>` again
/// while it is queued is a no-op, and scheduling it while it runs only
/// records the intent to run it once more.
pub struct Task {
    work: Box<dyn Work>,

    // Installed at decoration time (with_timeout / with_cancel) or by the
    // scheduler at admission, which is why the slot is behind a mutex.
    ctx: Mutex<Option<Context>>,
    cancel: Option<CancelHandle>,

    // Set once at first admission; stable for the task's lifetime.
    sched: OnceLock<Weak<Core>>,

    catch: Option<CatchFn>,

    retry_budget: u32,
    retries: AtomicU32,

    timeout: Option<Duration>,
    deadline: Option<Instant>,
    priority: i32,

    start_callbacks: Vec<CallbackFn>,
    finish_callbacks: Vec<CallbackFn>,
}

impl Task {
    /// Wraps a plain function body.
    pub fn new(f: impl Fn(&Context) -> Result<()> + Send + Sync + 'static) -> Self {
        Self::from_work(f)
    }

    /// Wraps any [`Work`] implementation, e.g. a [`ScriptTask`].
    pub fn from_work(work: impl Work + 'static) -> Self {
        Self {
            work: Box::new(work),
            ctx: Mutex::new(None),
            cancel: None,
            sched: OnceLock::new(),
            catch: None,
            retry_budget: 0,
            retries: AtomicU32::new(0),
            timeout: None,
            deadline: None,
            priority: 0,
            start_callbacks: Vec::new(),
            finish_callbacks: Vec::new(),
        }
    }

    /// Installs the handler receiving every post-admission error.
    pub fn with_catch(mut self, f: impl Fn(TaskError) + Send + Sync + 'static) -> Self {
        self.catch = Some(Box::new(f));
        self
    }

    /// Grants the body `times` additional runs: a body error re-admits the
    /// task as long as budget remains, and is swallowed either way so the
    /// normal finish path runs.
    ///
    /// On the bounded queue variant re-admission is best-effort: it is
    /// dropped with a warning when the buffer is full, and because that
    /// variant does not suppress duplicates, retries of a handle that was
    /// scheduled more than once may run concurrently. The retry counter
    /// still never exceeds the budget.
    pub fn with_retry(mut self, times: u32) -> Self {
        self.retry_budget = times;
        self
    }

    /// Derives a deadline context from the task's current context (or the
    /// background context) and remembers the absolute deadline for
    /// deadline-ordered queues.
    ///
    /// The deadline is evaluated when a worker picks the task up, which may
    /// be arbitrarily later than decoration time.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        let base = self.ctx.get_mut().take().unwrap_or_default();
        let deadline = Instant::now() + timeout;
        let (ctx, cancel) = base.with_deadline(deadline);

        *self.ctx.get_mut() = Some(ctx);
        self.cancel = Some(cancel);
        self.timeout = Some(timeout);
        self.deadline = Some(deadline);
        self
    }

    /// Derives a cancellable context and hands the trigger to the caller.
    pub fn with_cancel(mut self) -> (Self, CancelHandle) {
        let base = self.ctx.get_mut().take().unwrap_or_default();
        let (ctx, cancel) = base.with_cancel();

        *self.ctx.get_mut() = Some(ctx);
        self.cancel = Some(cancel.clone());
        (self, cancel)
    }

    /// Lower numbers run first under the priority comparator.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Appends a callback run before the body, in registration order.
    pub fn add_start_callback(
        mut self,
        f: impl Fn(&Context) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.start_callbacks.push(Box::new(f));
        self
    }

    /// Appends a callback run after the queue handoff completes, in
    /// registration order.
    pub fn add_finished_callback(
        mut self,
        f: impl Fn(&Context) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.finish_callbacks.push(Box::new(f));
        self
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// The absolute deadline set by [`Task::with_timeout`], if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    // --- Crate-internal lifecycle surface ---

    /// Runs the body with retry semantics: a body error is logged and, while
    /// budget remains, the task re-admits itself directly to the queue. With
    /// a retry budget the error is swallowed so the worker's normal finish
    /// path runs; without one it propagates to the caller (the worker's
    /// catch step).
    pub(crate) fn invoke(self: &Arc<Self>, ctx: &Context) -> Result<()> {
        let Err(err) = self.work.run(ctx) else {
            return Ok(());
        };

        if self.retry_budget == 0 {
            return Err(err);
        }

        warn!(error = %err, "task body failed");

        // Reserve a retry slot before re-admitting. The ordered queue keeps a
        // task single-in-flight, but the bounded variant suppresses nothing,
        // so two workers can race here; the CAS keeps the total number of
        // reserved retries at the budget either way.
        let reserved = self
            .retries
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |attempt| {
                (attempt < self.retry_budget).then_some(attempt + 1)
            });

        if let Ok(attempt) = reserved {
            debug!(
                retry = attempt + 1,
                budget = self.retry_budget,
                "re-admitting task"
            );

            match self.scheduler() {
                Some(core) => {
                    // Non-blocking: this worker is the one draining the
                    // queue, so it must never park on a full buffer here.
                    if !core.readmit(self.clone()) {
                        warn!("retry dropped, queue is at capacity");
                    }
                }
                None => warn!("retry requested on a task that was never admitted"),
            }
        }

        Ok(())
    }

    pub(crate) fn bind_scheduler(&self, core: Weak<Core>) {
        // First bind wins; the back-reference stays stable for the task's
        // lifetime even if the task is scheduled again.
        let _ = self.sched.set(core);
    }

    fn scheduler(&self) -> Option<Arc<Core>> {
        self.sched.get()?.upgrade()
    }

    pub(crate) fn set_context(&self, ctx: Context) {
        let mut slot = self.ctx.lock();
        if let Some(existing) = &*slot
            && !existing.same(&ctx)
        {
            warn!("task already has a context, using the newest");
        }
        *slot = Some(ctx);
    }

    /// Installs the background context if none was provided.
    pub(crate) fn ensure_context(&self) {
        let mut slot = self.ctx.lock();
        if slot.is_none() {
            *slot = Some(Context::background());
        }
    }

    pub(crate) fn context(&self) -> Context {
        self.ctx.lock().clone().unwrap_or_default()
    }

    /// Fires the task's cancel trigger, if it has one. Idempotent.
    pub(crate) fn cancel_now(&self) {
        if let Some(cancel) = &self.cancel {
            cancel.cancel();
        }
    }

    /// Routes a lifecycle error to the catch handler, or logs it when the
    /// task was built without one.
    pub(crate) fn catch(&self, err: TaskError) {
        match &self.catch {
            Some(f) => f(err),
            None => debug!(error = %err, "task error dropped (no catch handler)"),
        }
    }

    pub(crate) fn start_callbacks(&self) -> &[CallbackFn] {
        &self.start_callbacks
    }

    pub(crate) fn finish_callbacks(&self) -> &[CallbackFn] {
        &self.finish_callbacks
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("priority", &self.priority)
            .field("deadline", &self.deadline)
            .field("retry_budget", &self.retry_budget)
            .field("retries", &self.retries.load(Ordering::Relaxed))
            .field("start_callbacks", &self.start_callbacks.len())
            .field("finish_callbacks", &self.finish_callbacks.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::assert_impl_all;
    use std::sync::atomic::AtomicUsize;

    assert_impl_all!(Task: Send, Sync);

    fn noop() -> Task {
        Task::new(|_: &Context| Ok(()))
    }

    #[test]
    fn builder_chain_sets_all_attributes() {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();

        let task = noop()
            .with_priority(7)
            .with_retry(3)
            .with_catch(move |_| {
                h.fetch_add(1, Ordering::SeqCst);
            })
            .add_start_callback(|_: &Context| Ok(()))
            .add_start_callback(|_: &Context| Ok(()))
            .add_finished_callback(|_: &Context| Ok(()));

        assert_eq!(task.priority(), 7);
        assert_eq!(task.retry_budget, 3);
        assert_eq!(task.start_callbacks().len(), 2);
        assert_eq!(task.finish_callbacks().len(), 1);

        task.catch(TaskError::Cancelled);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn with_timeout_installs_deadline_context() {
        let task = noop().with_timeout(Duration::from_millis(50));
        assert!(task.deadline().is_some());
        assert_eq!(task.timeout(), Some(Duration::from_millis(50)));

        std::thread::sleep(Duration::from_millis(80));
        assert!(task.context().is_done());
    }

    #[test]
    fn with_cancel_trigger_marks_context_done() {
        let (task, cancel) = noop().with_cancel();
        assert!(!task.context().is_done());

        cancel.cancel();
        assert!(task.context().is_done());
    }

    #[test]
    fn ensure_context_defaults_to_background() {
        let task = noop();
        task.ensure_context();
        assert!(!task.context().is_done());
    }

    #[test]
    fn set_context_replaces_existing() {
        let task = noop();
        task.set_context(Context::background());

        let (ctx, cancel) = Context::background().with_cancel();
        task.set_context(ctx);
        cancel.cancel();
        assert!(task.context().is_done());
    }

    #[test]
    fn catch_without_handler_is_silent() {
        noop().catch(TaskError::Cancelled);
    }

    #[test]
    fn retry_counter_never_exceeds_the_budget() {
        let runs = Arc::new(AtomicUsize::new(0));
        let r = runs.clone();
        let task = Arc::new(
            Task::new(move |_: &Context| {
                r.fetch_add(1, Ordering::SeqCst);
                Err(anyhow::anyhow!("always fails"))
            })
            .with_retry(2),
        );

        // Unbound task: every reservation logs and drops, which is exactly
        // what lets us drive invoke() past the budget by hand.
        let ctx = Context::background();
        for _ in 0..5 {
            assert!(task.invoke(&ctx).is_ok(), "retry-decorated errors are swallowed");
        }

        assert_eq!(runs.load(Ordering::SeqCst), 5);
        assert_eq!(task.retries.load(Ordering::SeqCst), 2);
    }
}
