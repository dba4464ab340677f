use crate::queue::Queue;
use crate::scheduler::handoff::{Gate, IdlePool};
use crate::task::{Task, TaskError};
use crate::utils::ScopeGuard;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error};

/// Executes one task at a time on its own thread.
///
/// The loop is a strict alternation: offer the gate to the idle pool, block
/// for a task (or shutdown), run it, repeat. A panicking task is forgotten,
/// not fatal: the queue handoff still completes and the worker re-announces
/// readiness.
pub(crate) struct Worker {
    gate: Arc<Gate>,
    pool: Arc<IdlePool>,
    queue: Arc<dyn Queue>,
}

impl Worker {
    pub(crate) fn new(pool: Arc<IdlePool>, queue: Arc<dyn Queue>) -> Self {
        let gate = Arc::new(Gate::new());
        pool.register(&gate);
        Self { gate, pool, queue }
    }

    pub(crate) fn run(&self) {
        loop {
            if !self.pool.offer(&self.gate) {
                break;
            }

            let Some(task) = self.gate.take() else {
                break;
            };
            self.run_one(task);
        }

        debug!("worker exiting");
    }

    fn run_one(&self, task: Arc<Task>) {
        let result = panic::catch_unwind(AssertUnwindSafe(|| self.lifecycle(&task)));

        if let Err(payload) = result {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_owned())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_owned());
            error!(panic = %msg, "task panicked; dropping it");
        }
    }

    fn lifecycle(&self, task: &Arc<Task>) {
        // Whatever happens below, the queue handoff must complete exactly
        // once; the guard covers the panic path, the normal path disarms it.
        let mut done = ScopeGuard::new(|| self.queue.done(task));

        let ctx = task.context();

        // Already cancelled or past its deadline: the body never runs.
        if ctx.is_done() {
            done.disarm();
            self.queue.done(task);
            task.cancel_now();
            task.catch(TaskError::Cancelled);
            return;
        }

        // Callbacks are advisory: the first error goes to the catch handler
        // and skips the remaining callbacks, but the body still runs.
        for callback in task.start_callbacks() {
            if let Err(err) = callback(&ctx) {
                task.catch(TaskError::Callback(err));
                break;
            }
        }

        if let Err(err) = task.invoke(&ctx) {
            task.catch(TaskError::Body(err));
        }

        done.disarm();
        self.queue.done(task);

        for callback in task.finish_callbacks() {
            if let Err(err) = callback(&ctx) {
                task.catch(TaskError::Callback(err));
                break;
            }
        }
    }
}
