//! Dispatcher/worker rendezvous primitives.
//!
//! Two pieces mirror the two channels of the handoff protocol: every worker
//! owns a single-slot [`Gate`] the dispatcher delivers tasks through, and the
//! [`IdlePool`] is the rendezvous where idle workers offer their gates. The
//! pool also carries the shutdown signal: once fired, offers are refused,
//! the dispatcher's take drains to `None`, and every registered gate is
//! closed so blocked workers exit.

use crate::task::Task;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::warn;

/// Single-slot task handoff owned by one worker.
pub(crate) struct Gate {
    slot: Mutex<GateSlot>,
    cond: Condvar,
}

#[derive(Default)]
enum GateSlot {
    #[default]
    Empty,
    Ready(Arc<Task>),
    Closed,
}

impl Gate {
    pub(crate) fn new() -> Self {
        Self {
            slot: Mutex::new(GateSlot::Empty),
            cond: Condvar::new(),
        }
    }

    /// Delivers a task to the waiting worker. Delivering to a closed gate
    /// drops the task; the pool is shutting down and nobody will run it.
    pub(crate) fn give(&self, task: Arc<Task>) {
        let mut slot = self.slot.lock();
        match &*slot {
            GateSlot::Closed => {
                warn!("dropping task handed to a closed worker gate");
            }
            _ => {
                *slot = GateSlot::Ready(task);
                self.cond.notify_one();
            }
        }
    }

    /// Blocks until a task is delivered or the gate is closed.
    pub(crate) fn take(&self) -> Option<Arc<Task>> {
        let mut slot = self.slot.lock();
        self.cond.wait_while(&mut slot, |s| matches!(s, GateSlot::Empty));

        match std::mem::take(&mut *slot) {
            GateSlot::Ready(task) => Some(task),
            GateSlot::Closed => {
                *slot = GateSlot::Closed;
                None
            }
            GateSlot::Empty => unreachable!("woken with an empty gate"),
        }
    }

    pub(crate) fn close(&self) {
        let mut slot = self.slot.lock();
        *slot = GateSlot::Closed;
        self.cond.notify_all();
    }
}

/// The worker-ready rendezvous plus the pool-wide shutdown signal.
pub(crate) struct IdlePool {
    inner: Mutex<PoolInner>,
    cond: Condvar,
}

#[derive(Default)]
struct PoolInner {
    // Gates of workers currently waiting for a task, in offer order.
    idle: VecDeque<Arc<Gate>>,

    // Every gate ever registered; closed on shutdown so workers blocked in
    // `Gate::take` observe it.
    gates: Vec<Arc<Gate>>,

    shutdown: bool,
}

impl IdlePool {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(PoolInner::default()),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn register(&self, gate: &Arc<Gate>) {
        self.inner.lock().gates.push(gate.clone());
    }

    /// A worker announces readiness. Returns `false` once shutdown has
    /// fired, telling the worker to exit instead of waiting.
    pub(crate) fn offer(&self, gate: &Arc<Gate>) -> bool {
        let mut pool = self.inner.lock();
        if pool.shutdown {
            return false;
        }

        pool.idle.push_back(gate.clone());
        self.cond.notify_one();
        true
    }

    /// The dispatcher blocks for the next idle worker; `None` means
    /// shutdown.
    pub(crate) fn take(&self) -> Option<Arc<Gate>> {
        let mut pool = self.inner.lock();
        self.cond
            .wait_while(&mut pool, |p| p.idle.is_empty() && !p.shutdown);

        if pool.shutdown {
            return None;
        }
        pool.idle.pop_front()
    }

    /// Fires the shutdown signal once: refuses further offers, wakes the
    /// dispatcher, and closes every registered gate.
    pub(crate) fn shutdown(&self) {
        let gates = {
            let mut pool = self.inner.lock();
            if pool.shutdown {
                return;
            }
            pool.shutdown = true;
            pool.idle.clear();
            self.cond.notify_all();
            pool.gates.clone()
        };

        // Close outside the pool lock; gates have their own locks.
        for gate in gates {
            gate.close();
        }
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.inner.lock().shutdown
    }
}
