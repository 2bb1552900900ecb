//! The task surface implemented by callers.
//!
//! A task is an opaque unit of work with a priority, a runnability
//! predicate, and an execute operation. The scheduler never preempts a
//! running task; long-running tasks that want to cooperate with pause
//! requests implement [`YieldableTask`] and poll the [`YieldToken`] they are
//! handed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::accounting::Usage;
use crate::error::TaskError;
use crate::logical::LogicalScheduler;

/// A schedulable unit of work.
///
/// `execute` returns `Ok(true)` when the task has completed and `Ok(false)`
/// when it should run again later (the scheduler re-derives its priority and
/// re-places it). An `Err` is escalated through the owning scheduler's
/// exception chain; a failed task is never re-invoked.
pub trait SchedulerTask: Send + 'static {
    /// Current priority; lower values execute first.
    fn priority(&self) -> i64;

    /// Whether the task can make progress right now. Non-runnable tasks are
    /// parked until a priority recalculation turns them runnable again.
    fn is_runnable(&self) -> bool {
        true
    }

    /// Runs the task on the active scheduler. Returns whether it completed.
    fn execute(&mut self, scheduler: &LogicalScheduler) -> Result<bool, TaskError>;

    /// Re-derives the priority. Returns whether it changed. The scheduler
    /// reads [`SchedulerTask::priority`] again afterwards; priorities are
    /// never set directly from outside.
    fn recalculate_priority(&mut self) -> bool {
        false
    }

    /// Capability test: a task that wants execution time charged to its own
    /// counters returns a handle to them here. The handle is owned so the
    /// charge can be recorded while the task itself is mutably borrowed by
    /// `execute`.
    fn as_accountable(&self) -> Option<Arc<dyn Accountable>> {
        None
    }

    /// Capability test: a task that supports cooperative yielding returns
    /// itself here; the scheduler then uses the yieldable protocol.
    fn as_yieldable(&mut self) -> Option<&mut dyn YieldableTask> {
        None
    }
}

/// A task that can observe pause requests and return early.
pub trait YieldableTask: SchedulerTask {
    /// Runs the task. The task should poll `token` at convenient points and
    /// return `Ok(false)` promptly once a yield is requested; the scheduler
    /// parks it and re-runs it after the pause is lifted.
    fn execute_yieldable(
        &mut self,
        scheduler: &LogicalScheduler,
        token: &YieldToken,
    ) -> Result<bool, TaskError>;
}

/// Capability for receiving execution-time charges.
pub trait Accountable: Send + Sync {
    /// Charges one task-execution measurement to the implementor.
    fn charge_task_execution(&self, usage: Usage);
}

/// An attempt-to-handle hook for task failures.
///
/// Handlers are offered failures local-first: the scheduler nearest the
/// fault gets first refusal, then its ancestors, then the physical
/// scheduler's root hook.
pub trait ErrorHandler: Send + Sync + 'static {
    /// Returns whether the failure was handled. Unhandled failures keep
    /// escalating; if nothing observes them the worker thread terminates.
    fn try_handle(&self, error: &TaskError) -> bool;
}

impl<F> ErrorHandler for F
where
    F: Fn(&TaskError) -> bool + Send + Sync + 'static,
{
    fn try_handle(&self, error: &TaskError) -> bool {
        self(error)
    }
}

/// A pollable cooperative-yield signal.
///
/// The scheduler raises the signal as soon as a pause transition begins for
/// the task's owner; the token value is threaded explicitly through
/// [`YieldableTask::execute_yieldable`] so tasks never capture scheduler
/// state.
#[derive(Debug, Clone)]
pub struct YieldToken {
    flag: Arc<AtomicBool>,
}

impl YieldToken {
    pub(crate) fn new(flag: Arc<AtomicBool>) -> Self {
        Self { flag }
    }

    /// Returns whether the scheduler has asked the task to yield.
    #[must_use]
    pub fn is_yield_requested(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}
