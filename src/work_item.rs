//! Work items: a task plus its due time, priority, and pause state.
//!
//! A work item is queued in exactly one of the {ready, not-ready, due-time}
//! collections of exactly one worker at any instant. The task itself is only
//! ever touched on the owning worker's thread; the fields read across
//! threads (cached priority, pause flag, current worker) are atomics.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::accounting::{CounterCell, TaskChargeScope, Usage};
use crate::error::TaskError;
use crate::heap::Compare;
use crate::logical::LogicalScheduler;
use crate::registry::NodeId;
use crate::task::{Accountable, SchedulerTask, YieldToken};
use crate::time::Time;
use crate::util::hash;

/// Sentinel for "not placed on any worker".
pub(crate) const WORKER_NONE: usize = usize::MAX;

/// Global insertion sequence; gives items a stable identity for hashing.
static NEXT_SEQ: AtomicU64 = AtomicU64::new(0);

pub(crate) struct WorkItem {
    seq: u64,
    due: Time,
    /// Cached priority, re-derived from the task via `recalculate`.
    priority: AtomicI64,
    /// Raised while the owning scheduler is pausing or paused. Shared with
    /// the yield tokens handed to the task.
    paused: Arc<AtomicBool>,
    /// Raised when the item is cancelled (scheduler dispose). A cancelled
    /// item is discarded at the next routing point; it is never executed
    /// again and never re-placed.
    cancelled: AtomicBool,
    /// Index of the worker currently holding the item.
    worker: AtomicUsize,
    /// Owning logical scheduler. Immutable.
    owner: NodeId,
    /// The owner's counters, held directly so hot-path charging does not go
    /// through the registry.
    counters: Arc<CounterCell>,
    task: Mutex<Box<dyn SchedulerTask>>,
}

impl WorkItem {
    pub(crate) fn new(
        task: Box<dyn SchedulerTask>,
        due: Time,
        owner: NodeId,
        counters: Arc<CounterCell>,
        born_paused: bool,
    ) -> ItemRef {
        let priority = task.priority();
        ItemRef(Arc::new(Self {
            seq: NEXT_SEQ.fetch_add(1, Ordering::Relaxed),
            due,
            priority: AtomicI64::new(priority),
            paused: Arc::new(AtomicBool::new(born_paused)),
            cancelled: AtomicBool::new(false),
            worker: AtomicUsize::new(WORKER_NONE),
            owner,
            counters,
            task: Mutex::new(task),
        }))
    }

    pub(crate) fn due(&self) -> Time {
        self.due
    }

    pub(crate) fn priority(&self) -> i64 {
        self.priority.load(Ordering::Relaxed)
    }

    pub(crate) fn owner(&self) -> NodeId {
        self.owner
    }

    pub(crate) fn counters(&self) -> &CounterCell {
        &self.counters
    }

    /// Owned handle to the owner's counters, for charge scopes that must
    /// outlive a move of the item itself.
    pub(crate) fn counters_arc(&self) -> Arc<CounterCell> {
        Arc::clone(&self.counters)
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub(crate) fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::SeqCst);
    }

    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn worker(&self) -> Option<usize> {
        match self.worker.load(Ordering::SeqCst) {
            WORKER_NONE => None,
            index => Some(index),
        }
    }

    pub(crate) fn set_worker(&self, index: usize) {
        self.worker.store(index, Ordering::SeqCst);
    }

    pub(crate) fn clear_worker(&self) {
        self.worker.store(WORKER_NONE, Ordering::SeqCst);
    }

    /// Asks the task whether it can make progress. Owning worker thread
    /// only.
    pub(crate) fn is_runnable(&self) -> bool {
        self.task.lock().is_runnable()
    }

    /// Re-derives the task's priority into the cache. Owning worker thread
    /// only. Returns whether the priority changed.
    pub(crate) fn recalculate(&self) -> bool {
        let mut task = self.task.lock();
        let changed = task.recalculate_priority();
        self.priority.store(task.priority(), Ordering::Relaxed);
        changed
    }

    /// Executes the task with accounting and cooperative-yield support.
    ///
    /// Two nested charge scopes surround the call: the outer one charges the
    /// owning scheduler's user time, the inner one charges the task's own
    /// counters when it exposes them. Yieldable tasks get a token backed by
    /// this item's pause flag and may return `Ok(false)` without completing.
    pub(crate) fn invoke(&self, scheduler: &LogicalScheduler) -> Result<bool, TaskError> {
        self.counters.record_execution();

        let owner_charge = OwnerUserCharge(&self.counters);
        let mut task = self.task.lock();
        let task_charge = task.as_accountable();

        let _outer = TaskChargeScope::enter(Some(&owner_charge as &dyn Accountable));
        let _inner = TaskChargeScope::enter(task_charge.as_deref());

        let result = match task.as_yieldable() {
            Some(yieldable) => {
                let token = YieldToken::new(Arc::clone(&self.paused));
                yieldable.execute_yieldable(scheduler, &token)
            }
            None => task.execute(scheduler),
        };

        if let Err(error) = &result {
            tracing::debug!(item = self.seq, %error, "task execution failed");
        }
        result
    }
}

impl std::fmt::Debug for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkItem")
            .field("seq", &self.seq)
            .field("due", &self.due)
            .field("priority", &self.priority())
            .field("paused", &self.is_paused())
            .finish_non_exhaustive()
    }
}

/// Adapter charging the owning scheduler's user meter.
struct OwnerUserCharge<'a>(&'a CounterCell);

impl Accountable for OwnerUserCharge<'_> {
    fn charge_task_execution(&self, usage: Usage) {
        self.0.user_meter().add(usage);
    }
}

/// A shared handle to a work item. Equality and hashing are by identity
/// (which item), not by value, matching what queue removal needs.
#[derive(Clone, Debug)]
pub(crate) struct ItemRef(Arc<WorkItem>);

impl std::ops::Deref for ItemRef {
    type Target = WorkItem;

    fn deref(&self) -> &WorkItem {
        &self.0
    }
}

impl PartialEq for ItemRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for ItemRef {}

impl std::hash::Hash for ItemRef {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        state.write_u64(hash::combine(self.0.seq, self.0.due.as_nanos()));
    }
}

/// Ready-queue order: ascending cached priority.
pub(crate) struct ByPriority;

impl Compare<ItemRef> for ByPriority {
    fn compare(&self, a: &ItemRef, b: &ItemRef) -> std::cmp::Ordering {
        a.priority().cmp(&b.priority())
    }
}

/// Due-time-queue order: due time, then task priority.
pub(crate) struct ByDueTime;

impl Compare<ItemRef> for ByDueTime {
    fn compare(&self, a: &ItemRef, b: &ItemRef) -> std::cmp::Ordering {
        a.due()
            .cmp(&b.due())
            .then_with(|| a.priority().cmp(&b.priority()))
    }
}
