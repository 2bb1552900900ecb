//! Logical schedulers: a tree of lightweight handles over one shared
//! physical scheduler.
//!
//! Each node owns the set of work items it is responsible for and provides
//! isolated pause/continue and exception scoping. Pausing cascades through
//! the subtree; a parent's reported pause duration therefore subsumes its
//! children's.
//!
//! Nodes live in a generation-checked arena and refer to each other by
//! [`NodeId`]; there are no owning back-pointers. Each node's sets and
//! status are guarded by that node's own lock, taken briefly and never
//! across a blocking wait or task execution.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex as StdMutex, PoisonError};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::accounting::{CounterCell, SchedulerCounters};
use crate::error::{SchedulerError, TaskError};
use crate::physical::PoolShared;
use crate::registry::NodeId;
use crate::task::{ErrorHandler, SchedulerTask};
use crate::time::Time;
use crate::work_item::{ItemRef, WorkItem};
use crate::worker::{self, Command};

/// Lifecycle status of a logical scheduler.
///
/// Transitions are monotonic except `Paused → Running` (via
/// [`LogicalScheduler::resume`]); `Disposed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerStatus {
    /// Accepting and executing work.
    Running,
    /// A pause has begun; owned items are flagged but some may still be
    /// finishing their current execution.
    Pausing,
    /// No owned work executes until resumed. New work is accepted but born
    /// paused.
    Paused,
    /// Terminal. All operations are silent no-ops.
    Disposed,
}

impl fmt::Display for SchedulerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Running => "running",
            Self::Pausing => "pausing",
            Self::Paused => "paused",
            Self::Disposed => "disposed",
        })
    }
}

/// Per-node state addressed through the arena.
pub(crate) struct NodeState {
    counters: Arc<CounterCell>,
    handlers: Mutex<Vec<Arc<dyn ErrorHandler>>>,
    inner: Mutex<NodeInner>,
}

struct NodeInner {
    status: SchedulerStatus,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    items: HashSet<ItemRef>,
    /// Set while paused; folded into the counters on resume.
    paused_at: Option<Instant>,
}

impl NodeState {
    fn new(parent: Option<NodeId>, status: SchedulerStatus) -> Self {
        Self {
            counters: Arc::new(CounterCell::new()),
            handlers: Mutex::new(Vec::new()),
            inner: Mutex::new(NodeInner {
                status,
                parent,
                children: Vec::new(),
                items: HashSet::new(),
                paused_at: None,
            }),
        }
    }

    pub(crate) fn parent(&self) -> Option<NodeId> {
        self.inner.lock().parent
    }

    /// Offers a failure to this node's subscribers. The subscriber list is
    /// snapshotted first so a handler may register further handlers (or
    /// schedule work) without deadlocking.
    pub(crate) fn try_handle(&self, error: &TaskError) -> bool {
        let snapshot: SmallVec<[Arc<dyn ErrorHandler>; 2]> =
            self.handlers.lock().iter().cloned().collect();
        snapshot.iter().any(|handler| handler.try_handle(error))
    }

    /// Completion hook target: drops the worker-side registration.
    pub(crate) fn deregister(&self, item: &ItemRef) {
        self.inner.lock().items.remove(item);
    }
}

/// Synchronization for the asynchronous half of a pause.
///
/// Every worker holding affected items confirms once it has applied the
/// pause recalculation (and is therefore no longer executing any of them);
/// a shared countdown reaching zero flips the affected nodes to `Paused`
/// and releases the waiters.
pub(crate) struct PauseGate {
    pending: AtomicUsize,
    nodes: Vec<NodeId>,
    complete: StdMutex<bool>,
    cvar: Condvar,
}

impl PauseGate {
    /// `pending` counts one confirmation per affected worker plus one guard
    /// held by the initiator while it is still enumerating.
    fn new(nodes: Vec<NodeId>, pending: usize) -> Self {
        Self {
            pending: AtomicUsize::new(pending),
            nodes,
            complete: StdMutex::new(false),
            cvar: Condvar::new(),
        }
    }

    /// One confirmation; the last one completes the pause.
    pub(crate) fn confirm_worker(&self, shared: &Arc<PoolShared>) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.finish(shared);
        }
    }

    fn finish(&self, shared: &Arc<PoolShared>) {
        for id in &self.nodes {
            let Some(node) = shared.node(*id) else { continue };
            let mut inner = node.inner.lock();
            // Dispose may have won the race for an individual node.
            if inner.status == SchedulerStatus::Pausing {
                inner.status = SchedulerStatus::Paused;
                inner.paused_at = Some(Instant::now());
            }
        }
        let mut complete = self
            .complete
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *complete = true;
        self.cvar.notify_all();
        tracing::debug!(nodes = self.nodes.len(), "pause complete");
    }
}

/// Waitable result of [`LogicalScheduler::pause`].
///
/// Completion is signaled through a condvar, so waiter continuations run on
/// the waiting caller's thread, never on a worker thread.
pub struct PauseHandle {
    /// `None` when the pause was already complete at the call.
    gate: Option<Arc<PauseGate>>,
}

impl PauseHandle {
    fn completed() -> Self {
        Self { gate: None }
    }

    /// Whether all affected work has stopped.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        match &self.gate {
            None => true,
            Some(gate) => *gate.complete.lock().unwrap_or_else(PoisonError::into_inner),
        }
    }

    /// Blocks until the pause completes.
    pub fn wait(&self) {
        let Some(gate) = &self.gate else { return };
        let mut complete = gate.complete.lock().unwrap_or_else(PoisonError::into_inner);
        while !*complete {
            complete = gate
                .cvar
                .wait(complete)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Blocks until the pause completes or `timeout` elapses. Returns
    /// whether it completed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let Some(gate) = &self.gate else { return true };
        let complete = gate.complete.lock().unwrap_or_else(PoisonError::into_inner);
        let (complete, _timed_out) = gate
            .cvar
            .wait_timeout_while(complete, timeout, |done| !*done)
            .unwrap_or_else(PoisonError::into_inner);
        *complete
    }
}

impl fmt::Debug for PauseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PauseHandle")
            .field("complete", &self.is_complete())
            .finish()
    }
}

/// Items to recalculate, grouped by the worker currently holding them.
type WorkerBatches = HashMap<usize, SmallVec<[ItemRef; 4]>>;

/// A tree-addressable scheduling handle over a shared worker pool.
///
/// Handles are cheap to clone and do not own the node; disposal is explicit
/// through [`LogicalScheduler::dispose`] and cascades to all children.
#[derive(Clone)]
pub struct LogicalScheduler {
    shared: Arc<PoolShared>,
    id: NodeId,
}

impl LogicalScheduler {
    pub(crate) fn new_root(shared: Arc<PoolShared>) -> Self {
        let id = shared.insert_node(Arc::new(NodeState::new(None, SchedulerStatus::Running)));
        Self { shared, id }
    }

    pub(crate) fn from_parts(shared: Arc<PoolShared>, id: NodeId) -> Self {
        Self { shared, id }
    }

    fn node(&self) -> Option<Arc<NodeState>> {
        self.shared.node(self.id)
    }

    /// Current monotonic time, for computing absolute due times.
    #[must_use]
    pub fn now(&self) -> Time {
        Time::now()
    }

    /// Current lifecycle status. A node that no longer resolves reports
    /// [`SchedulerStatus::Disposed`].
    #[must_use]
    pub fn status(&self) -> SchedulerStatus {
        match self.node() {
            Some(node) => node.inner.lock().status,
            None => SchedulerStatus::Disposed,
        }
    }

    /// Schedules a task for immediate execution.
    pub fn schedule<T: SchedulerTask>(&self, task: T) {
        self.schedule_at(Time::now(), task);
    }

    /// Schedules a task to run after a relative delay.
    pub fn schedule_after<T: SchedulerTask>(&self, delay: Duration, task: T) {
        self.schedule_at(Time::now().saturating_add(delay), task);
    }

    /// Schedules a task to run at an absolute due time.
    ///
    /// On a disposed scheduler the task is silently discarded: dispose may
    /// race with scheduling from other threads, and that race is benign by
    /// contract. While the scheduler is pausing or paused the item is born
    /// paused and will not run before [`LogicalScheduler::resume`].
    pub fn schedule_at<T: SchedulerTask>(&self, due: Time, task: T) {
        let Some(node) = self.node() else { return };
        let mut inner = node.inner.lock();
        match inner.status {
            SchedulerStatus::Disposed => {}
            status => {
                let born_paused = matches!(
                    status,
                    SchedulerStatus::Pausing | SchedulerStatus::Paused
                );
                let item = WorkItem::new(
                    Box::new(task),
                    due,
                    self.id,
                    Arc::clone(&node.counters),
                    born_paused,
                );
                tracing::trace!(%due, born_paused, "scheduling work item");
                inner.items.insert(item.clone());
                // Registration and placement under one lock: dispose either
                // sees the item and removes it, or runs first and the
                // status check above discards the request.
                self.shared.place(&item);
            }
        }
    }

    /// Creates a child scheduler sharing this scheduler's physical pool.
    ///
    /// A child created while the parent is pausing or paused starts out
    /// paused (it has no items yet, so there is nothing to wait for). A
    /// child of a disposed scheduler is itself born disposed: the race
    /// between dispose and child creation must not produce an error.
    #[must_use]
    pub fn create_child(&self) -> LogicalScheduler {
        let Some(node) = self.node() else {
            return Self::from_parts(Arc::clone(&self.shared), NodeId::detached());
        };
        let mut inner = node.inner.lock();
        let child_status = match inner.status {
            SchedulerStatus::Disposed => {
                drop(inner);
                return Self::from_parts(Arc::clone(&self.shared), NodeId::detached());
            }
            SchedulerStatus::Running => SchedulerStatus::Running,
            // The in-flight pause gate will not visit this child, so it
            // lands directly in the paused state.
            SchedulerStatus::Pausing | SchedulerStatus::Paused => SchedulerStatus::Paused,
        };
        let child = Arc::new(NodeState::new(Some(self.id), child_status));
        if child_status == SchedulerStatus::Paused {
            child.inner.lock().paused_at = Some(Instant::now());
        }
        let child_id = self.shared.insert_node(child);
        inner.children.push(child_id);
        tracing::trace!(?child_id, "created child scheduler");
        Self::from_parts(Arc::clone(&self.shared), child_id)
    }

    /// Begins pausing this scheduler and all of its descendants.
    ///
    /// Phase one runs synchronously under each node's lock: statuses flip
    /// to `Pausing` and every registered item's pause flag is raised, so
    /// work scheduled after this call returns is born paused. Phase two is
    /// asynchronous: each worker holding affected items confirms it has
    /// stopped executing them, and the returned handle completes once the
    /// last confirmation arrives.
    pub fn pause(&self) -> Result<PauseHandle, SchedulerError> {
        let Some(node) = self.node() else {
            return Ok(PauseHandle::completed());
        };

        let mut affected: Vec<ItemRef> = Vec::new();
        let mut gate_nodes: Vec<NodeId> = Vec::new();
        let children = {
            let mut inner = node.inner.lock();
            match inner.status {
                SchedulerStatus::Disposed | SchedulerStatus::Paused => {
                    return Ok(PauseHandle::completed());
                }
                SchedulerStatus::Pausing => {
                    return Err(SchedulerError::InvalidTransition {
                        status: SchedulerStatus::Pausing,
                        operation: "pause",
                    });
                }
                SchedulerStatus::Running => {
                    inner.status = SchedulerStatus::Pausing;
                    gate_nodes.push(self.id);
                    for item in &inner.items {
                        item.set_paused(true);
                        affected.push(item.clone());
                    }
                    inner.children.clone()
                }
            }
        };
        for child in children {
            Self::mark_pausing(&self.shared, child, &mut affected, &mut gate_nodes);
        }

        let mut batches = WorkerBatches::new();
        for item in affected {
            if let Some(index) = item.worker() {
                batches.entry(index).or_default().push(item);
            }
        }

        // One pending slot per worker, plus a guard the initiator holds
        // until every request is submitted, so an early confirmation cannot
        // complete the gate prematurely.
        let gate = Arc::new(PauseGate::new(gate_nodes, batches.len() + 1));
        for (index, items) in batches {
            self.shared.submit_to(
                index,
                Command::Recalculate {
                    items,
                    gate: Some(Arc::clone(&gate)),
                },
            );
        }
        gate.confirm_worker(&self.shared);
        Ok(PauseHandle {
            gate: Some(gate),
        })
    }

    fn mark_pausing(
        shared: &Arc<PoolShared>,
        id: NodeId,
        affected: &mut Vec<ItemRef>,
        gate_nodes: &mut Vec<NodeId>,
    ) {
        let Some(node) = shared.node(id) else { return };
        let children = {
            let mut inner = node.inner.lock();
            match inner.status {
                SchedulerStatus::Running => {
                    inner.status = SchedulerStatus::Pausing;
                    gate_nodes.push(id);
                    for item in &inner.items {
                        item.set_paused(true);
                        affected.push(item.clone());
                    }
                    inner.children.clone()
                }
                // Already pausing or paused: items are flagged; still
                // descend in case a grandchild was resumed independently.
                SchedulerStatus::Pausing | SchedulerStatus::Paused => inner.children.clone(),
                SchedulerStatus::Disposed => Vec::new(),
            }
        };
        for child in children {
            Self::mark_pausing(shared, child, affected, gate_nodes);
        }
    }

    /// Resumes a paused scheduler and all paused descendants: clears every
    /// owned item's pause flag (own node first, then children) and asks the
    /// workers to recalculate their priorities so they re-enter the ready
    /// queues.
    pub fn resume(&self) -> Result<(), SchedulerError> {
        let Some(node) = self.node() else { return Ok(()) };

        let mut batches = WorkerBatches::new();
        let children = {
            let mut inner = node.inner.lock();
            match inner.status {
                SchedulerStatus::Disposed => return Ok(()),
                status @ (SchedulerStatus::Running | SchedulerStatus::Pausing) => {
                    return Err(SchedulerError::InvalidTransition {
                        status,
                        operation: "resume",
                    });
                }
                SchedulerStatus::Paused => {
                    Self::reactivate(&node, &mut inner, &mut batches);
                    inner.children.clone()
                }
            }
        };
        for child in children {
            Self::resume_descendants(&self.shared, child, &mut batches);
        }

        self.submit_batches(batches);
        tracing::debug!("scheduler resumed");
        Ok(())
    }

    fn resume_descendants(shared: &Arc<PoolShared>, id: NodeId, batches: &mut WorkerBatches) {
        let Some(node) = shared.node(id) else { return };
        let children = {
            let mut inner = node.inner.lock();
            if inner.status == SchedulerStatus::Paused {
                Self::reactivate(&node, &mut inner, batches);
            }
            inner.children.clone()
        };
        for child in children {
            Self::resume_descendants(shared, child, batches);
        }
    }

    /// Flips one paused node back to running. Caller holds the node lock.
    fn reactivate(node: &NodeState, inner: &mut NodeInner, batches: &mut WorkerBatches) {
        inner.status = SchedulerStatus::Running;
        if let Some(paused_at) = inner.paused_at.take() {
            node.counters.add_paused(paused_at.elapsed());
        }
        for item in &inner.items {
            item.set_paused(false);
            if let Some(index) = item.worker() {
                batches.entry(index).or_default().push(item.clone());
            }
        }
    }

    /// Forces re-derivation of priority for every owned item, without any
    /// status change.
    pub fn recalculate_priority(&self) {
        let Some(node) = self.node() else { return };
        let mut batches = WorkerBatches::new();
        {
            let inner = node.inner.lock();
            if inner.status == SchedulerStatus::Disposed {
                return;
            }
            for item in &inner.items {
                if let Some(index) = item.worker() {
                    batches.entry(index).or_default().push(item.clone());
                }
            }
        }
        self.submit_batches(batches);
    }

    fn submit_batches(&self, batches: WorkerBatches) {
        for (index, items) in batches {
            self.shared
                .submit_to(index, Command::Recalculate { items, gate: None });
        }
    }

    /// Disposes this scheduler: detaches it from its parent, removes every
    /// owned item from its worker, and recursively disposes all children.
    /// Idempotent; the first call wins.
    pub fn dispose(&self) {
        Self::dispose_node(&self.shared, self.id, true);
    }

    fn dispose_node(shared: &Arc<PoolShared>, id: NodeId, detach: bool) {
        let Some(node) = shared.node(id) else { return };
        let (items, children, parent) = {
            let mut inner = node.inner.lock();
            if inner.status == SchedulerStatus::Disposed {
                return;
            }
            inner.status = SchedulerStatus::Disposed;
            (
                std::mem::take(&mut inner.items),
                std::mem::take(&mut inner.children),
                inner.parent.take(),
            )
        };

        if detach {
            if let Some(parent_id) = parent {
                if let Some(parent_node) = shared.node(parent_id) {
                    parent_node.inner.lock().children.retain(|child| *child != id);
                }
            }
        }

        for item in items {
            item.cancel();
            if let Some(index) = item.worker() {
                shared.submit_to(index, Command::Remove(item));
            }
        }
        for child in children {
            Self::dispose_node(shared, child, false);
        }
        shared.remove_node(id);
        tracing::trace!(?id, "scheduler disposed");
    }

    /// Returns whether the calling thread is a worker thread of this
    /// scheduler's pool.
    #[must_use]
    pub fn check_access(&self) -> bool {
        matches!(worker::current_worker(), Some((pool, _)) if pool == self.shared.pool_id())
    }

    /// Errors unless the calling thread is a worker thread of this
    /// scheduler's pool.
    pub fn verify_access(&self) -> Result<(), SchedulerError> {
        if self.check_access() {
            Ok(())
        } else {
            Err(SchedulerError::AccessDenied)
        }
    }

    /// Subscribes a handler to task failures escalating through this node.
    /// Handlers run local-first; an unhandled failure is offered to the
    /// parent next and ultimately to the physical scheduler.
    pub fn add_error_handler<H: ErrorHandler>(&self, handler: H) {
        let Some(node) = self.node() else { return };
        node.handlers.lock().push(Arc::new(handler));
    }

    /// Reads this scheduler's performance counters, optionally aggregated
    /// over all descendants. Uptime and paused time always describe this
    /// node alone; a parent's pause subsumes its children's, so descendant
    /// values would double-count.
    #[must_use]
    pub fn counters(&self, include_descendants: bool) -> SchedulerCounters {
        let Some(node) = self.node() else {
            return SchedulerCounters::default();
        };
        let (live_paused, children) = {
            let inner = node.inner.lock();
            (
                inner.paused_at.map_or(Duration::ZERO, |at| at.elapsed()),
                inner.children.clone(),
            )
        };
        let mut total = node.counters.snapshot(true, live_paused);
        if include_descendants {
            for child in children {
                total = total + Self::descendant_counters(&self.shared, child);
            }
        }
        total
    }

    fn descendant_counters(shared: &Arc<PoolShared>, id: NodeId) -> SchedulerCounters {
        let Some(node) = shared.node(id) else {
            return SchedulerCounters::default();
        };
        let children = node.inner.lock().children.clone();
        let mut total = node.counters.snapshot(false, Duration::ZERO);
        for child in children {
            total = total + Self::descendant_counters(shared, child);
        }
        total
    }
}

impl fmt::Debug for LogicalScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogicalScheduler")
            .field("id", &self.id)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::physical::PhysicalScheduler;

    fn pool() -> PhysicalScheduler {
        PhysicalScheduler::with_config(SchedulerConfig {
            worker_count: 2,
            ..SchedulerConfig::default()
        })
        .expect("config is valid")
    }

    #[test]
    fn status_machine_edges() {
        let physical = pool();
        let scheduler = physical.create_scheduler();
        assert_eq!(scheduler.status(), SchedulerStatus::Running);

        assert_eq!(
            scheduler.resume(),
            Err(SchedulerError::InvalidTransition {
                status: SchedulerStatus::Running,
                operation: "resume",
            })
        );

        let handle = scheduler.pause().expect("pause from running");
        handle.wait();
        assert_eq!(scheduler.status(), SchedulerStatus::Paused);

        // Pause of a paused scheduler is a completed no-op.
        let again = scheduler.pause().expect("pause when paused is a no-op");
        assert!(again.is_complete());

        scheduler.resume().expect("resume from paused");
        assert_eq!(scheduler.status(), SchedulerStatus::Running);

        scheduler.dispose();
        assert_eq!(scheduler.status(), SchedulerStatus::Disposed);
        // Everything on a disposed scheduler is a silent no-op.
        assert!(scheduler.pause().expect("pause after dispose").is_complete());
        scheduler.resume().expect("resume after dispose");
        physical.dispose();
    }

    #[test]
    fn child_of_disposed_scheduler_is_born_disposed() {
        let physical = pool();
        let scheduler = physical.create_scheduler();
        scheduler.dispose();

        let child = scheduler.create_child();
        assert_eq!(child.status(), SchedulerStatus::Disposed);
        // And it must absorb every operation without effect.
        child.dispose();
        child.recalculate_priority();
        assert!(child.pause().expect("no-op pause").is_complete());
        physical.dispose();
    }

    #[test]
    fn child_of_paused_scheduler_starts_paused() {
        let physical = pool();
        let scheduler = physical.create_scheduler();
        scheduler.pause().expect("pause").wait();

        let child = scheduler.create_child();
        assert_eq!(child.status(), SchedulerStatus::Paused);

        scheduler.resume().expect("resume");
        assert_eq!(child.status(), SchedulerStatus::Running);
        physical.dispose();
    }

    #[test]
    fn dispose_cascades_and_detaches() {
        let physical = pool();
        let parent = physical.create_scheduler();
        let child = parent.create_child();
        let grandchild = child.create_child();

        parent.dispose();
        assert_eq!(child.status(), SchedulerStatus::Disposed);
        assert_eq!(grandchild.status(), SchedulerStatus::Disposed);
        physical.dispose();
    }

    #[test]
    fn access_checks_reject_foreign_threads() {
        let physical = pool();
        let scheduler = physical.create_scheduler();
        assert!(!scheduler.check_access());
        assert_eq!(scheduler.verify_access(), Err(SchedulerError::AccessDenied));
        physical.dispose();
    }
}
