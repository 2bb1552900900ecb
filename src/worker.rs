//! Workers: one dedicated OS thread per worker, each owning its queues.
//!
//! Only the worker's own thread ever mutates its ready, not-ready, and
//! due-time collections. Every cross-thread request (add, remove,
//! recalculate) arrives as a [`Command`] in the worker's [`Inbox`] and is
//! applied at the start of the next loop iteration. The inbox drain is a
//! double-buffer swap under one short lock, so a full backlog is consumed
//! without per-command locking.
//!
//! A worker blocks on its auto-reset [`WakeEvent`] only when it has drained
//! all commands and promotions and the ready queue is empty. Producers (new
//! commands, the heartbeat) signal the event; the due-time queue's earliest
//! deadline bounds the wait through the [`RearmableTimer`].

use std::cell::Cell;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use smallvec::SmallVec;

use crate::accounting::KernelChargeScope;
use crate::heap::PriorityQueue;
use crate::logical::{LogicalScheduler, PauseGate};
use crate::physical::PoolShared;
use crate::time::Time;
use crate::work_item::{ByDueTime, ByPriority, ItemRef};

thread_local! {
    /// (pool id, worker index) of the worker owning the current thread.
    /// Set once at worker-thread startup.
    static ACTIVE_WORKER: Cell<Option<(u64, usize)>> = const { Cell::new(None) };
}

/// Returns the pool/worker marker for the calling thread, if it is a worker
/// thread.
pub(crate) fn current_worker() -> Option<(u64, usize)> {
    ACTIVE_WORKER.with(Cell::get)
}

/// A scheduling mutation submitted from an arbitrary thread.
pub(crate) enum Command {
    /// Place a work item on this worker.
    Add(ItemRef),
    /// Remove a queued item (cancellation or dispose). Running items are
    /// never interrupted; removal of an executing item takes effect when it
    /// next returns to the queues.
    Remove(ItemRef),
    /// Re-derive priorities for the given items and reposition them. When a
    /// gate is attached, confirm through it that this worker has applied the
    /// request (and is therefore not executing any of the items).
    Recalculate {
        items: SmallVec<[ItemRef; 4]>,
        gate: Option<Arc<PauseGate>>,
    },
}

/// Double-buffered command queue.
///
/// `submit` appends under the lock; `drain_into` swaps the whole backlog out
/// under the same lock, so the worker consumes everything submitted since
/// the previous iteration with a single critical section.
pub(crate) struct Inbox {
    pending: parking_lot::Mutex<Vec<Command>>,
    has_pending: AtomicBool,
}

impl Inbox {
    fn new() -> Self {
        Self {
            pending: parking_lot::Mutex::new(Vec::new()),
            has_pending: AtomicBool::new(false),
        }
    }

    pub(crate) fn submit(&self, command: Command) {
        let mut pending = self.pending.lock();
        pending.push(command);
        self.has_pending.store(true, Ordering::Release);
    }

    /// Cheap signal for the worker to cut an execution burst short.
    pub(crate) fn has_pending(&self) -> bool {
        self.has_pending.load(Ordering::Acquire)
    }

    /// Swaps the backlog into `buffer` (which must be empty).
    fn drain_into(&self, buffer: &mut Vec<Command>) {
        debug_assert!(buffer.is_empty());
        if !self.has_pending.swap(false, Ordering::AcqRel) {
            return;
        }
        let mut pending = self.pending.lock();
        std::mem::swap(&mut *pending, buffer);
    }
}

/// An auto-reset event for suspending an idle worker.
///
/// `set` leaves a sticky signal; `wait` consumes it or blocks until it
/// arrives. The fast path on `set` skips the mutex and condvar entirely when
/// the signal is already up or nobody is waiting.
#[derive(Clone)]
pub(crate) struct WakeEvent {
    inner: Arc<EventInner>,
}

struct EventInner {
    signaled: AtomicBool,
    waiting: AtomicUsize,
    lock: Mutex<()>,
    cvar: Condvar,
}

impl WakeEvent {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(EventInner {
                signaled: AtomicBool::new(false),
                waiting: AtomicUsize::new(0),
                lock: Mutex::new(()),
                cvar: Condvar::new(),
            }),
        }
    }

    fn lock_unpoisoned(&self) -> MutexGuard<'_, ()> {
        self.inner
            .lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn try_consume(&self) -> bool {
        self.inner
            .signaled
            .compare_exchange(true, false, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Blocks until signaled, consuming the signal.
    pub(crate) fn wait(&self) {
        if self.try_consume() {
            return;
        }
        self.inner.waiting.fetch_add(1, Ordering::SeqCst);
        let mut guard = self.lock_unpoisoned();
        while !self.try_consume() {
            guard = self
                .inner
                .cvar
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
        }
        self.inner.waiting.fetch_sub(1, Ordering::SeqCst);
        drop(guard);
    }

    /// Blocks until signaled or `timeout` elapses. The signal, if consumed,
    /// is reset either way.
    pub(crate) fn wait_timeout(&self, timeout: Duration) {
        if self.try_consume() || timeout.is_zero() {
            return;
        }
        self.inner.waiting.fetch_add(1, Ordering::SeqCst);
        let (guard, _timed_out) = self
            .inner
            .cvar
            .wait_timeout_while(self.lock_unpoisoned(), timeout, |()| !self.try_consume())
            .unwrap_or_else(PoisonError::into_inner);
        self.inner.waiting.fetch_sub(1, Ordering::SeqCst);
        drop(guard);
    }

    /// Raises the signal, waking one waiter if there is one.
    pub(crate) fn set(&self) {
        if self
            .inner
            .signaled
            .compare_exchange(false, true, Ordering::Release, Ordering::Relaxed)
            .is_err()
        {
            // Already signaled; the next wait consumes it.
            return;
        }
        if self.inner.waiting.load(Ordering::SeqCst) == 0 {
            return;
        }
        // Take the mutex before notifying to close the window between a
        // waiter's failed consume and its condvar wait.
        let _guard = self.lock_unpoisoned();
        self.inner.cvar.notify_one();
    }
}

/// A single-shot timer tracking the earliest pending due time.
///
/// The worker realizes the timer as the bound on its event wait. The
/// requested delay is normalized into the representable range: deadlines in
/// the past clamp to zero, and deadlines beyond [`RearmableTimer::MAX_DELAY`]
/// clamp to that maximum and are re-evaluated on the next tick rather than
/// fired early.
#[derive(Debug, Default)]
pub(crate) struct RearmableTimer {
    next_fire: Option<Time>,
}

impl RearmableTimer {
    /// Upper bound on one timed wait.
    const MAX_DELAY: Duration = Duration::from_secs(60);

    /// Arms the timer for `due` unless an earlier deadline is already set.
    fn arm_earliest(&mut self, due: Time) {
        self.next_fire = Some(match self.next_fire {
            Some(existing) if existing <= due => existing,
            _ => due,
        });
    }

    /// Rearms to exactly `next` (the due-time queue head after a promotion
    /// pass), or disarms when the queue is empty.
    fn rearm(&mut self, next: Option<Time>) {
        self.next_fire = next;
    }

    /// The wait budget until the next fire, normalized; `None` when
    /// disarmed.
    fn wait_budget(&self, now: Time) -> Option<Duration> {
        self.next_fire
            .map(|due| due.saturating_duration_since(now).min(Self::MAX_DELAY))
    }
}

/// The cross-thread face of a worker: its command inbox, wake event, and
/// approximate active-item count used by placement.
pub(crate) struct WorkerHandle {
    inbox: Inbox,
    event: WakeEvent,
    active: AtomicUsize,
}

impl WorkerHandle {
    pub(crate) fn new() -> Self {
        Self {
            inbox: Inbox::new(),
            event: WakeEvent::new(),
            active: AtomicUsize::new(0),
        }
    }

    pub(crate) fn submit(&self, command: Command) {
        self.inbox.submit(command);
        self.event.set();
    }

    pub(crate) fn wake(&self) {
        self.event.set();
    }

    /// Best-effort load reading; placement tolerates staleness.
    pub(crate) fn active(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub(crate) fn add_active(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn sub_active(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Thread-local state of one worker: the queues and the loop.
pub(crate) struct WorkerCore {
    index: usize,
    shared: Arc<PoolShared>,
    ready: PriorityQueue<ItemRef, ByPriority>,
    not_ready: HashSet<ItemRef>,
    due: PriorityQueue<ItemRef, ByDueTime>,
    timer: RearmableTimer,
    backlog: Vec<Command>,
}

impl WorkerCore {
    /// Spawns the worker's dedicated thread.
    pub(crate) fn spawn(index: usize, shared: Arc<PoolShared>) -> std::thread::JoinHandle<()> {
        std::thread::Builder::new()
            .name(format!("cadenza-worker-{index}"))
            .spawn(move || {
                ACTIVE_WORKER.with(|marker| marker.set(Some((shared.pool_id(), index))));
                let mut core = WorkerCore {
                    index,
                    shared,
                    ready: PriorityQueue::new(ByPriority),
                    not_ready: HashSet::new(),
                    due: PriorityQueue::new(ByDueTime),
                    timer: RearmableTimer::default(),
                    backlog: Vec::new(),
                };
                core.run();
            })
            .expect("failed to spawn worker thread")
    }

    fn handle(&self) -> &WorkerHandle {
        self.shared.worker(self.index)
    }

    fn run(&mut self) {
        tracing::trace!(worker = self.index, "worker loop started");
        while !self.shared.is_stopping() {
            self.drain_commands();
            self.promote_due();

            let mut executed = false;
            loop {
                if self.shared.is_stopping() {
                    break;
                }
                // Cut the burst short once new commands arrive so pause and
                // cancellation requests are applied promptly.
                if self.handle().inbox.has_pending() {
                    break;
                }
                let Ok(item) = self.ready.dequeue() else {
                    break;
                };
                self.run_item(item);
                executed = true;
            }

            if executed || self.handle().inbox.has_pending() {
                continue;
            }
            if self.shared.is_stopping() {
                break;
            }

            match self.timer.wait_budget(Time::now()) {
                Some(budget) => self.handle().event.wait_timeout(budget),
                None => self.handle().event.wait(),
            }
        }
        self.teardown();
        tracing::trace!(worker = self.index, "worker loop stopped");
    }

    fn drain_commands(&mut self) {
        let mut backlog = std::mem::take(&mut self.backlog);
        self.handle().inbox.drain_into(&mut backlog);
        for command in backlog.drain(..) {
            self.apply(command);
        }
        self.backlog = backlog;
    }

    fn apply(&mut self, command: Command) {
        match command {
            Command::Add(item) => {
                let counters = item.counters_arc();
                let _kernel = KernelChargeScope::enter(counters.kernel_meter());
                self.route_incoming(item);
            }
            Command::Remove(item) => {
                let _kernel = KernelChargeScope::enter(item.counters().kernel_meter());
                if self.discard(&item) {
                    self.release(&item);
                }
                // A miss means the item completed, migrated, or is mid-
                // execution right now; in the last case its cancelled flag
                // makes the post-execution routing drop it.
            }
            Command::Recalculate { items, gate } => {
                for item in items {
                    self.recalculate(&item);
                }
                if let Some(gate) = gate {
                    // This worker has applied the request, so none of the
                    // items can be mid-execution here anymore.
                    gate.confirm_worker(&self.shared);
                }
            }
        }
    }

    /// Releases this worker's claim on an item that is leaving it.
    fn release(&self, item: &ItemRef) {
        item.clear_worker();
        self.handle().sub_active();
    }

    /// Places a newly added item into the correct collection.
    fn route_incoming(&mut self, item: ItemRef) {
        if item.is_cancelled() {
            self.release(&item);
        } else if item.due() > Time::now() {
            self.timer.arm_earliest(item.due());
            self.due.enqueue(item);
        } else if item.is_paused() || !item.is_runnable() {
            self.not_ready.insert(item);
        } else {
            self.ready.enqueue(item);
        }
    }

    /// Removes `item` from whichever collection holds it.
    fn discard(&mut self, item: &ItemRef) -> bool {
        if self.ready.remove(item) || self.not_ready.remove(item) {
            return true;
        }
        if self.due.remove(item) {
            self.timer.rearm(self.due.peek().ok().map(|head| head.due()));
            return true;
        }
        false
    }

    /// Applies a priority-recalculation request to one item.
    fn recalculate(&mut self, item: &ItemRef) {
        let _kernel = KernelChargeScope::enter(item.counters().kernel_meter());
        if self.ready.remove(item) {
            item.recalculate();
            if item.is_paused() || !item.is_runnable() {
                self.not_ready.insert(item.clone());
            } else {
                self.ready.enqueue(item.clone());
            }
        } else if self.not_ready.contains(item) {
            item.recalculate();
            if !item.is_paused() && item.is_runnable() {
                self.not_ready.remove(item);
                self.ready.enqueue(item.clone());
            }
        } else if self.due.remove(item) {
            // Due time is the primary key and cannot change, but the
            // priority tie-break can; re-enqueue to keep the heap honest.
            item.recalculate();
            self.due.enqueue(item.clone());
        }
        // Items that completed or migrated since the request was submitted
        // are skipped.
    }

    /// Moves elapsed due-time items into the ready queue, charging a timer
    /// tick to each item's owner.
    fn promote_due(&mut self) {
        let now = Time::now();
        loop {
            match self.due.peek() {
                Ok(head) if head.due().is_due(now) => {}
                _ => break,
            }
            let item = self.due.dequeue().expect("peeked head must dequeue");
            let counters = item.counters_arc();
            let _kernel = KernelChargeScope::enter(counters.kernel_meter());
            counters.record_timer_tick();
            if item.is_cancelled() {
                self.release(&item);
            } else if item.is_paused() || !item.is_runnable() {
                self.not_ready.insert(item);
            } else {
                self.ready.enqueue(item);
            }
        }
        self.timer.rearm(self.due.peek().ok().map(|head| head.due()));
    }

    /// Executes one ready item and routes it afterwards.
    fn run_item(&mut self, item: ItemRef) {
        // Cancellation and the pause flag may have been raised while the
        // item sat in the ready queue; check at dequeue time, before any
        // execution.
        if item.is_cancelled() {
            self.release(&item);
            return;
        }
        if item.is_paused() || !item.is_runnable() {
            self.not_ready.insert(item);
            return;
        }

        let scheduler = LogicalScheduler::from_parts(Arc::clone(&self.shared), item.owner());
        match item.invoke(&scheduler) {
            Ok(true) => self.retire(item),
            Ok(false) => {
                item.recalculate();
                if item.is_cancelled() {
                    self.release(&item);
                } else if item.is_paused() || !item.is_runnable() {
                    self.not_ready.insert(item);
                } else {
                    // Reschedule through the physical scheduler; affinity
                    // may change under current load.
                    self.release(&item);
                    self.shared.place(&item);
                }
            }
            Err(error) => {
                if self.shared.escalate(item.owner(), &error) {
                    self.retire(item);
                } else {
                    // A task that failed with nobody observing left its
                    // invariants in an unknown state; this worker must not
                    // resume.
                    tracing::error!(worker = self.index, %error, "unhandled task error");
                    panic!("unhandled task error on worker {}: {error}", self.index);
                }
            }
        }
    }

    /// Completion hook: deregisters the item from its owning scheduler and
    /// releases this worker's claim on it.
    fn retire(&mut self, item: ItemRef) {
        self.release(&item);
        self.shared.deregister_item(&item);
    }

    fn teardown(&mut self) {
        let mut remaining = self.ready.drain_unordered();
        remaining.extend(self.due.drain_unordered());
        remaining.extend(self.not_ready.drain());
        let handle = self.handle();
        for item in remaining {
            item.clear_worker();
            handle.sub_active();
        }
    }
}
