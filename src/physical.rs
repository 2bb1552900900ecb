//! The physical scheduler: the fixed pool of OS worker threads.
//!
//! Owns N workers created at construction (N defaults to the available
//! processor count), places new work on the least-loaded worker starting
//! from a rotating cursor, and runs one low-frequency heartbeat thread that
//! periodically wakes every worker to guard against lost wakeups.
//!
//! Placement reads the per-worker load counts without synchronization. The
//! heuristic is approximate and racy on purpose: exactness is not required,
//! only avoidance of gross imbalance, and a lock here would serialize the
//! hot scheduling path.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Mutex, RwLock};

use crate::config::{ConfigError, SchedulerConfig};
use crate::error::TaskError;
use crate::logical::{LogicalScheduler, NodeState};
use crate::registry::{Arena, NodeId};
use crate::work_item::ItemRef;
use crate::worker::{Command, WakeEvent, WorkerCore, WorkerHandle};

/// Distinguishes pools so thread-affinity markers cannot be confused across
/// two schedulers in one process.
static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(0);

/// State shared between the public handles, the worker threads, and the
/// heartbeat. Immutable after construction except for the atomics, the node
/// registry, and the per-worker inboxes.
pub(crate) struct PoolShared {
    pool_id: u64,
    stop: AtomicBool,
    workers: Box<[WorkerHandle]>,
    cursor: AtomicUsize,
    nodes: RwLock<Arena<Arc<NodeState>>>,
    root_observers: Mutex<Vec<Arc<dyn Fn(&TaskError) + Send + Sync>>>,
    heartbeat_event: WakeEvent,
}

impl PoolShared {
    pub(crate) fn pool_id(&self) -> u64 {
        self.pool_id
    }

    pub(crate) fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub(crate) fn worker(&self, index: usize) -> &WorkerHandle {
        &self.workers[index]
    }

    pub(crate) fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub(crate) fn submit_to(&self, worker: usize, command: Command) {
        self.workers[worker].submit(command);
    }

    fn wake_all_workers(&self) {
        for worker in self.workers.iter() {
            worker.wake();
        }
    }

    /// Places a work item on the worker with the lowest observed load,
    /// scanning from a rotating cursor; ties go to the first candidate in
    /// rotation order. Best-effort: the load reads race with placement from
    /// other threads.
    pub(crate) fn place(&self, item: &ItemRef) {
        if self.is_stopping() {
            return;
        }
        let count = self.workers.len();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % count;
        let mut chosen = start;
        let mut lowest = usize::MAX;
        for offset in 0..count {
            let index = (start + offset) % count;
            let load = self.workers[index].active();
            if load < lowest {
                chosen = index;
                lowest = load;
            }
        }
        tracing::trace!(worker = chosen, load = lowest, "placing work item");
        self.workers[chosen].add_active();
        item.set_worker(chosen);
        self.workers[chosen].submit(Command::Add(item.clone()));
    }

    // --- node registry ---

    pub(crate) fn node(&self, id: NodeId) -> Option<Arc<NodeState>> {
        self.nodes.read().get(id).cloned()
    }

    pub(crate) fn insert_node(&self, node: Arc<NodeState>) -> NodeId {
        self.nodes.write().insert(node)
    }

    pub(crate) fn remove_node(&self, id: NodeId) {
        self.nodes.write().remove(id);
    }

    pub(crate) fn deregister_item(&self, item: &ItemRef) {
        if let Some(node) = self.node(item.owner()) {
            node.deregister(item);
        }
    }

    /// Escalates a task failure: local handlers first, then each ancestor,
    /// then the root unhandled-error observers. Returns whether anything
    /// observed it; unobserved failures terminate the faulting worker.
    pub(crate) fn escalate(&self, from: NodeId, error: &TaskError) -> bool {
        let mut current = Some(from);
        while let Some(id) = current {
            let Some(node) = self.node(id) else { break };
            if node.try_handle(error) {
                return true;
            }
            current = node.parent();
        }

        // Snapshot so an observer can register further observers without
        // deadlocking.
        let observers: Vec<_> = self.root_observers.lock().iter().cloned().collect();
        if observers.is_empty() {
            tracing::error!(%error, "task error reached the root unobserved");
            return false;
        }
        for observer in &observers {
            observer(error);
        }
        true
    }
}

/// The fixed pool of dedicated worker threads.
///
/// Dropping the scheduler disposes it if the embedder has not already done
/// so explicitly.
pub struct PhysicalScheduler {
    shared: Arc<PoolShared>,
    worker_threads: Mutex<Vec<JoinHandle<()>>>,
    heartbeat_thread: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl PhysicalScheduler {
    /// Creates a scheduler with the default configuration (one worker per
    /// available processor).
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default())
            .expect("default scheduler configuration is valid")
    }

    /// Creates a scheduler with an explicit configuration.
    pub fn with_config(config: SchedulerConfig) -> Result<Self, ConfigError> {
        config.validate()?;

        let workers: Box<[WorkerHandle]> = (0..config.worker_count)
            .map(|_| WorkerHandle::new())
            .collect();
        let shared = Arc::new(PoolShared {
            pool_id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            stop: AtomicBool::new(false),
            workers,
            cursor: AtomicUsize::new(0),
            nodes: RwLock::new(Arena::new()),
            root_observers: Mutex::new(Vec::new()),
            heartbeat_event: WakeEvent::new(),
        });

        let worker_threads = (0..config.worker_count)
            .map(|index| WorkerCore::spawn(index, Arc::clone(&shared)))
            .collect();

        let heartbeat_shared = Arc::clone(&shared);
        let period = config.heartbeat_period;
        let heartbeat_thread = std::thread::Builder::new()
            .name("cadenza-heartbeat".to_owned())
            .spawn(move || {
                while !heartbeat_shared.is_stopping() {
                    heartbeat_shared.heartbeat_event.wait_timeout(period);
                    if heartbeat_shared.is_stopping() {
                        break;
                    }
                    heartbeat_shared.wake_all_workers();
                }
            })
            .expect("failed to spawn heartbeat thread");

        tracing::debug!(workers = config.worker_count, "physical scheduler started");
        Ok(Self {
            shared,
            worker_threads: Mutex::new(worker_threads),
            heartbeat_thread: Mutex::new(Some(heartbeat_thread)),
            disposed: AtomicBool::new(false),
        })
    }

    /// Number of worker threads in the pool.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.shared.worker_count()
    }

    /// Approximate number of items currently held by each worker. Racy by
    /// nature; intended for diagnostics and tests.
    #[must_use]
    pub fn worker_loads(&self) -> Vec<usize> {
        self.shared
            .workers
            .iter()
            .map(WorkerHandle::active)
            .collect()
    }

    /// Creates a new root logical scheduler over this pool.
    #[must_use]
    pub fn create_scheduler(&self) -> LogicalScheduler {
        LogicalScheduler::new_root(Arc::clone(&self.shared))
    }

    /// Registers an observer for task errors that no logical scheduler
    /// handled. With at least one observer registered, such errors are
    /// considered observed and the faulting worker keeps running; with
    /// none, they terminate the worker thread.
    pub fn on_unhandled_error<F>(&self, observer: F)
    where
        F: Fn(&TaskError) + Send + Sync + 'static,
    {
        self.shared.root_observers.lock().push(Arc::new(observer));
    }

    /// Stops the heartbeat and every worker, then joins their threads.
    ///
    /// The heartbeat goes first: timer-driven wakeups must stop before the
    /// workers are joined so teardown cannot re-enter scheduling. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.stop.store(true, Ordering::Release);

        self.shared.heartbeat_event.set();
        if let Some(heartbeat) = self.heartbeat_thread.lock().take() {
            let _ = heartbeat.join();
        }

        self.shared.wake_all_workers();
        for thread in self.worker_threads.lock().drain(..) {
            let _ = thread.join();
        }
        tracing::debug!("physical scheduler disposed");
    }
}

impl Default for PhysicalScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PhysicalScheduler {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for PhysicalScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhysicalScheduler")
            .field("workers", &self.shared.worker_count())
            .field("nodes", &self.shared.nodes.read().len())
            .field("disposed", &self.disposed.load(Ordering::Relaxed))
            .finish()
    }
}
