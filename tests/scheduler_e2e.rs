//! End-to-end scheduling behavior: ordering, due times, placement,
//! accounting, and error escalation.

mod common;

use cadenza::{
    LogicalScheduler, PhysicalScheduler, SchedulerConfig, SchedulerTask, TaskError,
};
use common::{init_test_logging, wait_until};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const WAIT: Duration = Duration::from_secs(5);

// ===========================================================================
// HELPERS
// ===========================================================================

fn single_worker() -> PhysicalScheduler {
    PhysicalScheduler::with_config(SchedulerConfig {
        worker_count: 1,
        ..SchedulerConfig::default()
    })
    .expect("config is valid")
}

/// Completes on first execution and records a tag into a shared log.
struct RecordingTask {
    priority: i64,
    tag: i64,
    log: Arc<Mutex<Vec<i64>>>,
}

impl SchedulerTask for RecordingTask {
    fn priority(&self) -> i64 {
        self.priority
    }

    fn execute(&mut self, _scheduler: &LogicalScheduler) -> Result<bool, TaskError> {
        self.log.lock().expect("log lock").push(self.tag);
        Ok(true)
    }
}

/// Spins until released, then completes. Used to hold worker load steady.
struct BlockingTask {
    release: Arc<AtomicBool>,
}

impl SchedulerTask for BlockingTask {
    fn priority(&self) -> i64 {
        0
    }

    fn execute(&mut self, _scheduler: &LogicalScheduler) -> Result<bool, TaskError> {
        while !self.release.load(Ordering::Acquire) {
            std::thread::sleep(Duration::from_millis(1));
        }
        Ok(true)
    }
}

/// Fails every execution.
struct FailingTask;

impl SchedulerTask for FailingTask {
    fn priority(&self) -> i64 {
        0
    }

    fn execute(&mut self, _scheduler: &LogicalScheduler) -> Result<bool, TaskError> {
        Err(TaskError::msg("synthetic failure"))
    }
}

fn log_contents(log: &Arc<Mutex<Vec<i64>>>) -> Vec<i64> {
    log.lock().expect("log lock").clone()
}

// ===========================================================================
// ORDERING
// ===========================================================================

#[test]
fn tasks_execute_in_priority_order_on_one_worker() {
    init_test_logging();
    let physical = single_worker();
    let scheduler = physical.create_scheduler();
    let log = Arc::new(Mutex::new(Vec::new()));

    // Pause first so all three are queued before any of them runs.
    scheduler.pause().expect("pause").wait();
    for priority in [3, 1, 2] {
        scheduler.schedule(RecordingTask {
            priority,
            tag: priority,
            log: Arc::clone(&log),
        });
    }
    scheduler.resume().expect("resume");

    assert!(wait_until(WAIT, || log_contents(&log).len() == 3));
    assert_eq!(log_contents(&log), vec![1, 2, 3]);
    physical.dispose();
}

#[test]
fn equal_priority_tasks_execute_in_schedule_order() {
    init_test_logging();
    let physical = single_worker();
    let scheduler = physical.create_scheduler();
    let log = Arc::new(Mutex::new(Vec::new()));
    let release = Arc::new(AtomicBool::new(false));

    // Hold the sole worker so the recording tasks queue up behind it in
    // submission order.
    scheduler.schedule(BlockingTask {
        release: Arc::clone(&release),
    });
    for tag in 0..5 {
        scheduler.schedule(RecordingTask {
            priority: 7,
            tag,
            log: Arc::clone(&log),
        });
    }
    release.store(true, Ordering::Release);

    assert!(wait_until(WAIT, || log_contents(&log).len() == 5));
    assert_eq!(
        log_contents(&log),
        vec![0, 1, 2, 3, 4],
        "equal priorities must run FIFO"
    );
    physical.dispose();
}

// ===========================================================================
// DUE TIMES
// ===========================================================================

#[test]
fn delayed_task_never_fires_early() {
    init_test_logging();
    let physical = single_worker();
    let scheduler = physical.create_scheduler();

    let observed = Arc::new(Mutex::new(None::<Duration>));
    let sink = Arc::clone(&observed);
    let start = Instant::now();

    struct StampTask {
        start: Instant,
        sink: Arc<Mutex<Option<Duration>>>,
    }

    impl SchedulerTask for StampTask {
        fn priority(&self) -> i64 {
            0
        }

        fn execute(&mut self, _scheduler: &LogicalScheduler) -> Result<bool, TaskError> {
            *self.sink.lock().expect("sink lock") = Some(self.start.elapsed());
            Ok(true)
        }
    }

    scheduler.schedule_after(Duration::from_millis(50), StampTask { start, sink });

    assert!(wait_until(WAIT, || observed
        .lock()
        .expect("sink lock")
        .is_some()));
    let elapsed = observed.lock().expect("sink lock").expect("task ran");
    assert!(
        elapsed >= Duration::from_millis(50),
        "fired early after {elapsed:?}"
    );
    assert!(elapsed < WAIT, "fired far too late: {elapsed:?}");
    physical.dispose();
}

#[test]
fn due_promotion_charges_a_timer_tick() {
    init_test_logging();
    let physical = single_worker();
    let scheduler = physical.create_scheduler();
    let log = Arc::new(Mutex::new(Vec::new()));

    // Long enough that the item reliably lands in the due-time queue first
    // and reaches the ready queue through a promotion.
    scheduler.schedule_after(
        Duration::from_millis(100),
        RecordingTask {
            priority: 0,
            tag: 0,
            log: Arc::clone(&log),
        },
    );

    assert!(wait_until(WAIT, || log_contents(&log).len() == 1));
    let counters = scheduler.counters(false);
    assert_eq!(counters.timer_ticks, 1);
    assert_eq!(counters.task_executions, 1);
    physical.dispose();
}

// ===========================================================================
// PLACEMENT
// ===========================================================================

#[test]
fn placement_balances_load_across_idle_workers() {
    init_test_logging();
    let physical = PhysicalScheduler::with_config(SchedulerConfig {
        worker_count: 4,
        ..SchedulerConfig::default()
    })
    .expect("config is valid");
    let scheduler = physical.create_scheduler();
    let release = Arc::new(AtomicBool::new(false));

    for _ in 0..8 {
        scheduler.schedule(BlockingTask {
            release: Arc::clone(&release),
        });
    }

    let loads = physical.worker_loads();
    let max = loads.iter().copied().max().unwrap_or(0);
    let min = loads.iter().copied().min().unwrap_or(0);
    assert_eq!(loads.iter().sum::<usize>(), 8);
    assert!(max - min <= 1, "unbalanced placement: {loads:?}");

    release.store(true, Ordering::Release);
    assert!(wait_until(WAIT, || physical
        .worker_loads()
        .iter()
        .sum::<usize>()
        == 0));
    physical.dispose();
}

// ===========================================================================
// ACCOUNTING
// ===========================================================================

#[test]
fn executions_are_counted_per_scheduler_subtree() {
    init_test_logging();
    let physical = single_worker();
    let parent = physical.create_scheduler();
    let child = parent.create_child();
    let log = Arc::new(Mutex::new(Vec::new()));

    for tag in 0..2 {
        parent.schedule(RecordingTask {
            priority: 0,
            tag,
            log: Arc::clone(&log),
        });
    }
    child.schedule(RecordingTask {
        priority: 0,
        tag: 2,
        log: Arc::clone(&log),
    });

    assert!(wait_until(WAIT, || log_contents(&log).len() == 3));
    assert!(wait_until(WAIT, || parent.counters(false).task_executions == 2));
    assert!(wait_until(WAIT, || parent.counters(true).task_executions == 3));
    assert_eq!(child.counters(false).task_executions, 1);
    physical.dispose();
}

#[test]
fn pause_duration_is_reported_for_the_top_level_node() {
    init_test_logging();
    let physical = single_worker();
    let scheduler = physical.create_scheduler();

    scheduler.pause().expect("pause").wait();
    std::thread::sleep(Duration::from_millis(30));
    // Still paused: the live interval must already show up.
    assert!(scheduler.counters(false).paused_time >= Duration::from_millis(20));

    scheduler.resume().expect("resume");
    let settled = scheduler.counters(false).paused_time;
    assert!(settled >= Duration::from_millis(20));
    physical.dispose();
}

// ===========================================================================
// THREAD AFFINITY
// ===========================================================================

#[test]
fn tasks_observe_worker_thread_access() {
    init_test_logging();
    let physical = single_worker();
    let scheduler = physical.create_scheduler();
    let verdict = Arc::new(AtomicUsize::new(0));

    struct AccessProbe {
        verdict: Arc<AtomicUsize>,
    }

    impl SchedulerTask for AccessProbe {
        fn priority(&self) -> i64 {
            0
        }

        fn execute(&mut self, scheduler: &LogicalScheduler) -> Result<bool, TaskError> {
            let ok = scheduler.check_access() && scheduler.verify_access().is_ok();
            self.verdict.store(if ok { 1 } else { 2 }, Ordering::SeqCst);
            Ok(true)
        }
    }

    assert!(!scheduler.check_access(), "test thread is not a worker");
    scheduler.schedule(AccessProbe {
        verdict: Arc::clone(&verdict),
    });
    assert!(wait_until(WAIT, || verdict.load(Ordering::SeqCst) != 0));
    assert_eq!(verdict.load(Ordering::SeqCst), 1);
    physical.dispose();
}

// ===========================================================================
// RUNNABILITY
// ===========================================================================

#[test]
fn recalculation_revives_a_non_runnable_task() {
    init_test_logging();
    let physical = single_worker();
    let scheduler = physical.create_scheduler();
    let runnable = Arc::new(AtomicBool::new(false));
    let executed = Arc::new(AtomicUsize::new(0));

    struct GatedTask {
        runnable: Arc<AtomicBool>,
        executed: Arc<AtomicUsize>,
    }

    impl SchedulerTask for GatedTask {
        fn priority(&self) -> i64 {
            0
        }

        fn is_runnable(&self) -> bool {
            self.runnable.load(Ordering::Acquire)
        }

        fn execute(&mut self, _scheduler: &LogicalScheduler) -> Result<bool, TaskError> {
            self.executed.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }
    }

    scheduler.schedule(GatedTask {
        runnable: Arc::clone(&runnable),
        executed: Arc::clone(&executed),
    });

    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(
        executed.load(Ordering::SeqCst),
        0,
        "non-runnable task must stay parked"
    );

    runnable.store(true, Ordering::Release);
    scheduler.recalculate_priority();
    assert!(wait_until(WAIT, || executed.load(Ordering::SeqCst) == 1));
    physical.dispose();
}

// ===========================================================================
// ERROR ESCALATION
// ===========================================================================

#[test]
fn handled_error_keeps_the_worker_alive() {
    init_test_logging();
    let physical = single_worker();
    let scheduler = physical.create_scheduler();
    let handled = Arc::new(AtomicUsize::new(0));
    let log = Arc::new(Mutex::new(Vec::new()));

    let seen = Arc::clone(&handled);
    scheduler.add_error_handler(move |_error: &TaskError| {
        seen.fetch_add(1, Ordering::SeqCst);
        true
    });

    scheduler.schedule(FailingTask);
    assert!(wait_until(WAIT, || handled.load(Ordering::SeqCst) == 1));

    // The worker must still be executing work afterwards.
    scheduler.schedule(RecordingTask {
        priority: 0,
        tag: 1,
        log: Arc::clone(&log),
    });
    assert!(wait_until(WAIT, || log_contents(&log) == vec![1]));
    physical.dispose();
}

#[test]
fn unhandled_child_error_escalates_to_the_parent() {
    init_test_logging();
    let physical = single_worker();
    let parent = physical.create_scheduler();
    let child = parent.create_child();
    let parent_saw = Arc::new(AtomicUsize::new(0));

    let seen = Arc::clone(&parent_saw);
    parent.add_error_handler(move |_error: &TaskError| {
        seen.fetch_add(1, Ordering::SeqCst);
        true
    });

    child.schedule(FailingTask);
    assert!(wait_until(WAIT, || parent_saw.load(Ordering::SeqCst) == 1));
    physical.dispose();
}

#[test]
fn root_observer_sees_errors_no_scheduler_handled() {
    init_test_logging();
    let physical = single_worker();
    let scheduler = physical.create_scheduler();
    let observed = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::new(Mutex::new(Vec::new()));

    let sink = Arc::clone(&observed);
    physical.on_unhandled_error(move |error| {
        sink.lock().expect("sink lock").push(error.to_string());
    });

    scheduler.schedule(FailingTask);
    assert!(wait_until(WAIT, || !observed
        .lock()
        .expect("sink lock")
        .is_empty()));
    assert_eq!(
        observed.lock().expect("sink lock").as_slice(),
        ["synthetic failure"]
    );

    // Observed errors do not kill the worker.
    scheduler.schedule(RecordingTask {
        priority: 0,
        tag: 9,
        log: Arc::clone(&log),
    });
    assert!(wait_until(WAIT, || log_contents(&log) == vec![9]));
    physical.dispose();
}

#[test]
fn unobserved_error_terminates_the_worker() {
    init_test_logging();
    let physical = single_worker();
    let scheduler = physical.create_scheduler();
    let executed = Arc::new(AtomicUsize::new(0));

    // No handlers and no root observer: the failure must kill the worker
    // thread rather than let it resume with unknown invariants.
    scheduler.schedule(FailingTask);
    std::thread::sleep(Duration::from_millis(100));

    struct CountingTask {
        executed: Arc<AtomicUsize>,
    }

    impl SchedulerTask for CountingTask {
        fn priority(&self) -> i64 {
            0
        }

        fn execute(&mut self, _scheduler: &LogicalScheduler) -> Result<bool, TaskError> {
            self.executed.fetch_add(1, Ordering::SeqCst);
            Ok(true)
        }
    }

    scheduler.schedule(CountingTask {
        executed: Arc::clone(&executed),
    });
    std::thread::sleep(Duration::from_millis(150));
    assert_eq!(
        executed.load(Ordering::SeqCst),
        0,
        "the sole worker should be dead after an unobserved failure"
    );
    physical.dispose();
}
