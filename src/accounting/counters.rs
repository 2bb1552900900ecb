//! Counter value types and accumulators.

use std::fmt;
use std::ops::{Add, Sub};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// A paired (thread-CPU time, wall-clock time) measurement.
///
/// `cpu` is thread CPU time in nanoseconds as reported by the platform probe
/// (zero when the probe is unavailable); `wall` is elapsed wall-clock time.
/// Addition and subtraction are defined pairwise over both fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Usage {
    /// Thread CPU time, nanoseconds.
    pub cpu: u64,
    /// Elapsed wall-clock time.
    pub wall: Duration,
}

impl Usage {
    /// The zero measurement.
    pub const ZERO: Self = Self {
        cpu: 0,
        wall: Duration::ZERO,
    };
}

impl Add for Usage {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            cpu: self.cpu.saturating_add(rhs.cpu),
            wall: self.wall.saturating_add(rhs.wall),
        }
    }
}

impl Sub for Usage {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self {
            cpu: self.cpu.saturating_sub(rhs.cpu),
            wall: self.wall.saturating_sub(rhs.wall),
        }
    }
}

impl fmt::Display for Usage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu={}ns wall={:?}", self.cpu, self.wall)
    }
}

/// A mutable [`Usage`] accumulator taking atomic adds from any thread.
#[derive(Debug, Default)]
pub(crate) struct UsageMeter {
    cpu: AtomicU64,
    wall_nanos: AtomicU64,
}

impl UsageMeter {
    /// Accumulates a measurement.
    pub(crate) fn add(&self, usage: Usage) {
        self.cpu.fetch_add(usage.cpu, Ordering::Relaxed);
        let wall = u64::try_from(usage.wall.as_nanos()).unwrap_or(u64::MAX);
        self.wall_nanos.fetch_add(wall, Ordering::Relaxed);
    }

    /// Reads the accumulated total.
    pub(crate) fn snapshot(&self) -> Usage {
        Usage {
            cpu: self.cpu.load(Ordering::Relaxed),
            wall: Duration::from_nanos(self.wall_nanos.load(Ordering::Relaxed)),
        }
    }
}

/// Aggregated per-scheduler counters.
///
/// `uptime` and `paused_time` are reported only for the top-level node of a
/// queried tree; a parent's pause subsumes its children's, so including them
/// for descendants would double-count when aggregating a subtree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SchedulerCounters {
    /// Wall-clock time since the scheduler was created. Top-level only.
    pub uptime: Duration,
    /// Cumulative time spent paused. Top-level only.
    pub paused_time: Duration,
    /// Time spent executing tasks on behalf of this scheduler.
    pub user: Usage,
    /// Time spent in scheduler infrastructure for this scheduler's items.
    pub kernel: Usage,
    /// Number of task `execute` invocations.
    pub task_executions: u64,
    /// Number of due-time promotions (timer ticks).
    pub timer_ticks: u64,
}

impl Add for SchedulerCounters {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            uptime: self.uptime.saturating_add(rhs.uptime),
            paused_time: self.paused_time.saturating_add(rhs.paused_time),
            user: self.user + rhs.user,
            kernel: self.kernel + rhs.kernel,
            task_executions: self.task_executions.saturating_add(rhs.task_executions),
            timer_ticks: self.timer_ticks.saturating_add(rhs.timer_ticks),
        }
    }
}

impl Sub for SchedulerCounters {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self {
            uptime: self.uptime.saturating_sub(rhs.uptime),
            paused_time: self.paused_time.saturating_sub(rhs.paused_time),
            user: self.user - rhs.user,
            kernel: self.kernel - rhs.kernel,
            task_executions: self.task_executions.saturating_sub(rhs.task_executions),
            timer_ticks: self.timer_ticks.saturating_sub(rhs.timer_ticks),
        }
    }
}

impl fmt::Display for SchedulerCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "uptime={:?} paused={:?} user=[{}] kernel=[{}] executions={} timer_ticks={}",
            self.uptime,
            self.paused_time,
            self.user,
            self.kernel,
            self.task_executions,
            self.timer_ticks
        )
    }
}

/// Per-node counter storage. All fields accept writes from any thread.
#[derive(Debug)]
pub(crate) struct CounterCell {
    created: Instant,
    paused_nanos: AtomicU64,
    user: UsageMeter,
    kernel: UsageMeter,
    executions: AtomicU64,
    timer_ticks: AtomicU64,
}

impl CounterCell {
    pub(crate) fn new() -> Self {
        Self {
            created: Instant::now(),
            paused_nanos: AtomicU64::new(0),
            user: UsageMeter::default(),
            kernel: UsageMeter::default(),
            executions: AtomicU64::new(0),
            timer_ticks: AtomicU64::new(0),
        }
    }

    pub(crate) fn user_meter(&self) -> &UsageMeter {
        &self.user
    }

    pub(crate) fn kernel_meter(&self) -> &UsageMeter {
        &self.kernel
    }

    pub(crate) fn add_paused(&self, elapsed: Duration) {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.paused_nanos.fetch_add(nanos, Ordering::Relaxed);
    }

    pub(crate) fn record_execution(&self) {
        self.executions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_timer_tick(&self) {
        self.timer_ticks.fetch_add(1, Ordering::Relaxed);
    }

    /// Reads a snapshot. `live_paused` covers an in-progress pause that has
    /// not been folded into the accumulator yet; both it and uptime are
    /// reported only when `top_level` is set.
    pub(crate) fn snapshot(&self, top_level: bool, live_paused: Duration) -> SchedulerCounters {
        let (uptime, paused_time) = if top_level {
            let accumulated = Duration::from_nanos(self.paused_nanos.load(Ordering::Relaxed));
            (self.created.elapsed(), accumulated.saturating_add(live_paused))
        } else {
            (Duration::ZERO, Duration::ZERO)
        };
        SchedulerCounters {
            uptime,
            paused_time,
            user: self.user.snapshot(),
            kernel: self.kernel.snapshot(),
            task_executions: self.executions.load(Ordering::Relaxed),
            timer_ticks: self.timer_ticks.load(Ordering::Relaxed),
        }
    }
}
