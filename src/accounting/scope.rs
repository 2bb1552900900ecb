//! Scoped measurement guards.
//!
//! Both guards sample thread CPU time and a wall-clock timestamp on entry
//! and charge the delta when the scope ends. They differ in dispatch:
//!
//! - [`TaskChargeScope`] resolves its destination through the [`Accountable`]
//!   capability and degrades to a no-op when the target does not support
//!   being charged.
//! - [`KernelChargeScope`] always charges a known concrete [`UsageMeter`].
//!   It is exercised on every scheduler infrastructure operation, so the
//!   destination is monomorphic and the path carries no indirect call.

use std::time::Instant;

use super::counters::{Usage, UsageMeter};
use super::cycles;
use crate::task::Accountable;

/// Charges elapsed usage to an [`Accountable`] target, if there is one.
pub(crate) struct TaskChargeScope<'a> {
    target: Option<&'a dyn Accountable>,
    start_cpu: u64,
    start: Instant,
}

impl<'a> TaskChargeScope<'a> {
    /// Enters the scope. With no target the entry samples are skipped
    /// entirely and the scope is free.
    pub(crate) fn enter(target: Option<&'a dyn Accountable>) -> Self {
        let (start_cpu, start) = match target {
            Some(_) => (cycles::thread_cpu_now(), Instant::now()),
            None => (0, Instant::now()),
        };
        Self {
            target,
            start_cpu,
            start,
        }
    }
}

impl Drop for TaskChargeScope<'_> {
    fn drop(&mut self) {
        if let Some(target) = self.target {
            let usage = Usage {
                cpu: cycles::thread_cpu_now().saturating_sub(self.start_cpu),
                wall: self.start.elapsed(),
            };
            target.charge_task_execution(usage);
        }
    }
}

/// Charges elapsed usage to a scheduler-infrastructure meter.
pub(crate) struct KernelChargeScope<'a> {
    meter: &'a UsageMeter,
    start_cpu: u64,
    start: Instant,
}

impl<'a> KernelChargeScope<'a> {
    /// Enters the scope.
    pub(crate) fn enter(meter: &'a UsageMeter) -> Self {
        Self {
            meter,
            start_cpu: cycles::thread_cpu_now(),
            start: Instant::now(),
        }
    }
}

impl Drop for KernelChargeScope<'_> {
    fn drop(&mut self) {
        self.meter.add(Usage {
            cpu: cycles::thread_cpu_now().saturating_sub(self.start_cpu),
            wall: self.start.elapsed(),
        });
    }
}
