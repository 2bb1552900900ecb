//! CPU and wall-clock accounting.
//!
//! Execution time is attributed along two axes: to the logical scheduler
//! owning a work item, and (when the task opts in) to the task itself. All
//! accumulators take atomic adds from any thread; readers get value-type
//! snapshots that support pairwise addition and subtraction, which is what
//! makes child-exclusive vs. subtree-inclusive views derivable.

pub(crate) mod counters;
pub(crate) mod cycles;
pub(crate) mod scope;

pub use counters::{SchedulerCounters, Usage};
pub(crate) use counters::CounterCell;
pub(crate) use scope::{KernelChargeScope, TaskChargeScope};
