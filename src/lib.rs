//! Cadenza: a cooperative task scheduler for reactive event-processing
//! runtimes.
//!
//! The crate multiplexes large numbers of lightweight, prioritized, possibly
//! time-deferred units of work onto a small fixed pool of dedicated worker
//! threads:
//!
//! - **Fixed pool**: a [`PhysicalScheduler`] owns N worker threads created
//!   at construction; the pool never grows.
//! - **Logical tree**: [`LogicalScheduler`] handles form a tree over one
//!   shared pool, each providing isolated pause/continue and exception
//!   scoping. Pausing a node quiesces its whole subtree, which is what an
//!   upstream engine needs to checkpoint safely.
//! - **Cooperative only**: running work is never preempted. Long-running
//!   tasks implement [`YieldableTask`] and poll a [`YieldToken`] to observe
//!   pause requests.
//! - **Single-writer queues**: each worker's queues are mutated only on its
//!   own thread; cross-thread requests travel through a double-buffered
//!   command inbox.
//! - **Accounting**: CPU and wall-clock time are attributed per task and
//!   per scheduler subtree, split into user and infrastructure shares.
//!
//! # Example
//!
//! ```
//! use cadenza::{LogicalScheduler, PhysicalScheduler, SchedulerTask, TaskError};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! struct Tick(Arc<AtomicUsize>);
//!
//! impl SchedulerTask for Tick {
//!     fn priority(&self) -> i64 {
//!         0
//!     }
//!
//!     fn execute(&mut self, _scheduler: &LogicalScheduler) -> Result<bool, TaskError> {
//!         self.0.fetch_add(1, Ordering::SeqCst);
//!         Ok(true)
//!     }
//! }
//!
//! let physical = PhysicalScheduler::new();
//! let scheduler = physical.create_scheduler();
//! let ticks = Arc::new(AtomicUsize::new(0));
//! scheduler.schedule(Tick(Arc::clone(&ticks)));
//! # while ticks.load(Ordering::SeqCst) == 0 {
//! #     std::thread::sleep(std::time::Duration::from_millis(5));
//! # }
//! physical.dispose();
//! assert_eq!(ticks.load(Ordering::SeqCst), 1);
//! ```

#![warn(missing_docs)]

pub mod accounting;
pub mod config;
pub mod error;
pub mod heap;
pub mod logical;
pub mod physical;
pub mod task;
pub mod time;

mod registry;
mod util;
mod work_item;
mod worker;

pub use accounting::{SchedulerCounters, Usage};
pub use config::{ConfigError, SchedulerConfig};
pub use error::{SchedulerError, TaskError};
pub use heap::{Compare, PriorityQueue, QueueEmpty};
pub use logical::{LogicalScheduler, PauseHandle, SchedulerStatus};
pub use physical::PhysicalScheduler;
pub use task::{Accountable, ErrorHandler, SchedulerTask, YieldToken, YieldableTask};
pub use time::Time;
