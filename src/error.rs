//! Error types for the scheduler.
//!
//! Errors are explicit and typed (no stringly-typed errors). Two families
//! exist:
//!
//! - [`SchedulerError`]: invalid use of the scheduler API, reported
//!   synchronously to the caller.
//! - [`TaskError`]: a failure surfaced by a task's `execute`, carried along
//!   the exception-escalation chain. Cheaply cloneable so every handler in
//!   the chain can observe the same failure.
//!
//! Benign races (dispose vs. concurrent schedule or child creation) are not
//! errors at all; they resolve silently by discarding the request.

use std::error::Error;
use std::fmt;
use std::sync::Arc;

use crate::logical::SchedulerStatus;

/// Invalid use of the scheduler API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    /// The requested transition is not valid in the scheduler's current
    /// status (e.g. pausing a scheduler that is already pausing, or resuming
    /// one that is running).
    #[error("cannot {operation} a scheduler that is {status}")]
    InvalidTransition {
        /// Status observed when the operation was rejected.
        status: SchedulerStatus,
        /// The rejected operation.
        operation: &'static str,
    },

    /// The calling thread is not a worker thread of this scheduler.
    #[error("calling thread does not have access to the scheduler")]
    AccessDenied,
}

/// A failure produced by a task's `execute`.
///
/// Wraps the source error in an [`Arc`] so the same failure can be offered
/// to every handler in the escalation chain without cloning the payload.
#[derive(Debug, Clone)]
pub struct TaskError {
    inner: Arc<dyn Error + Send + Sync + 'static>,
}

impl TaskError {
    /// Wraps an arbitrary error.
    pub fn new<E>(source: E) -> Self
    where
        E: Error + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(source),
        }
    }

    /// Creates an error from a plain message.
    #[must_use]
    pub fn msg(message: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(MessageError(message.into())),
        }
    }

    /// Borrows the wrapped source error.
    #[must_use]
    pub fn get_ref(&self) -> &(dyn Error + Send + Sync + 'static) {
        &*self.inner
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

impl Error for TaskError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(&*self.inner as &(dyn Error + 'static))
    }
}

#[derive(Debug)]
struct MessageError(String);

impl fmt::Display for MessageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Error for MessageError {}
