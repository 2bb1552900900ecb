//! Monotonic time for due-time bookkeeping.
//!
//! All deadlines inside the scheduler are expressed as [`Time`], a nanosecond
//! offset from a process-wide monotonic epoch. Using an offset instead of
//! [`Instant`] keeps the value `Copy`, totally ordered, and cheap to stash in
//! heap entries and atomics; the epoch is pinned on first use so conversions
//! are stable for the lifetime of the process.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

/// The process-wide monotonic epoch. Pinned lazily on first observation.
fn epoch() -> Instant {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    *EPOCH.get_or_init(Instant::now)
}

/// A monotonic timestamp in nanoseconds since the process epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Time(u64);

impl Time {
    /// The epoch itself.
    pub const ZERO: Self = Self(0);

    /// The far future; no due time ever reaches it.
    pub const MAX: Self = Self(u64::MAX);

    /// Creates a timestamp from raw nanoseconds since the epoch.
    #[inline]
    #[must_use]
    pub const fn from_nanos(nanos: u64) -> Self {
        Self(nanos)
    }

    /// Returns the raw nanosecond count.
    #[inline]
    #[must_use]
    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    /// Reads the current monotonic time.
    #[must_use]
    pub fn now() -> Self {
        let elapsed = epoch().elapsed();
        Self(u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX))
    }

    /// Adds a duration, saturating at [`Time::MAX`].
    #[inline]
    #[must_use]
    pub fn saturating_add(self, delta: Duration) -> Self {
        let nanos = u64::try_from(delta.as_nanos()).unwrap_or(u64::MAX);
        Self(self.0.saturating_add(nanos))
    }

    /// Returns the duration from `earlier` to `self`, or zero if `earlier`
    /// is in the future.
    #[inline]
    #[must_use]
    pub fn saturating_duration_since(self, earlier: Self) -> Duration {
        Duration::from_nanos(self.0.saturating_sub(earlier.0))
    }

    /// Returns true if this timestamp has already elapsed at `now`.
    #[inline]
    #[must_use]
    pub fn is_due(self, now: Self) -> bool {
        self <= now
    }
}

impl std::ops::Add<Duration> for Time {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self {
        self.saturating_add(rhs)
    }
}

impl std::fmt::Display for Time {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "+{:?}", Duration::from_nanos(self.0))
    }
}
