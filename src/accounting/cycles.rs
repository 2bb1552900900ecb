//! Thread CPU-time sampling.
//!
//! The platform query may be unavailable (unsupported clock, exotic
//! sandboxes). The first failure permanently disables further attempts via a
//! one-shot flag and all subsequent samples read as zero; wall-clock
//! accounting is unaffected.

use std::sync::atomic::{AtomicBool, Ordering};

static UNAVAILABLE: AtomicBool = AtomicBool::new(false);

/// Returns the calling thread's consumed CPU time in nanoseconds, or zero
/// when the platform clock is (or has become) unavailable.
#[must_use]
pub(crate) fn thread_cpu_now() -> u64 {
    if UNAVAILABLE.load(Ordering::Relaxed) {
        return 0;
    }
    match sample() {
        Some(nanos) => nanos,
        None => {
            // One-shot disable; never retried.
            UNAVAILABLE.store(true, Ordering::Relaxed);
            0
        }
    }
}

#[cfg(unix)]
fn sample() -> Option<u64> {
    use nix::time::{clock_gettime, ClockId};

    let ts = clock_gettime(ClockId::CLOCK_THREAD_CPUTIME_ID).ok()?;
    let secs = u64::try_from(ts.tv_sec()).ok()?;
    let nanos = u64::try_from(ts.tv_nsec()).ok()?;
    secs.checked_mul(1_000_000_000)?.checked_add(nanos)
}

#[cfg(not(unix))]
fn sample() -> Option<u64> {
    None
}
