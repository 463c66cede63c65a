//! Interval gate for log sites on hot paths
//!
//! ```ignore
//! if let Some(suppressed) = self.not_connected_log.check() {
//!     tracing::warn!(suppressed, "stream not connected, dropping frames");
//! }
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Lets at most one event through per interval and counts the rest
pub struct RateLimiter {
    origin: Instant,
    interval_us: u64,
    /// Microseconds since `origin` of the last admitted event, +1 so 0 means never
    last_us: AtomicU64,
    suppressed: AtomicU64,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            origin: Instant::now(),
            interval_us: interval.as_micros() as u64,
            last_us: AtomicU64::new(0),
            suppressed: AtomicU64::new(0),
        }
    }

    /// Returns `Some(n)` when the caller may log, where `n` is the number of
    /// events suppressed since the last admitted one.
    pub fn check(&self) -> Option<u64> {
        self.check_at(self.origin.elapsed().as_micros() as u64 + 1)
    }

    fn check_at(&self, now_us: u64) -> Option<u64> {
        let last = self.last_us.load(Ordering::Relaxed);
        let due = last == 0 || now_us.saturating_sub(last) >= self.interval_us;
        if due
            && self
                .last_us
                .compare_exchange(last, now_us, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            return Some(self.suppressed.swap(0, Ordering::Relaxed));
        }
        self.suppressed.fetch_add(1, Ordering::Relaxed);
        None
    }

    /// Forget history so the next event is admitted
    pub fn reset(&self) {
        self.last_us.store(0, Ordering::Relaxed);
        self.suppressed.store(0, Ordering::Relaxed);
    }
}
