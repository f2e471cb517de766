//! Time source injected into every component.
//!
//! Deadlines, lease expiry and escalation timeouts are all computed from a
//! [`Clock`] so tests can move time by hand instead of sleeping.

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::sync::Arc;

/// Source of the current time
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Current UTC time
    fn now(&self) -> DateTime<Utc>;
}

/// Shared, dynamically dispatched clock
pub type SharedClock = Arc<dyn Clock>;

/// `start + ms`, saturating at the latest representable instant
#[must_use]
pub fn after_ms(start: DateTime<Utc>, ms: u64) -> DateTime<Utc> {
    i64::try_from(ms)
        .ok()
        .and_then(Duration::try_milliseconds)
        .and_then(|d| start.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Milliseconds from `earlier` to `later`, zero when `later` is not after it
#[must_use]
pub fn elapsed_ms(earlier: DateTime<Utc>, later: DateTime<Utc>) -> u64 {
    u64::try_from((later - earlier).num_milliseconds()).unwrap_or(0)
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Shared wall clock
    #[inline]
    #[must_use]
    pub fn shared() -> SharedClock {
        Arc::new(Self)
    }
}

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Hand-driven clock
///
/// Clones share the same instant, so a test can hold one handle and give
/// another to the component under test.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    /// Create a clock frozen at `start`
    #[inline]
    #[must_use]
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    /// Move time forward
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }

    /// Move time forward by milliseconds
    #[inline]
    pub fn advance_ms(&self, ms: i64) {
        self.advance(Duration::milliseconds(ms));
    }

    /// Jump to an absolute instant
    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock() = to;
    }

    /// Shared handle to this clock
    #[inline]
    #[must_use]
    pub fn shared(&self) -> SharedClock {
        Arc::new(self.clone())
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for ManualClock {
    #[inline]
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn after_ms_saturates_instead_of_overflowing() {
        let now = Utc::now();
        assert_eq!(after_ms(now, 1_000) - now, Duration::seconds(1));
        assert_eq!(after_ms(now, u64::MAX), DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn elapsed_ms_never_goes_negative() {
        let now = Utc::now();
        let later = now + Duration::milliseconds(250);
        assert_eq!(elapsed_ms(now, later), 250);
        assert_eq!(elapsed_ms(later, now), 0);
    }

    #[test]
    fn manual_clock_clones_share_time() {
        let clock = ManualClock::default();
        let handle = clock.shared();
        let before = handle.now();

        clock.advance_ms(1_500);

        assert_eq!(handle.now() - before, Duration::milliseconds(1_500));
    }
}
