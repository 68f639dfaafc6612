//! Wall-clock source and relative-time conversion.
//!
//! Sample times are stored as `f64` seconds relative to the recording's start
//! time. [`RelativeClock`] converts between that representation and absolute
//! UTC timestamps; [`Clock`] abstracts "now" so live chunk finalization can be
//! driven deterministically in tests.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
///
/// # Examples
///
/// ```
/// # use slice_recorder::clock::{Clock, ManualClock};
/// # use chrono::{TimeZone, Utc};
/// let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
/// clock.advance_secs(2.5);
/// assert_eq!(clock.now().timestamp_millis(), 1_704_067_202_500);
/// ```
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(start) }
    }

    pub fn shared(start: DateTime<Utc>) -> Arc<Self> {
        Arc::new(Self::new(start))
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock() = now;
    }

    pub fn advance_secs(&self, secs: f64) {
        let mut now = self.now.lock();
        *now += seconds(secs);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

/// Converts between absolute timestamps and offsets from a base time.
///
/// # Examples
///
/// ```
/// # use slice_recorder::clock::RelativeClock;
/// # use chrono::{TimeZone, Utc};
/// let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
/// let rel = RelativeClock::new(base);
/// let later = rel.absolute(90.25);
/// assert_eq!(rel.offset(later), 90.25);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelativeClock {
    base: DateTime<Utc>,
}

impl RelativeClock {
    pub const fn new(base: DateTime<Utc>) -> Self {
        Self { base }
    }

    pub fn base(&self) -> DateTime<Utc> {
        self.base
    }

    /// Seconds from the base to `at`. Negative when `at` precedes the base.
    pub fn offset(&self, at: DateTime<Utc>) -> f64 {
        let delta = at - self.base;
        match delta.num_microseconds() {
            Some(us) => us as f64 / 1e6,
            None => delta.num_milliseconds() as f64 / 1e3,
        }
    }

    /// The absolute time `offset` seconds after the base.
    pub fn absolute(&self, offset: f64) -> DateTime<Utc> {
        self.base + seconds(offset)
    }
}

/// Microsecond-resolution duration from fractional seconds.
pub fn seconds(secs: f64) -> Duration {
    Duration::microseconds((secs * 1e6).round() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_negative_offset() {
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let rel = RelativeClock::new(base);
        assert_eq!(rel.offset(base - Duration::seconds(3)), -3.0);
    }

    #[test]
    fn test_system_clock_moves_forward() {
        let clock = SystemClock;
        let first = clock.now();
        let second = clock.now();
        assert!(second >= first);
    }
}
