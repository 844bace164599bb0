//! Clock domains and deadline conversions.
//!
//! The manager tracks deadlines in two incomparable domains: the adjustable
//! wall clock (`SystemTime`) for absolute real-world deadlines, and the
//! monotonic clock (`Instant`) for relative delays. Time points from one
//! domain are never ordered against the other.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// An absolute expiration point in one of the two clock domains.
///
/// Accepted by [`TimerManager::expire_at`](crate::TimerManager::expire_at)
/// through `Into<Deadline>`, so callers can pass a `SystemTime`, an
/// `Instant`, or a relative `Duration` directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    /// Wall-clock deadline, affected by clock adjustments.
    Wall(SystemTime),
    /// Monotonic deadline, immune to clock adjustments.
    Monotonic(Instant),
}

impl From<SystemTime> for Deadline {
    fn from(time_point: SystemTime) -> Self {
        Deadline::Wall(time_point)
    }
}

impl From<Instant> for Deadline {
    fn from(time_point: Instant) -> Self {
        Deadline::Monotonic(time_point)
    }
}

impl From<Duration> for Deadline {
    /// A relative delay is normalized to `monotonic-now + delay`.
    fn from(delay: Duration) -> Self {
        Deadline::Monotonic(Instant::now() + delay)
    }
}

#[inline]
fn duration_to_millis_saturating(duration: Duration) -> u64 {
    duration.as_millis().min(u128::from(u64::MAX)) as u64
}

/// Projects a wall-clock point to milliseconds since the Unix epoch.
/// Pre-epoch points saturate to 0.
#[inline]
pub(crate) fn wall_millis(time_point: SystemTime) -> u64 {
    match time_point.duration_since(UNIX_EPOCH) {
        Ok(since_epoch) => duration_to_millis_saturating(since_epoch),
        Err(_) => 0,
    }
}

/// Projects a monotonic point to milliseconds since `base`.
/// Points before `base` saturate to 0.
#[inline]
pub(crate) fn monotonic_millis(time_point: Instant, base: Instant) -> u64 {
    duration_to_millis_saturating(time_point.saturating_duration_since(base))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_normalizes_to_monotonic() {
        let before = Instant::now();
        let deadline = Deadline::from(Duration::from_millis(250));
        match deadline {
            Deadline::Monotonic(tp) => assert!(tp >= before + Duration::from_millis(250)),
            Deadline::Wall(_) => panic!("relative delay must land in the monotonic domain"),
        }
    }

    #[test]
    fn test_millis_projections_saturate() {
        assert_eq!(wall_millis(UNIX_EPOCH - Duration::from_secs(1)), 0);

        let base = Instant::now();
        assert_eq!(monotonic_millis(base, base + Duration::from_secs(1)), 0);
        let later = base + Duration::from_millis(1500);
        assert_eq!(monotonic_millis(later, base), 1500);
    }
}
