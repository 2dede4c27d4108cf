// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Monotonic time in whole microseconds.

use core::{fmt, num::NonZeroU64, time::Duration};
use std::time::Instant;

/// An absolute point in time, measured in whole microseconds since the
/// owning clock's epoch.
///
/// The absolute value is opaque and unrelated to calendar time; timestamps
/// may only be compared when they come from the same [`Clock`]. The niche in
/// `NonZeroU64` keeps `Option<Timestamp>` pointer-sized, which the route
/// metadata relies on.
#[derive(PartialEq, Eq, PartialOrd, Ord, Copy, Clone, Hash)]
pub struct Timestamp(NonZeroU64);

impl Timestamp {
    /// One microsecond after the clock epoch, the earliest representable
    /// instant.
    pub const EPOCH: Self = Self(NonZeroU64::MIN);

    /// Creates a `Timestamp` from microseconds since the epoch; zero rounds
    /// up to [`EPOCH`](Self::EPOCH).
    #[inline]
    pub fn from_micros(micros: u64) -> Self {
        Self(NonZeroU64::new(micros).unwrap_or(NonZeroU64::MIN))
    }

    #[inline]
    pub const fn as_micros(self) -> u64 {
        self.0.get()
    }

    #[inline]
    pub fn checked_add(self, duration: Duration) -> Option<Self> {
        let micros = u64::try_from(duration.as_micros()).ok()?;
        self.0.get().checked_add(micros).map(Self::from_micros)
    }

    /// Returns the `Duration` elapsed since an earlier `Timestamp`, or zero
    /// if `earlier` is actually more recent.
    #[inline]
    pub fn saturating_duration_since(self, earlier: Self) -> Duration {
        Duration::from_micros(self.0.get().saturating_sub(earlier.0.get()))
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Timestamp({}µs)", self.0.get())
    }
}

impl core::ops::Add<Duration> for Timestamp {
    type Output = Timestamp;

    #[inline]
    fn add(self, rhs: Duration) -> Self::Output {
        self.checked_add(rhs)
            .unwrap_or(Self(NonZeroU64::new(u64::MAX).unwrap_or(NonZeroU64::MIN)))
    }
}

impl core::ops::Sub for Timestamp {
    type Output = Duration;

    #[inline]
    fn sub(self, rhs: Timestamp) -> Self::Output {
        self.saturating_duration_since(rhs)
    }
}

/// A source of [`Timestamp`]s.
///
/// The host may substitute its own implementation through the
/// [`Hpi`](crate::hpi::Hpi); the engine only requires monotonicity.
pub trait Clock: Send + Sync {
    fn get_time(&self) -> Timestamp;
}

/// Clock over [`std::time::Instant`], anchored at construction.
#[derive(Clone, Copy, Debug)]
pub struct StdClock {
    epoch: Instant,
}

impl Default for StdClock {
    fn default() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Clock for StdClock {
    fn get_time(&self) -> Timestamp {
        let micros = self.epoch.elapsed().as_micros();
        Timestamp::from_micros(u64::try_from(micros).unwrap_or(u64::MAX))
    }
}

/// A clock that always answers [`Timestamp::EPOCH`].
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopClock;

impl Clock for NoopClock {
    fn get_time(&self) -> Timestamp {
        Timestamp::EPOCH
    }
}

#[cfg(any(test, feature = "testing"))]
pub mod testing {
    use super::{Clock, Timestamp};
    use core::{
        sync::atomic::{AtomicU64, Ordering},
        time::Duration,
    };

    /// A clock advanced by hand, for deterministic tests.
    #[derive(Debug, Default)]
    pub struct ManualClock {
        micros: AtomicU64,
    }

    impl ManualClock {
        pub fn inc_by(&self, duration: Duration) {
            self.micros
                .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
        }
    }

    impl Clock for ManualClock {
        fn get_time(&self) -> Timestamp {
            Timestamp::from_micros(self.micros.load(Ordering::Relaxed))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn micros_round_trip() {
        assert_eq!(Timestamp::from_micros(0), Timestamp::EPOCH);
        assert_eq!(Timestamp::from_micros(123_456).as_micros(), 123_456);
    }

    #[test]
    fn arithmetic() {
        let t1 = Timestamp::from_micros(1_000);
        let t2 = t1 + Duration::from_millis(5);
        assert_eq!(t2.as_micros(), 6_000);
        assert_eq!(t2 - t1, Duration::from_millis(5));
        assert_eq!(t1.saturating_duration_since(t2), Duration::ZERO);
        assert!(t1.checked_add(Duration::from_secs(u64::MAX)).is_none());
    }

    #[test]
    #[cfg_attr(miri, ignore)] // time isn't queryable in miri
    fn std_clock_is_monotonic() {
        let clock = StdClock::default();
        let t1 = clock.get_time();
        std::thread::sleep(Duration::from_millis(10));
        let t2 = clock.get_time();
        assert!(t2 > t1);
    }

    #[test]
    fn manual_clock_advances() {
        let clock = testing::ManualClock::default();
        let t1 = clock.get_time();
        clock.inc_by(Duration::from_micros(42));
        assert_eq!(clock.get_time() - t1, Duration::from_micros(41));
    }
}
