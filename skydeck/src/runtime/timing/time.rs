//! Monotonic millisecond timestamps and the clocks that produce them.
//!
//! Everything time-driven in the crate (liveness checks, frame pacing, the
//! timer wheel) reads time through [`Clock`], so tests can drive it with a
//! [`ManualClock`] instead of waiting on the wall clock.

use core::ops::{Add, Sub};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// A point on the crate's monotonic millisecond timeline.
///
/// The origin is whatever the producing [`Clock`] considers zero; instants
/// from different clocks must not be mixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct MonoInstant(u64);

impl MonoInstant {
    /// The clock origin.
    pub const ZERO: Self = Self(0);

    /// Creates an instant `millis` milliseconds after the origin.
    #[inline]
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Milliseconds since the origin.
    #[inline]
    #[must_use]
    pub const fn as_millis(self) -> u64 {
        self.0
    }

    /// Time elapsed since `earlier`, or zero if `earlier` is in the future.
    #[inline]
    #[must_use]
    pub const fn saturating_duration_since(self, earlier: Self) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }
}

impl Add<Duration> for MonoInstant {
    type Output = Self;

    #[inline]
    fn add(self, rhs: Duration) -> Self::Output {
        Self(self.0.saturating_add(duration_millis(rhs)))
    }
}

impl Sub for MonoInstant {
    type Output = Duration;

    #[inline]
    fn sub(self, rhs: Self) -> Self::Output {
        self.saturating_duration_since(rhs)
    }
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`.
#[inline]
#[must_use]
pub fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Source of monotonic time.
pub trait Clock: Send {
    /// Current instant.
    fn now(&self) -> MonoInstant;
}

/// Wall-clock backed monotonic time (TSC where available, via `minstant`).
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: minstant::Instant,
}

impl SystemClock {
    /// Creates a clock whose origin is the moment of construction.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: minstant::Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> MonoInstant {
        MonoInstant::from_millis(duration_millis(self.origin.elapsed()))
    }
}

/// Hand-driven clock. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    millis: Arc<AtomicU64>,
}

impl ManualClock {
    /// Creates a clock sitting at the origin.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Jumps to `instant`.
    pub fn set(&self, instant: MonoInstant) {
        self.millis.store(instant.as_millis(), Ordering::Release);
    }

    /// Moves time forward by `by` and returns the new instant.
    pub fn advance(&self, by: Duration) -> MonoInstant {
        let by = duration_millis(by);
        MonoInstant::from_millis(self.millis.fetch_add(by, Ordering::AcqRel).saturating_add(by))
    }
}

impl Clock for ManualClock {
    fn now(&self) -> MonoInstant {
        MonoInstant::from_millis(self.millis.load(Ordering::Acquire))
    }
}
