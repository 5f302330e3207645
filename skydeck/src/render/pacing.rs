//! Per-task frame pacing with one-second drift correction.
//!
//! Ticks are rescheduled relative to the previous one, so jitter would
//! accumulate. The pacer anchors a 1000 ms window and shortens the delay
//! that would cross the window boundary so the next tick lands on it. The
//! boundary tick opens the next window.

use std::time::Duration;

use crate::link::Frequency;
use crate::runtime::timing::MonoInstant;

/// Length of the correction window.
pub const WINDOW: Duration = Duration::from_millis(1000);

const WINDOW_MS: u64 = 1000;

#[derive(Debug, Clone)]
pub struct FramePacer {
    interval_ms: u64,
    window_start: MonoInstant,
}

impl FramePacer {
    /// Starts the first window at `now`. `None` for a zero frequency.
    ///
    /// The interval is `ceil(1000 / hz)` ms, never less than 1 ms.
    #[must_use]
    pub fn new(frequency: Frequency, now: MonoInstant) -> Option<Self> {
        if frequency.is_zero() {
            return None;
        }
        Some(Self {
            interval_ms: WINDOW_MS.div_ceil(u64::from(frequency.hz())),
            window_start: now,
        })
    }

    /// Nominal time between ticks.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    #[must_use]
    pub const fn window_start(&self) -> MonoInstant {
        self.window_start
    }

    /// Delay from a tick at `now` to the next one.
    pub fn next_delay(&mut self, now: MonoInstant) -> Duration {
        let elapsed = now.as_millis().saturating_sub(self.window_start.as_millis());
        if elapsed >= WINDOW_MS {
            self.window_start = now;
            return self.interval();
        }
        if elapsed + self.interval_ms > WINDOW_MS {
            return Duration::from_millis(WINDOW_MS - elapsed);
        }
        self.interval()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(ms: u64) -> MonoInstant {
        MonoInstant::from_millis(ms)
    }

    /// Tick times produced by following the pacer from a first tick at
    /// `first`, stopping before `until`.
    fn ticks(hz: u16, first: u64, until: u64) -> Vec<u64> {
        let mut pacer = FramePacer::new(Frequency::new(hz), at(0)).unwrap();
        let mut now = first;
        let mut out = Vec::new();
        while now < until {
            out.push(now);
            now += pacer.next_delay(at(now)).as_millis() as u64;
        }
        out
    }

    #[test]
    fn zero_frequency_has_no_pacer() {
        assert!(FramePacer::new(Frequency::UNSUBSCRIBE, at(0)).is_none());
    }

    #[test]
    fn interval_rounds_up() {
        let interval = |hz| {
            FramePacer::new(Frequency::new(hz), at(0))
                .unwrap()
                .interval()
        };
        assert_eq!(interval(1), Duration::from_millis(1000));
        assert_eq!(interval(3), Duration::from_millis(334));
        assert_eq!(interval(10), Duration::from_millis(100));
        assert_eq!(interval(2000), Duration::from_millis(1));
    }

    #[test]
    fn last_tick_snaps_to_window_boundary() {
        assert_eq!(ticks(5, 1, 2_001), vec![
            1, 201, 401, 601, 801, 1_000, 1_200, 1_400, 1_600, 1_800, 2_000
        ]);
    }

    #[test]
    fn exactly_hz_ticks_per_window() {
        for hz in 1..=32 {
            let times = ticks(hz, 1, 10_000);
            for window in 0..10 {
                let start = window * 1_000;
                let n = times
                    .iter()
                    .filter(|&&t| t >= start && t < start + 1_000)
                    .count();
                assert_eq!(n, usize::from(hz), "{hz} Hz in window {window}");
            }
        }
    }

    #[test]
    fn late_tick_opens_new_window() {
        let mut pacer = FramePacer::new(Frequency::new(10), at(0)).unwrap();
        // Scheduler stalled for 1.5 s.
        assert_eq!(pacer.next_delay(at(1_500)), Duration::from_millis(100));
        assert_eq!(pacer.window_start(), at(1_500));
    }
}
