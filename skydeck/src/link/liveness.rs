//! Periodic staleness check for the telemetry stream.
//!
//! Every `check_interval` the link asks whether a values datagram arrived
//! within `status_timeout`. If not (including "never"), it resubscribes every
//! entry. The check re-arms itself unconditionally until cancelled.

use std::time::Duration;

use crate::runtime::timing::MonoInstant;

/// Outcome of [`LivenessMonitor::poll`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessCheck {
    /// The check isn't due yet, or the monitor was cancelled.
    NotDue,
    /// A datagram arrived within the status timeout.
    Active,
    /// No recent datagram; the caller should resubscribe.
    Stale,
}

#[derive(Debug, Clone)]
pub struct LivenessMonitor {
    check_interval: Duration,
    status_timeout: Duration,
    last_received_at: Option<MonoInstant>,
    next_check: Option<MonoInstant>,
}

impl LivenessMonitor {
    /// Arms the first check at `now + check_interval`.
    #[must_use]
    pub fn new(check_interval: Duration, status_timeout: Duration, now: MonoInstant) -> Self {
        Self {
            check_interval,
            status_timeout,
            last_received_at: None,
            next_check: Some(now + check_interval),
        }
    }

    /// Notes that a valid values datagram arrived at `now`.
    pub fn record_datagram(&mut self, now: MonoInstant) {
        self.last_received_at = Some(now);
    }

    #[must_use]
    pub const fn last_received_at(&self) -> Option<MonoInstant> {
        self.last_received_at
    }

    /// `true` when the last datagram is younger than the status timeout.
    #[must_use]
    pub fn is_active(&self, now: MonoInstant) -> bool {
        self.last_received_at
            .is_some_and(|at| now.saturating_duration_since(at) < self.status_timeout)
    }

    /// Runs the check if it is due and re-arms it.
    pub fn poll(&mut self, now: MonoInstant) -> LivenessCheck {
        match self.next_check {
            Some(due) if now >= due => {
                self.next_check = Some(now + self.check_interval);
                if self.is_active(now) {
                    LivenessCheck::Active
                } else {
                    LivenessCheck::Stale
                }
            }
            _ => LivenessCheck::NotDue,
        }
    }

    /// Stops all further checks.
    pub fn cancel(&mut self) {
        self.next_check = None;
    }

    /// When the next check is due, unless cancelled.
    #[must_use]
    pub const fn next_deadline(&self) -> Option<MonoInstant> {
        self.next_check
    }
}
