//! Activity and silence detection over a session's output.
//!
//! The monitor never reads the clock itself: callers pass `now` and arm a
//! timer for [`ActivityMonitor::deadline`]. That keeps it usable from any
//! reactor and trivially testable.

use std::time::{Duration, Instant};

/// Default quiet period before silence is reported.
pub const DEFAULT_SILENCE_SECONDS: u64 = 10;

/// Notification state of a session, as shown on its tab.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityState {
    Normal,
    Activity,
    Silence,
}

#[derive(Debug)]
pub struct ActivityMonitor {
    monitor_activity: bool,
    monitor_silence: bool,
    threshold: Duration,
    deadline: Option<Instant>,
    /// Set once activity has been reported for the current burst.
    notified_activity: bool,
}

impl ActivityMonitor {
    pub fn new() -> Self {
        Self {
            monitor_activity: false,
            monitor_silence: false,
            threshold: Duration::from_secs(DEFAULT_SILENCE_SECONDS),
            deadline: None,
            notified_activity: false,
        }
    }

    pub fn is_monitoring_activity(&self) -> bool {
        self.monitor_activity
    }

    pub fn is_monitoring_silence(&self) -> bool {
        self.monitor_silence
    }

    pub fn silence_threshold(&self) -> Duration {
        self.threshold
    }

    /// When the timer should next fire, if it is armed.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn set_monitor_activity(&mut self, enabled: bool) -> Option<ActivityState> {
        if self.monitor_activity == enabled {
            return None;
        }
        self.monitor_activity = enabled;
        self.notified_activity = false;
        if !self.is_armed_for_any() {
            self.deadline = None;
        }
        Some(ActivityState::Normal)
    }

    /// Enabling silence monitoring arms the timer from `now`; disabling it
    /// stops the timer.
    pub fn set_monitor_silence(&mut self, enabled: bool, now: Instant) -> Option<ActivityState> {
        if self.monitor_silence == enabled {
            return None;
        }
        self.monitor_silence = enabled;
        self.deadline = if enabled {
            Some(now + self.threshold)
        } else if self.monitor_activity {
            self.deadline
        } else {
            None
        };
        Some(ActivityState::Normal)
    }

    /// Change the quiet period. A running timer restarts from `now`.
    pub fn set_silence_threshold(&mut self, threshold: Duration, now: Instant) {
        self.threshold = threshold;
        if self.deadline.is_some() {
            self.deadline = Some(now + threshold);
        }
    }

    /// Output arrived. Reports activity once per burst and restarts the
    /// quiet-period timer.
    pub fn on_output(&mut self, now: Instant) -> Option<ActivityState> {
        if self.is_armed_for_any() {
            self.deadline = Some(now + self.threshold);
        }
        if self.monitor_activity && !self.notified_activity {
            self.notified_activity = true;
            return Some(ActivityState::Activity);
        }
        None
    }

    /// The timer fired. Reports silence once per quiet period; the next
    /// output starts a new cycle.
    pub fn on_timeout(&mut self, now: Instant) -> Option<ActivityState> {
        match self.deadline {
            Some(deadline) if now >= deadline => {}
            _ => return None,
        }
        self.deadline = None;
        let was_active = std::mem::take(&mut self.notified_activity);

        if self.monitor_silence {
            Some(ActivityState::Silence)
        } else if was_active {
            Some(ActivityState::Normal)
        } else {
            None
        }
    }

    fn is_armed_for_any(&self) -> bool {
        self.monitor_activity || self.monitor_silence
    }
}

impl Default for ActivityMonitor {
    fn default() -> Self {
        Self::new()
    }
}
