//! Dead-man's switch for regeneration requests

use std::time::{Duration, Instant};

/// Fixed-duration timer that fires at most once per start
///
/// The control loop polls it; nothing runs in the background.
#[derive(Debug, Clone)]
pub struct DeadManSwitch {
    duration: Duration,
    deadline: Option<Instant>,
}

impl DeadManSwitch {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            deadline: None,
        }
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Arm the switch, restarting it if it was already running
    pub fn start(&mut self, now: Instant) {
        self.deadline = Some(now + self.duration);
    }

    /// Disarm the switch
    ///
    /// Returns true if it was running.
    pub fn stop(&mut self) -> bool {
        self.deadline.take().is_some()
    }

    pub fn is_running(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns true exactly once when the deadline has passed
    pub fn poll(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }
}
