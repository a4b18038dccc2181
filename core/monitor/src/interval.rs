use std::cmp;
use std::time::Duration;

pub const DEFAULT_BASE_SECS: u64 = 30;
pub const DEFAULT_STEP_SECS: u64 = 10;
pub const DEFAULT_MAX_SECS: u64 = 120;
pub const DEFAULT_EMPTY_POLLS_PER_STEP: u32 = 3;

/// Poll interval that stretches while nothing happens and snaps back to the
/// base as soon as a poll produces events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollInterval {
    base: Duration,
    step: Duration,
    max: Duration,
    empty_polls_per_step: u32,
    current: Duration,
    empty_streak: u32,
}

impl Default for PollInterval {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(DEFAULT_BASE_SECS),
            Duration::from_secs(DEFAULT_STEP_SECS),
            Duration::from_secs(DEFAULT_MAX_SECS),
            DEFAULT_EMPTY_POLLS_PER_STEP,
        )
    }
}

impl PollInterval {
    pub fn new(base: Duration, step: Duration, max: Duration, empty_polls_per_step: u32) -> Self {
        let max = cmp::max(base, max);
        Self {
            base,
            step,
            max,
            empty_polls_per_step: cmp::max(empty_polls_per_step, 1),
            current: base,
            empty_streak: 0,
        }
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn empty_streak(&self) -> u32 {
        self.empty_streak
    }

    /// Feeds the outcome of one successful poll and returns the next sleep.
    pub fn record(&mut self, event_count: usize) -> Duration {
        if event_count > 0 {
            self.reset();
            return self.current;
        }

        self.empty_streak = self.empty_streak.saturating_add(1);
        if self.empty_streak % self.empty_polls_per_step == 0 {
            self.current = cmp::min(self.current.saturating_add(self.step), self.max);
        }
        self.current
    }

    pub fn reset(&mut self) {
        self.current = self.base;
        self.empty_streak = 0;
    }
}
