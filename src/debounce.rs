// Hysteresis filter for boolean signals
//
// A debounced output only changes after the raw input has held its new value
// continuously for the configured window. Time is passed in by the caller so
// the same filter works against wall-clock and simulated time.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Which edges of the input are delayed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DebounceType {
    /// false -> true is delayed, true -> false passes immediately
    #[default]
    Rising,
    /// true -> false is delayed, false -> true passes immediately
    Falling,
    /// Both edges are delayed
    Both,
}

#[derive(Debug, Clone)]
pub struct Debouncer {
    window: Duration,
    kind: DebounceType,
    baseline: bool,
    prev_time: Duration,
}

impl Debouncer {
    /// Create a debouncer whose timer starts at `now`
    pub fn new(window: Duration, kind: DebounceType, now: Duration) -> Self {
        Self {
            window,
            kind,
            baseline: kind == DebounceType::Falling,
            prev_time: now,
        }
    }

    /// Feed one raw sample taken at `now` and return the filtered value
    pub fn calculate(&mut self, input: bool, now: Duration) -> bool {
        if input == self.baseline {
            self.prev_time = now;
        }

        if self.has_elapsed(now) {
            if self.kind == DebounceType::Both {
                self.baseline = input;
                self.prev_time = now;
            }
            input
        } else {
            self.baseline
        }
    }

    fn has_elapsed(&self, now: Duration) -> bool {
        now.saturating_sub(self.prev_time) >= self.window
    }
}
