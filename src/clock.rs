// Time sources for debouncing and simulation
//
// Hardware runs on a monotonic clock; simulation runs on a clock that only
// moves when the physics step says so.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Anything that can report elapsed time since some fixed origin
pub trait Clock: Send {
    fn now(&self) -> Duration;
}

/// Wall-clock time since construction
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    start: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.start.elapsed()
    }
}

/// Explicitly advanced clock
///
/// Clones share the same underlying time, so the simulation can hold one
/// handle and advance it while the hardware backend reads another.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    nanos: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, dt: Duration) {
        self.nanos.fetch_add(dt.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn set(&self, t: Duration) {
        self.nanos.store(t.as_nanos() as u64, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::Relaxed))
    }
}
