//! Wall-clock sources for window arithmetic.

use std::fmt;
use std::sync::Arc;

/// A source of "now" in whole seconds since the Unix epoch (UTC).
///
/// The value is compared against server `Date` timestamps, so it must be
/// wall-clock time rather than a purely monotonic reading.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current time in epoch seconds.
    fn now(&self) -> i64;
}

/// Shared handle to a clock.
pub type SharedClock = Arc<dyn Clock>;

/// The system wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        chrono::Utc::now().timestamp()
    }
}

/// A wall clock driven by tokio's timer.
///
/// Epoch seconds are computed as a fixed anchor plus the time elapsed on
/// `tokio::time::Instant`. On a paused runtime time only moves when every
/// task is asleep, which makes window rollovers deterministic.
#[derive(Debug, Clone)]
pub struct TokioClock {
    anchor_epoch: i64,
    anchor: tokio::time::Instant,
}

impl TokioClock {
    /// Anchor the clock to the current system time.
    pub fn new() -> Self {
        Self::starting_at(chrono::Utc::now().timestamp())
    }

    /// Anchor the clock at a specific epoch second.
    pub fn starting_at(epoch_secs: i64) -> Self {
        Self {
            anchor_epoch: epoch_secs,
            anchor: tokio::time::Instant::now(),
        }
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    fn now(&self) -> i64 {
        self.anchor_epoch + self.anchor.elapsed().as_secs() as i64
    }
}

/// The default clock used when none is supplied.
pub fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}
