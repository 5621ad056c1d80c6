//! Window counter implementation.
//!
//! A [`WindowCounter`] gates requests for one `(scope, duration)` pair. It
//! counts reservations against a fixed-length window, blocks reservers while
//! the window is saturated, and realigns its window boundary and limit with
//! the server's clock when calls complete.
//!
//! Reservations whose calls are still in flight are tracked in two buckets:
//! `currently_pending` for reservations made in the active window, and
//! `previously_pending` for reservations made in a window that has since
//! rolled over. Stragglers from an old window keep consuming capacity of the
//! new one until they are acknowledged, without holding back the rollover.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tracing::{debug, trace, warn};

use super::clock::SharedClock;
use super::rules::LimitRule;

/// How often a parked reservation re-checks capacity when nothing wakes it.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Mutable window bookkeeping, only touched under the commit lock.
#[derive(Debug, Clone)]
struct WindowState {
    limit: u64,
    /// Epoch seconds; 0 until the first reservation opens a window
    window_start: i64,
    /// Incremented on every rollover
    window_id: u64,
    count: u64,
    currently_pending: u64,
    previously_pending: u64,
    synced: bool,
}

impl WindowState {
    fn window_end(&self, duration: u64) -> i64 {
        self.window_start + duration as i64
    }

    /// The window covers its last whole second; it has expired once `now`
    /// is strictly past `window_start + duration`.
    fn is_expired(&self, duration: u64, now: i64) -> bool {
        now > self.window_end(duration)
    }
}

/// What a reserver must do before it can take a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    /// A slot is available.
    Ready,
    /// In-flight reservations occupy the remaining capacity; wait for
    /// acknowledgments or for the window to end.
    Drain,
    /// The window is spent; sleep until it is guaranteed to have ended.
    WindowFull { retry_in: Duration },
}

/// Decrements the blocked-reserver gauge when a parked reservation finishes
/// or is dropped.
struct BlockedGuard<'a>(&'a AtomicUsize);

impl<'a> BlockedGuard<'a> {
    fn new(gauge: &'a AtomicUsize) -> Self {
        gauge.fetch_add(1, Ordering::SeqCst);
        Self(gauge)
    }
}

impl Drop for BlockedGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Point-in-time view of a counter, for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub name: Option<String>,
    pub limit: u64,
    pub duration: u64,
    pub window_start: i64,
    pub window_id: u64,
    pub count: u64,
    pub currently_pending: u64,
    pub previously_pending: u64,
    pub synced: bool,
    pub blocked_reservers: usize,
}

/// Admission gate for one window duration within one scope.
///
/// Two locks protect the counter. The admission lock serializes reservers
/// while they wait for capacity. The commit lock guards the window state and
/// is only ever held for short synchronous sections, so acknowledgments are
/// never stuck behind a waiting reserver.
#[derive(Debug)]
pub struct WindowCounter {
    duration: u64,
    name: Option<String>,
    clock: SharedClock,
    poll_interval: Duration,
    /// Coarse lock: one reserver at a time runs the admission loop
    admission: AsyncMutex<()>,
    /// Fine lock: window state, shared by commit, acknowledge and rollover
    state: Mutex<WindowState>,
    /// Signalled whenever an acknowledgment or limit change may free capacity
    settled: Notify,
    blocked: AtomicUsize,
}

impl WindowCounter {
    /// Create a counter allowing `rule.limit` requests per `rule.duration` seconds.
    ///
    /// A limit of zero is accepted and blocks every reservation forever.
    pub fn new(rule: LimitRule, clock: SharedClock) -> Self {
        Self {
            duration: rule.duration,
            name: None,
            clock,
            poll_interval: DEFAULT_POLL_INTERVAL,
            admission: AsyncMutex::new(()),
            state: Mutex::new(WindowState {
                limit: rule.limit,
                window_start: 0,
                window_id: 0,
                count: 0,
                currently_pending: 0,
                previously_pending: 0,
                synced: false,
            }),
            settled: Notify::new(),
            blocked: AtomicUsize::new(0),
        }
    }

    /// Attach a diagnostic name, usually the scope the counter belongs to.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Override how often parked reservations re-check capacity.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Window length in seconds.
    pub fn duration(&self) -> u64 {
        self.duration
    }

    /// Currently configured limit.
    pub fn limit(&self) -> u64 {
        self.state.lock().limit
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Sequence number of the active window.
    pub fn window_id(&self) -> u64 {
        self.state.lock().window_id
    }

    /// Whether any reservation is currently parked waiting for capacity.
    pub fn is_blocking(&self) -> bool {
        self.blocked.load(Ordering::SeqCst) > 0
    }

    /// Replace the configured limit.
    pub fn update_limit(&self, limit: u64) {
        let previous = {
            let mut state = self.state.lock();
            std::mem::replace(&mut state.limit, limit)
        };
        if previous != limit {
            debug!(
                name = self.name.as_deref().unwrap_or(""),
                duration = self.duration,
                previous,
                limit,
                "Updated window limit"
            );
            self.settled.notify_waiters();
        }
    }

    /// Capture the counter's current bookkeeping.
    pub fn snapshot(&self) -> CounterSnapshot {
        let state = self.state.lock();
        CounterSnapshot {
            name: self.name.clone(),
            limit: state.limit,
            duration: self.duration,
            window_start: state.window_start,
            window_id: state.window_id,
            count: state.count,
            currently_pending: state.currently_pending,
            previously_pending: state.previously_pending,
            synced: state.synced,
            blocked_reservers: self.blocked.load(Ordering::SeqCst),
        }
    }

    /// Reserve a slot, waiting until the window can admit it.
    ///
    /// Returns the id of the window the reservation is counted in. The id
    /// must be passed back to [`acknowledge`](Self::acknowledge) exactly once
    /// when the call completes. Dropping this future while it waits is safe
    /// as long as the caller then skips both the call and the acknowledgment.
    pub async fn reserve(&self) -> u64 {
        let _admission = self.admission.lock().await;
        let mut blocked: Option<BlockedGuard<'_>> = None;

        loop {
            let settled = self.settled.notified();
            tokio::pin!(settled);
            settled.as_mut().enable();

            let admission = {
                let state = self.state.lock();
                self.admission_for(&state, self.clock.now())
            };

            match admission {
                Admission::Ready => break,
                Admission::Drain => {
                    blocked.get_or_insert_with(|| BlockedGuard::new(&self.blocked));
                    trace!(
                        name = self.name.as_deref().unwrap_or(""),
                        duration = self.duration,
                        "Waiting for in-flight requests to settle"
                    );
                    let _ = tokio::time::timeout(self.poll_interval, settled).await;
                }
                Admission::WindowFull { retry_in } => {
                    blocked.get_or_insert_with(|| BlockedGuard::new(&self.blocked));
                    debug!(
                        name = self.name.as_deref().unwrap_or(""),
                        duration = self.duration,
                        limit = self.limit(),
                        sleep_secs = retry_in.as_secs(),
                        "Limit reached, sleeping until the window ends"
                    );
                    tokio::time::sleep(retry_in).await;
                }
            }
        }
        drop(blocked);

        let mut state = self.state.lock();
        let now = self.clock.now();
        if state.is_expired(self.duration, now) {
            self.roll(&mut state, now);
        }
        state.count += 1;
        state.currently_pending += 1;

        trace!(
            name = self.name.as_deref().unwrap_or(""),
            duration = self.duration,
            window_id = state.window_id,
            count = state.count,
            limit = state.limit,
            "Reserved slot"
        );
        state.window_id
    }

    /// Settle a reservation once its call has completed.
    ///
    /// `timestamp` is when the server processed the call (epoch seconds) and
    /// `server_limit` the limit it advertised for this window duration, if
    /// any. Never waits on reservers; it only sleeps when the server reports
    /// that the window has ended before the local clock agrees.
    pub async fn acknowledge(&self, window_id: u64, timestamp: i64, server_limit: Option<u64>) {
        let observed = {
            let mut state = self.state.lock();
            if state.window_end(self.duration) > timestamp {
                if window_id == state.window_id {
                    state.currently_pending = self.decrement(state.currently_pending, "currently_pending");
                } else {
                    state.previously_pending =
                        self.decrement(state.previously_pending, "previously_pending");
                    state.count += 1;
                }

                if !state.synced {
                    if let Some(limit) = server_limit {
                        state.limit = limit;
                    }
                    state.synced = true;
                    state.window_start = timestamp;
                }

                trace!(
                    name = self.name.as_deref().unwrap_or(""),
                    duration = self.duration,
                    window_id,
                    current_window = state.window_id,
                    count = state.count,
                    "Acknowledged request"
                );
                drop(state);
                self.settled.notify_waiters();
                return;
            }
            state.window_id
        };

        // The server clock says this window is over.
        self.rollover(observed).await;

        {
            let mut state = self.state.lock();
            if let Some(limit) = server_limit {
                state.limit = limit;
            }
            state.previously_pending = self.decrement(state.previously_pending, "previously_pending");
            state.count += 1;
            state.synced = true;
            state.window_start = timestamp;

            trace!(
                name = self.name.as_deref().unwrap_or(""),
                duration = self.duration,
                window_id,
                current_window = state.window_id,
                count = state.count,
                "Acknowledged request after server-side rollover"
            );
        }
        self.settled.notify_waiters();
    }

    fn admission_for(&self, state: &WindowState, now: i64) -> Admission {
        if state.is_expired(self.duration, now) {
            // Stragglers from the old window must leave room in the new one.
            if state.previously_pending >= state.limit {
                Admission::Drain
            } else {
                Admission::Ready
            }
        } else if state.count < state.limit {
            if state.previously_pending + state.count >= state.limit {
                Admission::Drain
            } else {
                Admission::Ready
            }
        } else {
            let remaining = state.window_end(self.duration) - now + 1;
            Admission::WindowFull {
                retry_in: Duration::from_secs(remaining.max(1) as u64),
            }
        }
    }

    /// Roll the window over once the local clock is past the end of window
    /// `observed`. Returns immediately if another task already rolled it.
    async fn rollover(&self, observed: u64) {
        loop {
            let wait = {
                let mut state = self.state.lock();
                if state.window_id != observed {
                    return;
                }
                let now = self.clock.now();
                if state.is_expired(self.duration, now) {
                    self.roll(&mut state, now);
                    return;
                }
                state.window_end(self.duration) - now + 1
            };
            tokio::time::sleep(Duration::from_secs(wait.max(1) as u64)).await;
        }
    }

    fn roll(&self, state: &mut WindowState, now: i64) {
        state.previously_pending += state.currently_pending;
        state.currently_pending = 0;
        state.count = 0;
        state.window_start = now;
        state.window_id += 1;
        state.synced = false;

        debug!(
            name = self.name.as_deref().unwrap_or(""),
            duration = self.duration,
            window_id = state.window_id,
            previously_pending = state.previously_pending,
            "Window rolled over"
        );
    }

    fn decrement(&self, value: u64, field: &'static str) -> u64 {
        if value == 0 {
            warn!(
                name = self.name.as_deref().unwrap_or(""),
                duration = self.duration,
                field,
                "Pending counter underflow, request acknowledged twice?"
            );
        }
        value.saturating_sub(1)
    }
}
