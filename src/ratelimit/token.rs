//! Reservation tokens threaded from `acquire` to `release`.

use std::fmt;
use std::sync::Arc;

use super::counter::WindowCounter;

/// One slot reserved on one window counter.
#[derive(Clone)]
pub struct Reservation {
    counter: Arc<WindowCounter>,
    window_id: u64,
}

impl Reservation {
    pub(crate) fn new(counter: Arc<WindowCounter>, window_id: u64) -> Self {
        Self { counter, window_id }
    }

    /// The counter that issued this reservation.
    pub fn counter(&self) -> &Arc<WindowCounter> {
        &self.counter
    }

    /// Id of the window the reservation was counted in.
    pub fn window_id(&self) -> u64 {
        self.window_id
    }

    /// Duration of the issuing counter's window.
    pub fn duration(&self) -> u64 {
        self.counter.duration()
    }

    /// Whether this reservation was issued by `counter`.
    pub fn is_for(&self, counter: &Arc<WindowCounter>) -> bool {
        Arc::ptr_eq(&self.counter, counter)
    }
}

impl fmt::Debug for Reservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reservation")
            .field("scope", &self.counter.name())
            .field("duration", &self.counter.duration())
            .field("window_id", &self.window_id)
            .finish()
    }
}

/// Proof of admission for one call, returned by `acquire` and consumed by
/// `release`.
///
/// Holds one reservation per application-scope counter followed by one per
/// operation-scope counter, each list in its group's order. Every
/// reservation must be released exactly once.
#[derive(Debug, Clone)]
#[must_use = "a reservation token must be passed to release once the call completes"]
pub struct ReservationToken {
    pub(crate) application: Vec<Reservation>,
    pub(crate) operation: Vec<Reservation>,
}

impl ReservationToken {
    pub(crate) fn new(application: Vec<Reservation>, operation: Vec<Reservation>) -> Self {
        Self {
            application,
            operation,
        }
    }

    pub fn application(&self) -> &[Reservation] {
        &self.application
    }

    pub fn operation(&self) -> &[Reservation] {
        &self.operation
    }

    /// Window ids per scope: `(application, operation)`.
    pub fn window_ids(&self) -> (Vec<u64>, Vec<u64>) {
        (
            self.application.iter().map(Reservation::window_id).collect(),
            self.operation.iter().map(Reservation::window_id).collect(),
        )
    }
}
