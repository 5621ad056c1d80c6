//! Rate limiting logic and state management.

mod backend;
mod clock;
mod counter;
mod directory;
mod group;
mod limiter;
mod rules;
mod token;

pub use backend::AdmissionControl;
pub use clock::{system_clock, Clock, SharedClock, SystemClock, TokioClock};
pub use counter::{CounterSnapshot, WindowCounter, DEFAULT_POLL_INTERVAL};
pub use directory::RegistryDirectory;
pub use group::ScopeGroup;
pub use limiter::{LimiterRegistry, RegistrySnapshot, APPLICATION_SCOPE};
pub use rules::{parse_limit_list, LimitRule, ServerLimits};
pub use token::{Reservation, ReservationToken};
