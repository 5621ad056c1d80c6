//! Scope groups: the window counters sharing one rate limit scope.

use parking_lot::{RwLock, RwLockUpgradableReadGuard};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::clock::SharedClock;
use super::counter::{CounterSnapshot, WindowCounter, DEFAULT_POLL_INTERVAL};
use super::rules::LimitRule;
use super::token::Reservation;

/// An ordered set of window counters for one scope, at most one per duration.
///
/// A request must pass every counter in the group. Counters are kept in
/// insertion order, which is the order reservations are taken in.
#[derive(Debug)]
pub struct ScopeGroup {
    name: String,
    clock: SharedClock,
    poll_interval: Duration,
    counters: RwLock<Vec<Arc<WindowCounter>>>,
}

impl ScopeGroup {
    /// Create an empty group.
    pub fn new(name: impl Into<String>, clock: SharedClock) -> Self {
        Self {
            name: name.into(),
            clock,
            poll_interval: DEFAULT_POLL_INTERVAL,
            counters: RwLock::new(Vec::new()),
        }
    }

    /// Create a group with one counter per rule.
    pub fn with_rules(
        name: impl Into<String>,
        rules: &[LimitRule],
        clock: SharedClock,
        poll_interval: Duration,
    ) -> Self {
        let mut group = Self::new(name, clock);
        group.poll_interval = poll_interval;
        for rule in rules {
            group.update_limit(rule.duration, rule.limit);
        }
        group
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Set `limit` on the counter for `duration`, creating the counter if
    /// the group has none for that duration.
    pub fn update_limit(&self, duration: u64, limit: u64) {
        let mut counters = self.counters.write();
        if let Some(counter) = counters.iter().find(|c| c.duration() == duration) {
            counter.update_limit(limit);
            return;
        }

        debug!(scope = %self.name, duration, limit, "Adding window counter");
        counters.push(self.new_counter(LimitRule::new(limit, duration)));
    }

    fn new_counter(&self, rule: LimitRule) -> Arc<WindowCounter> {
        let counter = WindowCounter::new(rule, self.clock.clone())
            .with_name(self.name.clone())
            .with_poll_interval(self.poll_interval);
        Arc::new(counter)
    }

    /// Remove the counter for `duration`. Returns whether one was removed.
    pub fn delete_limit(&self, duration: u64) -> bool {
        let mut counters = self.counters.write();
        let before = counters.len();
        counters.retain(|c| c.duration() != duration);
        let removed = counters.len() != before;
        if removed {
            debug!(scope = %self.name, duration, "Removed window counter");
        }
        removed
    }

    /// The group's counters, in reservation order.
    pub fn counters(&self) -> Vec<Arc<WindowCounter>> {
        self.counters.read().clone()
    }

    /// Configured windows, in reservation order.
    pub fn rules(&self) -> Vec<LimitRule> {
        self.counters
            .read()
            .iter()
            .map(|c| LimitRule::new(c.limit(), c.duration()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.counters.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.read().is_empty()
    }

    /// Reserve a slot on every counter, one after another.
    ///
    /// The counter list is captured up front so the group can be
    /// reconfigured while reservations are waiting.
    pub async fn reserve(&self) -> Vec<Reservation> {
        Self::reserve_all(self.counters()).await
    }

    /// Like [`reserve`](Self::reserve), but an empty group first gets a
    /// counter for `default`.
    ///
    /// The emptiness check and the captured counter list are taken under the
    /// same lock, so a concurrent prune can never leave the call without a
    /// window to pass.
    pub async fn reserve_or_default(&self, default: LimitRule) -> Vec<Reservation> {
        let counters = {
            let counters = self.counters.upgradable_read();
            if counters.is_empty() {
                let mut counters = RwLockUpgradableReadGuard::upgrade(counters);
                debug!(
                    scope = %self.name,
                    limit = default.limit,
                    duration = default.duration,
                    "Applying default limit to empty scope"
                );
                counters.push(self.new_counter(default));
                counters.clone()
            } else {
                counters.clone()
            }
        };
        Self::reserve_all(counters).await
    }

    async fn reserve_all(counters: Vec<Arc<WindowCounter>>) -> Vec<Reservation> {
        let mut reservations = Vec::with_capacity(counters.len());
        for counter in counters {
            let window_id = counter.reserve().await;
            reservations.push(Reservation::new(counter, window_id));
        }
        reservations
    }

    /// Whether a reservation is parked on any counter of the group.
    pub fn is_blocking(&self) -> bool {
        self.counters.read().iter().any(|c| c.is_blocking())
    }

    pub fn snapshot(&self) -> Vec<CounterSnapshot> {
        self.counters.read().iter().map(|c| c.snapshot()).collect()
    }
}
