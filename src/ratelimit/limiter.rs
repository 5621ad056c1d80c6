//! Core limiter registry.
//!
//! A [`LimiterRegistry`] holds every window counter for one target: the
//! application-wide scope group plus one group per operation name. It fans
//! `acquire` out over the counters a call must pass, and reconciles them with
//! the limits the server advertises when `release` is called.

use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, trace};

use crate::config::LimiterConfig;

use super::clock::{system_clock, SharedClock};
use super::counter::CounterSnapshot;
use super::group::ScopeGroup;
use super::rules::{LimitRule, ServerLimits};
use super::token::{Reservation, ReservationToken};

/// Name of the application-wide scope, used for diagnostics.
pub const APPLICATION_SCOPE: &str = "application";

/// The rate limit state for one target.
///
/// This struct is thread-safe and is meant to be shared (behind an `Arc`)
/// by every client talking to the same target.
#[derive(Debug)]
pub struct LimiterRegistry {
    target: String,
    config: LimiterConfig,
    clock: SharedClock,
    /// Application-wide windows
    application: ScopeGroup,
    /// Windows per operation name, created on first use
    operations: DashMap<String, Arc<ScopeGroup>>,
}

/// Serializable view of a registry, for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct RegistrySnapshot {
    pub target: String,
    pub application: Vec<CounterSnapshot>,
    pub operations: BTreeMap<String, Vec<CounterSnapshot>>,
    pub blocking: bool,
}

impl LimiterRegistry {
    /// Create a registry on the system clock.
    pub fn new(target: impl Into<String>, config: LimiterConfig) -> Self {
        Self::with_clock(target, config, system_clock())
    }

    /// Create a registry reading time from `clock`.
    pub fn with_clock(target: impl Into<String>, config: LimiterConfig, clock: SharedClock) -> Self {
        let target = target.into();
        let application = ScopeGroup::with_rules(
            APPLICATION_SCOPE,
            &config.application,
            clock.clone(),
            config.poll_interval(),
        );

        let operations = DashMap::new();
        for (operation, rules) in &config.operations {
            let group = ScopeGroup::with_rules(
                operation.clone(),
                rules,
                clock.clone(),
                config.poll_interval(),
            );
            operations.insert(operation.clone(), Arc::new(group));
        }

        info!(
            target_key = %target,
            application_limits = ?config.application,
            operations = config.operations.len(),
            "Created limiter registry"
        );

        Self {
            target,
            config,
            clock,
            application,
            operations,
        }
    }

    /// The target this registry limits.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Reserve capacity for one call of `operation`.
    ///
    /// Waits on every application counter, then on every counter of the
    /// operation's group. An operation seen for the first time gets the
    /// configured default window. Never fails; it only delays.
    pub async fn acquire(&self, operation: &str) -> ReservationToken {
        trace!(target_key = %self.target, operation, "Acquiring reservation");

        let application = self.application.reserve().await;
        let reservations = self
            .existing_or_empty_group(operation)
            .reserve_or_default(self.config.unknown_operation)
            .await;

        trace!(target_key = %self.target, operation, "Reservation acquired");
        ReservationToken::new(application, reservations)
    }

    /// Settle a reservation once its call has completed.
    ///
    /// `timestamp` is the server's processing time in epoch seconds. With no
    /// `limits` (the call failed before a response arrived) every reserved
    /// counter is acknowledged as is. Otherwise each scope is reconciled
    /// against the advertised windows: matching counters adopt the server
    /// limit, counters the server no longer mentions are dropped and new
    /// windows are added.
    pub async fn release(
        &self,
        operation: &str,
        token: ReservationToken,
        timestamp: i64,
        limits: Option<ServerLimits>,
    ) {
        let ReservationToken {
            application,
            operation: reservations,
        } = token;

        match limits {
            None => {
                trace!(target_key = %self.target, operation, timestamp, "Releasing without server limits");
                for reservation in application.iter().chain(reservations.iter()) {
                    reservation
                        .counter()
                        .acknowledge(reservation.window_id(), timestamp, None)
                        .await;
                }
            }
            Some(limits) => {
                trace!(target_key = %self.target, operation, timestamp, ?limits, "Releasing with server limits");
                reconcile(&self.application, &application, timestamp, limits.application).await;

                let group = self.existing_or_empty_group(operation);
                reconcile(&group, &reservations, timestamp, limits.operation).await;
            }
        }
    }

    /// Set the application limit for a window, creating the window if needed.
    pub fn update_application_limit(&self, duration: u64, limit: u64) {
        self.application.update_limit(duration, limit);
    }

    /// Drop the application window of `duration`, if configured.
    pub fn delete_application_limit(&self, duration: u64) -> bool {
        self.application.delete_limit(duration)
    }

    /// Set an operation's limit for a window, creating the window (and the
    /// operation's group) if needed.
    pub fn update_operation_limit(&self, operation: &str, duration: u64, limit: u64) {
        self.existing_or_empty_group(operation)
            .update_limit(duration, limit);
    }

    /// Drop an operation's window of `duration`, if configured.
    pub fn delete_operation_limit(&self, operation: &str, duration: u64) -> bool {
        match self.operations.get(operation) {
            Some(group) => group.delete_limit(duration),
            None => false,
        }
    }

    /// Whether any reservation for this target is currently waiting for capacity.
    pub fn is_any_limiter_blocking(&self) -> bool {
        self.application.is_blocking() || self.operations.iter().any(|g| g.is_blocking())
    }

    /// Configured application windows.
    pub fn application_rules(&self) -> Vec<LimitRule> {
        self.application.rules()
    }

    /// Configured windows of `operation`, if it has a group.
    pub fn operation_rules(&self, operation: &str) -> Option<Vec<LimitRule>> {
        self.operations.get(operation).map(|g| g.rules())
    }

    /// Names of every operation with a group, sorted.
    pub fn operation_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.operations.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Number of operation groups.
    pub fn operation_count(&self) -> usize {
        self.operations.len()
    }

    /// Capture every counter of the registry.
    pub fn snapshot(&self) -> RegistrySnapshot {
        let operations = self
            .operations
            .iter()
            .map(|e| (e.key().clone(), e.value().snapshot()))
            .collect();

        RegistrySnapshot {
            target: self.target.clone(),
            application: self.application.snapshot(),
            operations,
            blocking: self.is_any_limiter_blocking(),
        }
    }

    fn existing_or_empty_group(&self, operation: &str) -> Arc<ScopeGroup> {
        if let Some(group) = self.operations.get(operation) {
            return group.clone();
        }

        self.operations
            .entry(operation.to_string())
            .or_insert_with(|| {
                debug!(target_key = %self.target, operation, "Creating operation group");
                Arc::new(ScopeGroup::with_rules(
                    operation,
                    &[],
                    self.clock.clone(),
                    self.config.poll_interval(),
                ))
            })
            .clone()
    }
}

/// Bring one scope in line with the windows the server advertised.
async fn reconcile(
    group: &ScopeGroup,
    reservations: &[Reservation],
    timestamp: i64,
    mut advertised: BTreeMap<u64, u64>,
) {
    let mut settled = Vec::with_capacity(reservations.len());
    let mut stale = Vec::new();

    for counter in group.counters() {
        match advertised.remove(&counter.duration()) {
            Some(limit) => match reservations.iter().find(|r| r.is_for(&counter)) {
                Some(reservation) => {
                    counter
                        .acknowledge(reservation.window_id(), timestamp, Some(limit))
                        .await;
                    settled.push(counter);
                }
                // Added after this call was admitted: nothing to acknowledge.
                None => counter.update_limit(limit),
            },
            None => stale.push(counter.duration()),
        }
    }

    // Reservations on windows that are about to go, or are already gone,
    // still hold capacity that reservers parked on those counters wait for.
    for reservation in reservations
        .iter()
        .filter(|r| !settled.iter().any(|c| r.is_for(c)))
    {
        reservation
            .counter()
            .acknowledge(reservation.window_id(), timestamp, None)
            .await;
    }

    for duration in stale {
        info!(scope = %group.name(), duration, "Server no longer advertises window, removing it");
        group.delete_limit(duration);
    }

    for (duration, limit) in advertised {
        info!(scope = %group.name(), duration, limit, "Server advertises new window");
        group.update_limit(duration, limit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::{Clock, TokioClock};
    use std::time::Duration;

    const T0: i64 = 1_700_000_000;

    fn registry(application: Vec<LimitRule>) -> (LimiterRegistry, Arc<TokioClock>) {
        let clock = Arc::new(TokioClock::starting_at(T0));
        let config = LimiterConfig {
            application,
            ..LimiterConfig::default()
        };
        (LimiterRegistry::with_clock("euw1", config, clock.clone()), clock)
    }

    fn limits(application: &[(u64, u64)], operation: &[(u64, u64)]) -> ServerLimits {
        ServerLimits {
            application: application.iter().copied().collect(),
            operation: operation.iter().copied().collect(),
        }
    }

    #[tokio::test]
    async fn test_registry_creation() {
        let (registry, _clock) = registry(vec![LimitRule::new(20, 1), LimitRule::new(100, 120)]);

        assert_eq!(registry.target(), "euw1");
        assert_eq!(
            registry.application_rules(),
            vec![LimitRule::new(20, 1), LimitRule::new(100, 120)]
        );
        assert_eq!(registry.operation_count(), 0);
        assert!(!registry.is_any_limiter_blocking());
    }

    #[tokio::test]
    async fn test_registry_seeds_configured_operations() {
        let clock = Arc::new(TokioClock::starting_at(T0));
        let mut config = LimiterConfig::default();
        config
            .operations
            .insert("getMatch".to_string(), vec![LimitRule::new(500, 10)]);

        let registry = LimiterRegistry::with_clock("euw1", config, clock);

        assert_eq!(registry.operation_names(), vec!["getMatch".to_string()]);
        assert_eq!(registry.operation_rules("getMatch"), Some(vec![LimitRule::new(500, 10)]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_unknown_operation_creates_default_group() {
        let (registry, _clock) = registry(vec![LimitRule::new(20, 1)]);

        let start = tokio::time::Instant::now();
        let token = registry.acquire("neverSeenOperation").await;

        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(registry.operation_count(), 1);
        assert_eq!(
            registry.operation_rules("neverSeenOperation"),
            Some(vec![LimitRule::new(20000, 10)])
        );
        assert_eq!(token.window_ids(), (vec![1], vec![1]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_without_limits_acknowledges_every_counter() {
        let (registry, clock) = registry(vec![LimitRule::new(20, 1), LimitRule::new(100, 120)]);

        let token = registry.acquire("getMatch").await;
        registry.release("getMatch", token, clock.now(), None).await;

        let snapshot = registry.snapshot();
        for counter in snapshot.application.iter().chain(snapshot.operations["getMatch"].iter()) {
            assert_eq!(counter.count, 1);
            assert_eq!(counter.currently_pending, 0);
            assert!(counter.synced);
        }
        // No server data: configuration is untouched.
        assert_eq!(registry.application_rules().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_prunes_windows_server_no_longer_advertises() {
        let (registry, clock) = registry(vec![LimitRule::new(500, 10), LimitRule::new(30000, 600)]);

        let token = registry.acquire("getMatch").await;
        registry
            .release("getMatch", token, clock.now(), Some(limits(&[(10, 450)], &[(10, 500)])))
            .await;

        assert_eq!(registry.application_rules(), vec![LimitRule::new(450, 10)]);
        assert_eq!(registry.operation_rules("getMatch"), Some(vec![LimitRule::new(500, 10)]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_adds_newly_advertised_windows() {
        let (registry, clock) = registry(vec![LimitRule::new(20, 1)]);

        let token = registry.acquire("getSummoner").await;
        registry
            .release(
                "getSummoner",
                token,
                clock.now(),
                Some(limits(&[(1, 20), (120, 100)], &[(10, 20000), (60, 600)])),
            )
            .await;

        assert_eq!(
            registry.application_rules(),
            vec![LimitRule::new(20, 1), LimitRule::new(100, 120)]
        );
        assert_eq!(
            registry.operation_rules("getSummoner"),
            Some(vec![LimitRule::new(20000, 10), LimitRule::new(600, 60)])
        );

        // The new windows start clean; only the reserved ones were acknowledged.
        let snapshot = registry.snapshot();
        assert_eq!(snapshot.application[0].count, 1);
        assert_eq!(snapshot.application[1].count, 0);
        assert_eq!(snapshot.application[1].window_id, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_operation_group_recreated_after_pruning() {
        let (registry, clock) = registry(vec![LimitRule::new(20, 1)]);

        let token = registry.acquire("getStatus").await;
        registry
            .release("getStatus", token, clock.now(), Some(limits(&[(1, 20)], &[])))
            .await;
        assert_eq!(registry.operation_rules("getStatus"), Some(vec![]));

        let token = registry.acquire("getStatus").await;
        assert_eq!(registry.operation_rules("getStatus"), Some(vec![LimitRule::new(20000, 10)]));
        assert_eq!(token.operation().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pruning_a_window_releases_parked_reservers() {
        let (registry, clock) = registry(vec![LimitRule::new(2, 1)]);
        let first = registry.acquire("getMatch").await;
        let second = registry.acquire("getMatch").await;
        tokio::time::advance(Duration::from_secs(2)).await;
        // Rolls the window: the first two become stragglers.
        let third = registry.acquire("getMatch").await;
        let pruned = third.application()[0].counter().clone();

        let mut fourth = tokio_test::task::spawn(registry.acquire("getMatch"));
        tokio_test::assert_pending!(fourth.poll());
        assert!(registry.is_any_limiter_blocking());

        for token in [first, second, third] {
            registry
                .release("getMatch", token, clock.now(), Some(limits(&[(10, 50)], &[(10, 500)])))
                .await;
        }
        assert_eq!(registry.application_rules(), vec![LimitRule::new(50, 10)]);

        let snapshot = pruned.snapshot();
        assert_eq!(snapshot.currently_pending, 0);
        assert_eq!(snapshot.previously_pending, 0);

        // The pruned window is full, so the parked reserver waits for it to end.
        assert!(fourth.is_woken());
        tokio_test::assert_pending!(fourth.poll());
        tokio::time::advance(Duration::from_secs(2)).await;
        let token = tokio_test::assert_ready!(fourth.poll());

        assert_eq!(token.operation().len(), 1);
        assert!(!registry.is_any_limiter_blocking());
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_tolerates_windows_added_after_acquire() {
        let (registry, clock) = registry(vec![LimitRule::new(20, 1)]);

        let token = registry.acquire("getMatch").await;
        registry.update_application_limit(120, 100);
        registry
            .release("getMatch", token, clock.now(), Some(limits(&[(1, 20), (120, 90)], &[(10, 500)])))
            .await;

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.application[1].limit, 90);
        assert_eq!(snapshot.application[1].count, 0);
        assert_eq!(snapshot.application[1].previously_pending, 0);
    }

    #[tokio::test]
    async fn test_update_and_delete_operation_limit() {
        let (registry, _clock) = registry(vec![]);

        registry.update_operation_limit("getMatch", 10, 500);
        registry.update_operation_limit("getMatch", 10, 400);
        registry.update_operation_limit("getMatch", 600, 3000);
        assert_eq!(
            registry.operation_rules("getMatch"),
            Some(vec![LimitRule::new(400, 10), LimitRule::new(3000, 600)])
        );

        assert!(registry.delete_operation_limit("getMatch", 10));
        assert!(!registry.delete_operation_limit("getMatch", 10));
        assert!(!registry.delete_operation_limit("unknown", 10));
        assert_eq!(registry.operation_rules("getMatch"), Some(vec![LimitRule::new(3000, 600)]));
    }

    #[tokio::test]
    async fn test_update_and_delete_application_limit() {
        let (registry, _clock) = registry(vec![]);

        registry.update_application_limit(10, 500);
        registry.update_application_limit(10, 500);
        assert_eq!(registry.application_rules(), vec![LimitRule::new(500, 10)]);

        assert!(registry.delete_application_limit(10));
        assert!(registry.application_rules().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_first_use_creates_single_group() {
        let (registry, _clock) = registry(vec![]);
        let registry = Arc::new(registry);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.acquire("getMatch").await })
            })
            .collect();
        for handle in futures::future::join_all(handles).await {
            let _token = handle.unwrap();
        }

        assert_eq!(registry.operation_count(), 1);
        assert_eq!(registry.operation_rules("getMatch"), Some(vec![LimitRule::new(20000, 10)]));
        assert_eq!(registry.snapshot().operations["getMatch"][0].count, 16);
    }

    #[tokio::test(start_paused = true)]
    async fn test_is_any_limiter_blocking() {
        let (registry, _clock) = registry(vec![LimitRule::new(1, 10)]);
        let _first = registry.acquire("getMatch").await;

        let mut second = tokio_test::task::spawn(registry.acquire("getMatch"));
        tokio_test::assert_pending!(second.poll());
        assert!(registry.is_any_limiter_blocking());
        assert!(registry.snapshot().blocking);

        drop(second);
        assert!(!registry.is_any_limiter_blocking());
    }
}
