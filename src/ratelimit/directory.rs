//! Per-target registry directory.
//!
//! Rate limits are enforced per target (a routing key such as a regional
//! host), so every client talking to the same target must share one
//! [`LimiterRegistry`]. The directory hands out that shared registry,
//! building it the first time a target is asked for.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::info;

use crate::config::LimiterConfig;

use super::clock::{system_clock, SharedClock};
use super::limiter::{LimiterRegistry, RegistrySnapshot};

/// Lazily populated map from target key to its registry.
///
/// Create one directory per process (or per independent client pool) and
/// pass it, behind an `Arc`, to every client.
#[derive(Debug)]
pub struct RegistryDirectory {
    config: LimiterConfig,
    clock: SharedClock,
    registries: DashMap<String, Arc<LimiterRegistry>>,
}

impl RegistryDirectory {
    /// Create a directory whose registries start from `config`.
    pub fn new(config: LimiterConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    /// Create a directory whose registries read time from `clock`.
    pub fn with_clock(config: LimiterConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            registries: DashMap::new(),
        }
    }

    /// The registry for `target`, built on first use.
    ///
    /// Concurrent first calls for the same target all receive the same
    /// registry.
    pub fn registry(&self, target: &str) -> Arc<LimiterRegistry> {
        if let Some(registry) = self.registries.get(target) {
            return registry.clone();
        }

        self.registries
            .entry(target.to_string())
            .or_insert_with(|| {
                info!(target_key = %target, "Creating registry for target");
                Arc::new(LimiterRegistry::with_clock(
                    target,
                    self.config.clone(),
                    self.clock.clone(),
                ))
            })
            .clone()
    }

    /// The registry for `target`, if one was already built.
    pub fn get(&self, target: &str) -> Option<Arc<LimiterRegistry>> {
        self.registries.get(target).map(|r| r.clone())
    }

    /// Known targets, sorted.
    pub fn targets(&self) -> Vec<String> {
        let mut targets: Vec<String> = self.registries.iter().map(|e| e.key().clone()).collect();
        targets.sort();
        targets
    }

    pub fn len(&self) -> usize {
        self.registries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registries.is_empty()
    }

    /// Whether any target currently has a reservation waiting for capacity.
    pub fn is_any_limiter_blocking(&self) -> bool {
        self.registries.iter().any(|r| r.is_any_limiter_blocking())
    }

    /// Snapshots of every registry, sorted by target.
    pub fn snapshot(&self) -> Vec<RegistrySnapshot> {
        let mut snapshots: Vec<RegistrySnapshot> =
            self.registries.iter().map(|r| r.snapshot()).collect();
        snapshots.sort_by(|a, b| a.target.cmp(&b.target));
        snapshots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::TokioClock;
    use crate::ratelimit::LimitRule;

    fn directory() -> RegistryDirectory {
        RegistryDirectory::with_clock(
            LimiterConfig::default(),
            Arc::new(TokioClock::starting_at(1_700_000_000)),
        )
    }

    #[tokio::test]
    async fn test_same_target_shares_registry() {
        let directory = directory();

        let first = directory.registry("euw1");
        let second = directory.registry("euw1");

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(directory.len(), 1);
    }

    #[tokio::test]
    async fn test_targets_are_independent() {
        let directory = directory();

        let euw = directory.registry("euw1");
        let na = directory.registry("na1");
        euw.update_application_limit(10, 500);

        assert!(!Arc::ptr_eq(&euw, &na));
        assert!(euw.application_rules().contains(&LimitRule::new(500, 10)));
        assert!(!na.application_rules().contains(&LimitRule::new(500, 10)));
        assert_eq!(directory.targets(), vec!["euw1".to_string(), "na1".to_string()]);
    }

    #[tokio::test]
    async fn test_get_does_not_create() {
        let directory = directory();

        assert!(directory.get("kr").is_none());
        assert!(directory.is_empty());

        directory.registry("kr");
        assert!(directory.get("kr").is_some());
    }

    #[tokio::test]
    async fn test_concurrent_first_use_builds_one_registry() {
        let directory = Arc::new(directory());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let directory = directory.clone();
                tokio::spawn(async move { directory.registry("euw1") })
            })
            .collect();

        let registries: Vec<_> = futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();

        assert_eq!(directory.len(), 1);
        assert!(registries.iter().all(|r| Arc::ptr_eq(r, &registries[0])));
    }

    #[tokio::test]
    async fn test_snapshot_sorted_by_target() {
        let directory = directory();
        directory.registry("na1");
        directory.registry("euw1");

        let targets: Vec<_> = directory.snapshot().into_iter().map(|s| s.target).collect();
        assert_eq!(targets, vec!["euw1".to_string(), "na1".to_string()]);
        assert!(!directory.is_any_limiter_blocking());
    }
}
