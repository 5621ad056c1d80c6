//! Admission control trait the HTTP glue is written against.

use async_trait::async_trait;

use super::limiter::LimiterRegistry;
use super::rules::ServerLimits;
use super::token::ReservationToken;

/// Trait for admission control implementations.
///
/// This abstracts the limiter registry so request wrappers can be tested
/// or run against an alternative admission policy.
#[async_trait]
pub trait AdmissionControl: Send + Sync {
    /// Wait until a call of `operation` may be sent.
    async fn acquire(&self, operation: &str) -> ReservationToken;

    /// Report that the call admitted by `token` has completed.
    async fn release(
        &self,
        operation: &str,
        token: ReservationToken,
        timestamp: i64,
        limits: Option<ServerLimits>,
    );

    /// Whether calls are currently being held back.
    fn is_throttling(&self) -> bool;
}

#[async_trait]
impl AdmissionControl for LimiterRegistry {
    async fn acquire(&self, operation: &str) -> ReservationToken {
        LimiterRegistry::acquire(self, operation).await
    }

    async fn release(
        &self,
        operation: &str,
        token: ReservationToken,
        timestamp: i64,
        limits: Option<ServerLimits>,
    ) {
        LimiterRegistry::release(self, operation, token, timestamp, limits).await
    }

    fn is_throttling(&self) -> bool {
        self.is_any_limiter_blocking()
    }
}
