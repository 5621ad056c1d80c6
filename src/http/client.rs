//! Throttled call wrapper.

use http::HeaderMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, instrument};

use super::headers::{extract_limits, extract_timestamp};
use crate::ratelimit::{system_clock, AdmissionControl, LimiterRegistry, RegistryDirectory, SharedClock};

/// What a throttled call produced.
#[derive(Debug, Clone)]
pub struct CallOutcome<T> {
    /// The value handed back to the caller
    pub value: T,
    /// Response headers, or `None` when no response arrived (timeout,
    /// connection failure)
    pub headers: Option<HeaderMap>,
}

impl<T> CallOutcome<T> {
    /// A call that got a response.
    pub fn responded(value: T, headers: HeaderMap) -> Self {
        Self {
            value,
            headers: Some(headers),
        }
    }

    /// A call that failed before any response headers were received.
    pub fn failed(value: T) -> Self {
        Self {
            value,
            headers: None,
        }
    }
}

/// Runs calls through admission control.
///
/// Each call acquires a reservation for its operation, runs, then releases
/// the reservation with whatever limits and timestamp the response carried.
///
/// The future returned by [`call`](Self::call) must not be dropped once the
/// request has been sent: the reservation would never be released and its
/// capacity stays counted as in flight.
#[derive(Debug)]
pub struct ThrottledClient<A: AdmissionControl + ?Sized = LimiterRegistry> {
    admission: Arc<A>,
    clock: SharedClock,
}

impl<A: AdmissionControl + ?Sized> Clone for ThrottledClient<A> {
    fn clone(&self) -> Self {
        Self {
            admission: self.admission.clone(),
            clock: self.clock.clone(),
        }
    }
}

impl ThrottledClient<LimiterRegistry> {
    /// A client sharing `target`'s registry from `directory`.
    pub fn for_target(directory: &RegistryDirectory, target: &str) -> Self {
        Self::new(directory.registry(target))
    }
}

impl<A: AdmissionControl + ?Sized> ThrottledClient<A> {
    /// Wrap an admission controller, falling back to the system clock when
    /// a response has no usable `Date` header.
    pub fn new(admission: Arc<A>) -> Self {
        Self::with_clock(admission, system_clock())
    }

    pub fn with_clock(admission: Arc<A>, clock: SharedClock) -> Self {
        Self { admission, clock }
    }

    pub fn admission(&self) -> &Arc<A> {
        &self.admission
    }

    /// Whether calls are currently being held back.
    pub fn is_throttling(&self) -> bool {
        self.admission.is_throttling()
    }

    /// Run `send` once admission control lets `operation` through.
    #[instrument(skip(self, send))]
    pub async fn call<T, F, Fut>(&self, operation: &str, send: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CallOutcome<T>>,
    {
        let token = self.admission.acquire(operation).await;

        let CallOutcome { value, headers } = send().await;

        let limits = extract_limits(headers.as_ref());
        let timestamp = extract_timestamp(headers.as_ref(), self.clock.as_ref());
        debug!(
            responded = headers.is_some(),
            has_limits = limits.is_some(),
            timestamp,
            "Call completed"
        );

        self.admission
            .release(operation, token, timestamp, limits)
            .await;
        value
    }
}
