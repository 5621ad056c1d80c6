//! In-process simulation of a rate limited API.
//!
//! Drives a [`ThrottledClient`] against a [`SimulatedServer`] that enforces
//! its own windows and advertises them in response headers, so limiter
//! behaviour can be observed without a network.

use chrono::{TimeZone, Utc};
use futures::stream::{self, StreamExt};
use http::header::{HeaderMap, HeaderValue, DATE};
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{RatewardenError, Result};
use crate::http::{CallOutcome, ThrottledClient, APP_RATE_LIMIT_HEADER, METHOD_RATE_LIMIT_HEADER};
use crate::ratelimit::{LimitRule, SharedClock};

const HTTP_DATE_FORMAT: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Status returned for an admitted request.
pub const STATUS_OK: u16 = 200;
/// Status returned when the simulated server rejects a request.
pub const STATUS_TOO_MANY_REQUESTS: u16 = 429;

/// One enforced window on the server side. It opens on the first request
/// after the previous one ended.
#[derive(Debug)]
struct ServerWindow {
    rule: LimitRule,
    start: i64,
    count: u64,
}

impl ServerWindow {
    fn new(rule: LimitRule) -> Self {
        Self {
            rule,
            start: i64::MIN,
            count: 0,
        }
    }

    /// Count a request at `now`. Returns false if it exceeds the window.
    fn admit(&mut self, now: i64) -> bool {
        if now.saturating_sub(self.start) >= self.rule.duration as i64 {
            self.start = now;
            self.count = 0;
        }
        self.count += 1;
        self.count <= self.rule.limit
    }
}

/// A fake API server for one operation.
#[derive(Debug)]
pub struct SimulatedServer {
    application_header: HeaderValue,
    method_header: HeaderValue,
    windows: Mutex<Vec<ServerWindow>>,
    latency: Duration,
    clock: SharedClock,
}

impl SimulatedServer {
    pub fn new(
        application: &[LimitRule],
        method: &[LimitRule],
        latency: Duration,
        clock: SharedClock,
    ) -> Result<Self> {
        let windows = application
            .iter()
            .chain(method.iter())
            .copied()
            .map(ServerWindow::new)
            .collect();

        Ok(Self {
            application_header: header_value(application)?,
            method_header: header_value(method)?,
            windows: Mutex::new(windows),
            latency,
            clock,
        })
    }

    /// Handle one request: wait a jittered latency, enforce the windows and
    /// answer with the limit and `Date` headers.
    pub async fn handle(&self) -> CallOutcome<u16> {
        let jitter = self.jittered_latency();
        tokio::time::sleep(jitter).await;

        let now = self.clock.now();
        let admitted = {
            let mut windows = self.windows.lock();
            // Every window counts the request, even once one has rejected it.
            windows
                .iter_mut()
                .fold(true, |admitted, window| window.admit(now) && admitted)
        };

        let status = if admitted {
            STATUS_OK
        } else {
            warn!(timestamp = now, "Simulated server rejected request");
            STATUS_TOO_MANY_REQUESTS
        };

        let mut headers = HeaderMap::new();
        headers.insert(APP_RATE_LIMIT_HEADER, self.application_header.clone());
        headers.insert(METHOD_RATE_LIMIT_HEADER, self.method_header.clone());
        let date = Utc
            .timestamp_opt(now, 0)
            .single()
            .and_then(|date| HeaderValue::try_from(date.format(HTTP_DATE_FORMAT).to_string()).ok());
        if let Some(date) = date {
            headers.insert(DATE, date);
        }
        CallOutcome::responded(status, headers)
    }

    fn jittered_latency(&self) -> Duration {
        let max = self.latency.as_millis() as u64;
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(max / 2..=max))
    }
}

fn header_value(rules: &[LimitRule]) -> Result<HeaderValue> {
    let list = rules
        .iter()
        .map(LimitRule::to_string)
        .collect::<Vec<_>>()
        .join(",");
    HeaderValue::try_from(list).map_err(|e| RatewardenError::InvalidLimit(e.to_string()))
}

/// Outcome of a simulation run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SimulationReport {
    pub requests: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub elapsed_ms: u128,
}

/// Send `requests` calls of `operation` through `client`, at most
/// `concurrency` at a time.
pub async fn run(
    client: &ThrottledClient,
    server: &SimulatedServer,
    operation: &str,
    requests: usize,
    concurrency: usize,
) -> SimulationReport {
    info!(operation, requests, concurrency, "Starting simulation");
    let started = Instant::now();

    let statuses: Vec<u16> = stream::iter(0..requests)
        .map(|i| async move {
            let status = client.call(operation, || server.handle()).await;
            debug!(request = i, status, "Request finished");
            status
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    let accepted = statuses.iter().filter(|s| **s == STATUS_OK).count();
    let report = SimulationReport {
        requests,
        accepted,
        rejected: statuses.len() - accepted,
        elapsed_ms: started.elapsed().as_millis(),
    };
    info!(?report, "Simulation finished");
    report
}
