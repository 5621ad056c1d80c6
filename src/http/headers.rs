//! Rate limit header extraction.
//!
//! The server advertises its limits in two list headers, one per scope,
//! formatted as `"limit:seconds,limit:seconds"`, and reports its clock in the
//! standard `Date` header. Parsing failures never reach the limiter: limits
//! fall back to "none advertised" and the timestamp to the local clock.

use chrono::DateTime;
use http::header::{HeaderMap, HeaderValue, DATE};
use tracing::debug;

use crate::error::{RatewardenError, Result};
use crate::ratelimit::{parse_limit_list, Clock, ServerLimits};

/// Application-scope limits header.
pub const APP_RATE_LIMIT_HEADER: &str = "x-app-rate-limit";
/// Operation-scope limits header.
pub const METHOD_RATE_LIMIT_HEADER: &str = "x-method-rate-limit";

/// Parse both limit headers.
///
/// Returns `Ok(None)` unless both headers are present. A present but empty
/// or malformed list is an error.
pub fn parse_limits(headers: &HeaderMap) -> Result<Option<ServerLimits>> {
    let (Some(application), Some(method)) = (
        headers.get(APP_RATE_LIMIT_HEADER),
        headers.get(METHOD_RATE_LIMIT_HEADER),
    ) else {
        return Ok(None);
    };

    let application = parse_limit_list(header_str(APP_RATE_LIMIT_HEADER, application)?)?;
    let method = parse_limit_list(header_str(METHOD_RATE_LIMIT_HEADER, method)?)?;
    Ok(Some(ServerLimits::from_rules(&application, &method)))
}

fn header_str<'a>(name: &str, value: &'a HeaderValue) -> Result<&'a str> {
    value
        .to_str()
        .map_err(|e| RatewardenError::InvalidLimit(format!("{}: {}", name, e)))
}

/// Limits advertised by a response, or `None` when there is no response,
/// the headers are missing, or they are malformed.
pub fn extract_limits(headers: Option<&HeaderMap>) -> Option<ServerLimits> {
    match parse_limits(headers?) {
        Ok(limits) => limits,
        Err(e) => {
            debug!(error = %e, "Ignoring malformed rate limit headers");
            None
        }
    }
}

/// Parse an HTTP date (`Tue, 15 Nov 1994 08:12:31 GMT`) into epoch seconds.
pub fn parse_http_date(value: &str) -> Result<i64> {
    DateTime::parse_from_rfc2822(value.trim())
        .map(|date| date.timestamp())
        .map_err(|e| RatewardenError::InvalidDate(format!("{:?}: {}", value, e)))
}

/// When the server processed the call: the response's `Date` header, or
/// the local clock when there is no response or the header is unusable.
pub fn extract_timestamp(headers: Option<&HeaderMap>, clock: &dyn Clock) -> i64 {
    let Some(date) = headers.and_then(|h| h.get(DATE)) else {
        return clock.now();
    };

    let parsed = date
        .to_str()
        .map_err(|e| RatewardenError::InvalidDate(e.to_string()))
        .and_then(parse_http_date);
    match parsed {
        Ok(timestamp) => timestamp,
        Err(e) => {
            debug!(error = %e, "Falling back to local clock");
            clock.now()
        }
    }
}
