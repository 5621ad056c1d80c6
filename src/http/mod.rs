//! Glue between HTTP responses and the limiter.
//!
//! Transport, request construction and retry policy live with the caller;
//! this module only turns responses into the timestamp and limits the
//! limiter reconciles against.

mod client;
mod headers;

pub use client::{CallOutcome, ThrottledClient};
pub use headers::{
    extract_limits, extract_timestamp, parse_http_date, parse_limits, APP_RATE_LIMIT_HEADER,
    METHOD_RATE_LIMIT_HEADER,
};
