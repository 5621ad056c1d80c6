//! Ratewarden - Client-side Rate Limit Admission Control
//!
//! This crate keeps an API consumer inside the rate limits its server
//! advertises. Requests reserve capacity in fixed-duration windows before
//! they are sent, and each response reconciles the local windows with the
//! server's clock and its currently advertised limits.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
pub mod simulate;
