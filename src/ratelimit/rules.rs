//! Rate limit rules and server-advertised limits.
//!
//! A rule is a `(limit, duration)` pair: at most `limit` requests per
//! `duration` seconds. Rules come from two places: the static defaults in
//! configuration, and the limits the server advertises after each call in
//! the `"limit:seconds,limit:seconds"` list format.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use tracing::warn;

use crate::error::{RatewardenError, Result};

/// A single window configuration: `limit` requests per `duration` seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LimitRule {
    /// Maximum requests allowed in one window
    pub limit: u64,
    /// Window length in seconds
    pub duration: u64,
}

impl LimitRule {
    /// Create a new rule.
    pub fn new(limit: u64, duration: u64) -> Self {
        Self { limit, duration }
    }

    /// Check that the rule can drive a window counter.
    ///
    /// A zero duration is rejected. A zero limit is accepted but will block
    /// every reservation forever, so it is reported loudly.
    pub fn validate(&self) -> Result<()> {
        if self.duration == 0 {
            return Err(RatewardenError::InvalidLimit(format!(
                "{}: window duration must be at least one second",
                self
            )));
        }
        if self.limit == 0 {
            warn!(rule = %self, "Limit of zero will block every request on this window");
        }
        Ok(())
    }
}

impl fmt::Display for LimitRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.limit, self.duration)
    }
}

impl FromStr for LimitRule {
    type Err = RatewardenError;

    /// Parse a `limit:seconds` entry, e.g. `"100:120"`.
    fn from_str(s: &str) -> Result<Self> {
        let (limit, duration) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| RatewardenError::InvalidLimit(format!("missing ':' in {:?}", s)))?;

        let limit = limit
            .trim()
            .parse::<u64>()
            .map_err(|e| RatewardenError::InvalidLimit(format!("{:?}: {}", s, e)))?;
        let duration = duration
            .trim()
            .parse::<u64>()
            .map_err(|e| RatewardenError::InvalidLimit(format!("{:?}: {}", s, e)))?;

        let rule = LimitRule::new(limit, duration);
        rule.validate()?;
        Ok(rule)
    }
}

/// Parse a comma separated list of `limit:seconds` entries.
///
/// An empty list, or an empty entry such as a trailing comma, is rejected:
/// every advertised scope has at least one window.
pub fn parse_limit_list(value: &str) -> Result<Vec<LimitRule>> {
    if value.trim().is_empty() {
        return Err(RatewardenError::InvalidLimit("empty limit list".to_string()));
    }

    value
        .split(',')
        .map(|entry| {
            if entry.trim().is_empty() {
                Err(RatewardenError::InvalidLimit(format!(
                    "empty entry in {:?}",
                    value
                )))
            } else {
                entry.parse::<LimitRule>()
            }
        })
        .collect()
}

/// Limits advertised by the server for one response, keyed by window
/// duration (seconds) with the limit as value.
///
/// `application` applies to every call against the target, `operation`
/// only to the operation that produced the response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerLimits {
    /// Application-scope windows: duration -> limit
    #[serde(default)]
    pub application: BTreeMap<u64, u64>,
    /// Operation-scope windows: duration -> limit
    #[serde(default)]
    pub operation: BTreeMap<u64, u64>,
}

impl ServerLimits {
    /// Build server limits from two rule lists.
    ///
    /// When a duration appears twice the last entry wins.
    pub fn from_rules(application: &[LimitRule], operation: &[LimitRule]) -> Self {
        Self {
            application: to_map(application),
            operation: to_map(operation),
        }
    }
}

fn to_map(rules: &[LimitRule]) -> BTreeMap<u64, u64> {
    rules.iter().map(|r| (r.duration, r.limit)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_rule() {
        let rule: LimitRule = "100:120".parse().unwrap();
        assert_eq!(rule, LimitRule::new(100, 120));
    }

    #[test]
    fn test_parse_rule_with_whitespace() {
        let rule: LimitRule = " 20 : 1 ".parse().unwrap();
        assert_eq!(rule, LimitRule::new(20, 1));
    }

    #[test]
    fn test_parse_rule_rejects_garbage() {
        assert!("100".parse::<LimitRule>().is_err());
        assert!("abc:10".parse::<LimitRule>().is_err());
        assert!("10:-1".parse::<LimitRule>().is_err());
    }

    #[test]
    fn test_parse_rule_rejects_zero_duration() {
        let err = "10:0".parse::<LimitRule>().unwrap_err();
        assert!(matches!(err, RatewardenError::InvalidLimit(_)));
    }

    #[test]
    fn test_zero_limit_is_accepted() {
        assert_eq!("0:10".parse::<LimitRule>().unwrap(), LimitRule::new(0, 10));
    }

    #[test]
    fn test_parse_limit_list() {
        let rules = parse_limit_list("20:1,100:120").unwrap();
        assert_eq!(rules, vec![LimitRule::new(20, 1), LimitRule::new(100, 120)]);
    }

    #[test]
    fn test_parse_limit_list_rejects_empty_entries() {
        for value in ["", "  ", "500:10,", ",500:10", "20:1,,100:120"] {
            let err = parse_limit_list(value).unwrap_err();
            assert!(matches!(err, RatewardenError::InvalidLimit(_)), "{:?}", value);
        }
    }

    #[test]
    fn test_parse_limit_list_fails_on_any_bad_entry() {
        assert!(parse_limit_list("500:10,oops").is_err());
    }

    #[test]
    fn test_display_round_trips_header_format() {
        assert_eq!(LimitRule::new(30000, 600).to_string(), "30000:600");
    }

    #[test]
    fn test_server_limits_from_rules() {
        let limits = ServerLimits::from_rules(
            &[LimitRule::new(20, 1), LimitRule::new(100, 120)],
            &[LimitRule::new(500, 10)],
        );
        assert_eq!(limits.application.get(&1), Some(&20));
        assert_eq!(limits.application.get(&120), Some(&100));
        assert_eq!(limits.operation.get(&10), Some(&500));
    }

    #[test]
    fn test_server_limits_last_duplicate_wins() {
        let limits = ServerLimits::from_rules(&[LimitRule::new(5, 10), LimitRule::new(7, 10)], &[]);
        assert_eq!(limits.application.len(), 1);
        assert_eq!(limits.application[&10], 7);
    }
}
