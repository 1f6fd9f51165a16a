//! Interpretation of server wait hints
//!
//! `Retry-After` is either delta-seconds or an HTTP date. `X-RateLimit-Reset`
//! is either seconds until reset or, for values that look like a Unix
//! timestamp, the reset instant itself.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};

/// Values at or above this are read as epoch seconds rather than a delta.
const EPOCH_THRESHOLD: f64 = 1_000_000_000.0;

/// Upper bound on any parsed wait hint; larger values are clamped to it.
pub const MAX_WAIT_HINT: Duration = Duration::from_secs(24 * 60 * 60);

pub const RETRY_AFTER: &str = "retry-after";
pub const RATE_LIMIT_RESET: &str = "x-ratelimit-reset";
pub const RATE_LIMIT_REMAINING: &str = "x-ratelimit-remaining";

/// Parse a `Retry-After` value relative to `now`.
///
/// Dates in the past yield a zero wait. Unparseable values yield `None`.
pub fn parse_retry_after(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<f64>() {
        return seconds(secs);
    }

    let at = DateTime::parse_from_rfc2822(value).ok()?.with_timezone(&Utc);
    Some(clamp((at - now).to_std().unwrap_or(Duration::ZERO)))
}

/// Parse an `X-RateLimit-Reset` value relative to `now`.
pub fn parse_rate_limit_reset(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let raw = value.trim().parse::<f64>().ok()?;
    if !raw.is_finite() || raw < 0.0 {
        return None;
    }

    if raw >= EPOCH_THRESHOLD {
        let now_secs = now.timestamp_millis() as f64 / 1000.0;
        return seconds((raw - now_secs).max(0.0));
    }
    seconds(raw)
}

/// Non-negative finite seconds as a wait, clamped to [`MAX_WAIT_HINT`]
fn seconds(secs: f64) -> Option<Duration> {
    if !secs.is_finite() || secs < 0.0 {
        return None;
    }
    Some(Duration::try_from_secs_f64(secs).map_or(MAX_WAIT_HINT, clamp))
}

fn clamp(wait: Duration) -> Duration {
    wait.min(MAX_WAIT_HINT)
}

/// Wait hint carried by a response, `Retry-After` taking precedence.
///
/// `headers` must be keyed by lowercase header names.
pub fn wait_hint(headers: &HashMap<String, String>, now: DateTime<Utc>) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|value| parse_retry_after(value, now))
        .or_else(|| headers.get(RATE_LIMIT_RESET).and_then(|value| parse_rate_limit_reset(value, now)))
}

/// Whether the server reported an exhausted quota.
pub fn quota_exhausted(headers: &HashMap<String, String>) -> bool {
    headers
        .get(RATE_LIMIT_REMAINING)
        .and_then(|value| value.trim().parse::<f64>().ok())
        .is_some_and(|remaining| remaining <= 0.0)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2015, 10, 21, 7, 28, 0).single().expect("valid timestamp")
    }

    #[test]
    fn retry_after_delta_seconds() {
        assert_eq!(parse_retry_after("120", now()), Some(Duration::from_secs(120)));
        assert_eq!(parse_retry_after(" 1.5 ", now()), Some(Duration::from_millis(1500)));
        assert_eq!(parse_retry_after("-3", now()), None);
        assert_eq!(parse_retry_after("soon", now()), None);
    }

    #[test]
    fn retry_after_http_date() {
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:28:30 GMT", now()),
            Some(Duration::from_secs(30))
        );
        assert_eq!(
            parse_retry_after("Wed, 21 Oct 2015 07:00:00 GMT", now()),
            Some(Duration::ZERO),
            "past dates mean retry now"
        );
    }

    #[test]
    fn rate_limit_reset_delta_and_epoch() {
        assert_eq!(parse_rate_limit_reset("30", now()), Some(Duration::from_secs(30)));

        let epoch = now().timestamp() + 45;
        assert_eq!(parse_rate_limit_reset(&epoch.to_string(), now()), Some(Duration::from_secs(45)));

        let past = now().timestamp() - 10;
        assert_eq!(parse_rate_limit_reset(&past.to_string(), now()), Some(Duration::ZERO));
        assert_eq!(parse_rate_limit_reset("nope", now()), None);
    }

    #[test]
    fn oversized_hints_are_clamped() {
        assert_eq!(parse_retry_after("10000000000000000000", now()), Some(MAX_WAIT_HINT));
        assert_eq!(parse_retry_after("1e30", now()), Some(MAX_WAIT_HINT));
        assert_eq!(parse_retry_after("Fri, 31 Dec 9999 23:59:59 GMT", now()), Some(MAX_WAIT_HINT));
        assert_eq!(parse_rate_limit_reset("1e300", now()), Some(MAX_WAIT_HINT));
        assert_eq!(parse_rate_limit_reset("86399", now()), Some(Duration::from_secs(86_399)));
    }

    #[test]
    fn retry_after_wins_over_reset() {
        let mut headers = HashMap::new();
        headers.insert(RATE_LIMIT_RESET.to_string(), "90".to_string());
        assert_eq!(wait_hint(&headers, now()), Some(Duration::from_secs(90)));

        headers.insert(RETRY_AFTER.to_string(), "5".to_string());
        assert_eq!(wait_hint(&headers, now()), Some(Duration::from_secs(5)));

        assert_eq!(wait_hint(&HashMap::new(), now()), None);
    }

    #[test]
    fn detects_exhausted_quota() {
        let mut headers = HashMap::new();
        assert!(!quota_exhausted(&headers));
        headers.insert(RATE_LIMIT_REMAINING.to_string(), "3".to_string());
        assert!(!quota_exhausted(&headers));
        headers.insert(RATE_LIMIT_REMAINING.to_string(), "0".to_string());
        assert!(quota_exhausted(&headers));
    }
}
