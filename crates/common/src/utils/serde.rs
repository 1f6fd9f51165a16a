//! Serialization utilities for common data types
//!
//! Configuration files express time budgets either as fractional seconds
//! (`initial_delay = 0.5`) or as whole milliseconds. These modules plug into
//! `#[serde(with = "...")]`.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer};

/// Serde serialization result type
type SerializeResult<S> = Result<<S as Serializer>::Ok, <S as Serializer>::Error>;

/// Custom serialization module for Duration as milliseconds
///
/// # Usage
/// ```rust
/// use std::time::Duration;
///
/// use conduit_common::duration_millis;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Example {
///     #[serde(with = "duration_millis")]
///     timeout: Duration,
/// }
/// ```
pub mod duration_millis {
    use super::*;

    /// Serialize a Duration as milliseconds (u64)
    pub fn serialize<S>(duration: &Duration, serializer: S) -> SerializeResult<S>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    /// Deserialize milliseconds (u64) into a Duration
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Custom serialization module for Duration as fractional seconds
///
/// Accepts integers and floats on input; negative, NaN, or infinite values
/// are rejected.
///
/// # Usage
/// ```rust
/// use std::time::Duration;
///
/// use conduit_common::duration_secs;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Example {
///     #[serde(with = "duration_secs")]
///     window: Duration,
/// }
///
/// let parsed: Example = serde_json::from_str(r#"{"window":1.5}"#).unwrap();
/// assert_eq!(parsed.window, Duration::from_millis(1500));
/// ```
pub mod duration_secs {
    use serde::de::Error as _;

    use super::*;

    /// Serialize a Duration as seconds (f64)
    pub fn serialize<S>(duration: &Duration, serializer: S) -> SerializeResult<S>
    where
        S: Serializer,
    {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    /// Deserialize seconds (f64) into a Duration
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs)
            .map_err(|_| D::Error::custom(format!("invalid duration in seconds: {secs}")))
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};

    use super::*;

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Timeouts {
        #[serde(with = "duration_millis")]
        poll: Duration,
        #[serde(with = "duration_secs")]
        window: Duration,
    }

    /// Tests that both helpers serialize to their numeric representation
    #[test]
    fn test_duration_serialize() {
        let data =
            Timeouts { poll: Duration::from_millis(1500), window: Duration::from_millis(2500) };

        let json = serde_json::to_string(&data).expect("Should serialize valid struct");
        assert!(json.contains("\"poll\":1500"), "Should contain milliseconds value: {json}");
        assert!(json.contains("\"window\":2.5"), "Should contain seconds value: {json}");
    }

    /// Tests that integer seconds are accepted as well as floats
    #[test]
    fn test_duration_secs_accepts_integers() {
        let data: Timeouts =
            serde_json::from_str(r#"{"poll":10,"window":60}"#).expect("Should deserialize");

        assert_eq!(data.poll, Duration::from_millis(10));
        assert_eq!(data.window, Duration::from_secs(60));
    }

    #[test]
    fn test_duration_secs_rejects_negative() {
        let result: Result<Timeouts, _> = serde_json::from_str(r#"{"poll":10,"window":-1.0}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_duration_millis_deserialize_invalid_json() {
        let invalid_json = r#"{"poll":"not_a_number","window":1}"#;
        let result: Result<Timeouts, _> = serde_json::from_str(invalid_json);
        assert!(result.is_err());
    }
}
