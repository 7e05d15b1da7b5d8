//! Serde helpers for configuration durations
//!
//! Durations are written as whole milliseconds so configuration files stay
//! plain integers (`timeout_ms = 2000`).

/// Serialize and deserialize a `Duration` as milliseconds (u64)
///
/// ```rust
/// use std::time::Duration;
///
/// use bulwark_resilience::config::duration_millis;
/// use serde::Serialize;
///
/// #[derive(Serialize)]
/// struct Budget {
///     #[serde(with = "duration_millis")]
///     timeout_ms: Duration,
/// }
///
/// # let _ = Budget { timeout_ms: Duration::from_millis(1500) };
/// ```
pub mod duration_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    /// Serde serialization result type
    type SerializeResult<S> = Result<<S as Serializer>::Ok, <S as Serializer>::Error>;

    /// Serialize a Duration as milliseconds, saturating at `u64::MAX`
    pub fn serialize<S>(duration: &Duration, serializer: S) -> SerializeResult<S>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    /// Deserialize milliseconds into a Duration
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }

    /// Same encoding for optional durations
    #[cfg(feature = "config")]
    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer};

        /// Deserialize optional milliseconds into an optional Duration
        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
        }
    }
}
