//! Shared serde helpers for configuration files

/// Durations written as whole seconds.
///
/// Serializes as an integer number of seconds. Deserializes either an integer
/// (`idle_timeout = 10`) or a suffixed string (`"500ms"`, `"10s"`, `"2m"`,
/// `"1h"`).
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct Config {
///     #[serde(with = "sr_core::config::serde_utils::duration_secs")]
///     timeout: Duration,
/// }
/// ```
pub mod duration_secs {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Text(String),
    }

    /// Serialize a Duration as seconds
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    /// Deserialize a Duration from seconds or a suffixed string
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Raw::deserialize(deserializer)? {
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(text) => parse(&text).map_err(D::Error::custom),
        }
    }

    /// Parse `"<n>ms"`, `"<n>s"`, `"<n>m"`, `"<n>h"` or a bare number of seconds
    pub fn parse(text: &str) -> Result<Duration, String> {
        let text = text.trim();
        let split = text
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(text.len());
        let (digits, unit) = text.split_at(split);

        let value: u64 = digits
            .parse()
            .map_err(|_| format!("invalid duration '{}'", text))?;

        match unit.trim() {
            "ms" => Ok(Duration::from_millis(value)),
            "" | "s" => Ok(Duration::from_secs(value)),
            "m" => Ok(Duration::from_secs(value * 60)),
            "h" => Ok(Duration::from_secs(value * 3600)),
            other => Err(format!("unknown duration unit '{}' in '{}'", other, text)),
        }
    }
}
