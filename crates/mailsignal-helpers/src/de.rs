use std::time::Duration;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer};

/// Accepts either whole seconds (`3600`) or a humantime string (`"1h"`).
#[derive(Deserialize)]
#[serde(untagged)]
enum RawDuration {
    Seconds(u64),
    Text(String),
}

pub fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    match RawDuration::deserialize(deserializer)? {
        RawDuration::Seconds(secs) => Ok(Duration::from_secs(secs)),
        RawDuration::Text(value) => {
            let value = value.trim();
            if value.is_empty() {
                return Err(D::Error::custom("duration must not be empty"));
            }
            humantime::parse_duration(value).map_err(D::Error::custom)
        }
    }
}
