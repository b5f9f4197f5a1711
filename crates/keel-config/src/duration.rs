//! Human-readable durations for configuration files.
//!
//! [`ConfigDuration`] stores signed milliseconds so that a negative value in a
//! file survives decoding and is rejected by validation with a field name,
//! instead of failing the whole parse.
//!
//! | Input | Value |
//! |-------|-------|
//! | `250` | 250ms |
//! | `"250ms"` | 250ms |
//! | `"30s"` | 30s |
//! | `"5m"` | 5 minutes |
//! | `"1h"` | 1 hour |
//! | `-1` | invalid, kept for validation |

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

const MS_PER_SECOND: i64 = 1_000;
const MS_PER_MINUTE: i64 = 60 * MS_PER_SECOND;
const MS_PER_HOUR: i64 = 60 * MS_PER_MINUTE;

/// Signed millisecond duration with unit-suffixed text form.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConfigDuration(i64);

impl ConfigDuration {
    /// Zero.
    pub const ZERO: Self = Self(0);

    /// From milliseconds.
    pub const fn from_millis(ms: i64) -> Self {
        Self(ms)
    }

    /// From seconds.
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs * MS_PER_SECOND)
    }

    /// From minutes.
    pub const fn from_mins(mins: i64) -> Self {
        Self(mins * MS_PER_MINUTE)
    }

    /// Milliseconds, possibly negative.
    pub const fn as_millis(self) -> i64 {
        self.0
    }

    /// True for values below zero.
    pub const fn is_negative(self) -> bool {
        self.0 < 0
    }

    /// True for zero.
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Converts to a [`Duration`]; negative values clamp to zero.
    pub fn to_std(self) -> Duration {
        Duration::from_millis(u64::try_from(self.0).unwrap_or(0))
    }
}

impl From<Duration> for ConfigDuration {
    fn from(d: Duration) -> Self {
        Self(i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
    }
}

impl fmt::Display for ConfigDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ms = self.0;
        if ms == 0 {
            f.write_str("0s")
        } else if ms % MS_PER_HOUR == 0 {
            write!(f, "{}h", ms / MS_PER_HOUR)
        } else if ms % MS_PER_MINUTE == 0 {
            write!(f, "{}m", ms / MS_PER_MINUTE)
        } else if ms % MS_PER_SECOND == 0 {
            write!(f, "{}s", ms / MS_PER_SECOND)
        } else {
            write!(f, "{ms}ms")
        }
    }
}

/// Error returned for malformed duration text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseDurationError(String);

impl fmt::Display for ParseDurationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid duration '{}': expected an integer with optional ms/s/m/h suffix",
            self.0
        )
    }
}

impl std::error::Error for ParseDurationError {}

impl FromStr for ConfigDuration {
    type Err = ParseDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim();
        let err = || ParseDurationError(s.to_string());
        let (number, unit) = match text.find(|c: char| c.is_ascii_alphabetic()) {
            Some(idx) => text.split_at(idx),
            None => (text, "ms"),
        };
        let value: i64 = number.trim().parse().map_err(|_| err())?;
        let factor = match unit {
            "ms" => 1,
            "s" => MS_PER_SECOND,
            "m" => MS_PER_MINUTE,
            "h" => MS_PER_HOUR,
            _ => return Err(err()),
        };
        value.checked_mul(factor).map(Self).ok_or_else(err)
    }
}

impl Serialize for ConfigDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ConfigDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct DurationVisitor;

        impl Visitor<'_> for DurationVisitor {
            type Value = ConfigDuration;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("milliseconds or a string such as \"30s\"")
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
                Ok(ConfigDuration(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
                i64::try_from(v)
                    .map(ConfigDuration)
                    .map_err(|_| E::custom("duration out of range"))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
                v.parse().map_err(E::custom)
            }
        }

        deserializer.deserialize_any(DurationVisitor)
    }
}
