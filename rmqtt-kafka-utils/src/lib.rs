//! Small helpers shared by the proxy crates
//!
//! - Millisecond timestamps ([`timestamp_millis`])
//! - Human-readable durations and byte sizes for configuration (`"30s"`, `"1d12h"`, `"64K"`)
//! - Atomic statistics counters ([`Counter`])
//!
//! ```
//! use rmqtt_kafka_utils::{to_duration, Bytesize};
//!
//! assert_eq!(to_duration("1m30s").as_secs(), 90);
//! assert_eq!(Bytesize::from("64K").as_usize(), 65536);
//! ```

#![deny(unsafe_code)]

use std::fmt;
use std::time::Duration;

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

mod counter;

pub use counter::Counter;

/// Timestamp representation in milliseconds since Unix epoch
pub type TimestampMillis = i64;

/// Byte size units, largest first.
const SIZE_UNITS: &[(char, u64)] = &[('G', 1 << 30), ('M', 1 << 20), ('K', 1 << 10), ('B', 1)];

/// Duration units in milliseconds. `ms` is rewritten to `Y` before parsing.
const DURATION_UNITS: &[(char, u64)] =
    &[('w', 604_800_000), ('d', 86_400_000), ('h', 3_600_000), ('m', 60_000), ('s', 1000), ('Y', 1)];

/// Sum of `<number><unit>` segments, a segment that does not parse counts as zero.
fn sum_units(text: &str, units: &[(char, u64)]) -> u64 {
    let unit_chars: Vec<char> = units.iter().map(|(c, _)| *c).collect();
    text.split_inclusive(unit_chars.as_slice())
        .filter_map(|segment| {
            let (at, unit) = segment.char_indices().last()?;
            let factor = units.iter().find(|(c, _)| *c == unit)?.1;
            segment[..at].trim().parse::<u64>().ok().map(|n| n.saturating_mul(factor))
        })
        .fold(0u64, u64::saturating_add)
}

/// Byte size parsed from strings such as `"2M512K"`.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Bytesize(pub usize);

impl Bytesize {
    #[inline]
    pub fn as_usize(&self) -> usize {
        self.0
    }

    /// Largest units first, `"0B"` for zero.
    pub fn string(&self) -> String {
        let mut rest = self.0 as u64;
        let mut out = String::new();
        for (unit, factor) in SIZE_UNITS {
            let n = rest / factor;
            if n > 0 || (*unit == 'B' && out.is_empty()) {
                out.push_str(&format!("{n}{unit}"));
            }
            rest %= factor;
        }
        out
    }
}

impl From<usize> for Bytesize {
    fn from(v: usize) -> Self {
        Bytesize(v)
    }
}

impl From<&str> for Bytesize {
    fn from(v: &str) -> Self {
        Bytesize(to_bytesize(v))
    }
}

impl fmt::Debug for Bytesize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.string())
    }
}

impl Serialize for Bytesize {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.string())
    }
}

impl<'de> Deserialize<'de> for Bytesize {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match to_bytesize(&String::deserialize(deserializer)?) {
            0 => Err(de::Error::custom("byte size must be greater than zero")),
            v => Ok(Bytesize(v)),
        }
    }
}

/// Parse a byte size string, unknown units count as zero.
pub fn to_bytesize(text: &str) -> usize {
    let text = text.to_uppercase().replace("GB", "G").replace("MB", "M").replace("KB", "K");
    usize::try_from(sum_units(&text, SIZE_UNITS)).unwrap_or(usize::MAX)
}

pub fn deserialize_duration<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    String::deserialize(deserializer).map(|v| to_duration(&v))
}

/// Convert a duration string to [`Duration`].
///
/// Units: `ms`, `s`, `m`, `h`, `d`, `w`. Segments can be chained, e.g. `"1h30m"`.
pub fn to_duration(text: &str) -> Duration {
    Duration::from_millis(sum_units(&text.to_lowercase().replace("ms", "Y"), DURATION_UNITS))
}

/// Current time in milliseconds since Unix epoch
#[inline]
pub fn timestamp_millis() -> TimestampMillis {
    chrono::Utc::now().timestamp_millis()
}
