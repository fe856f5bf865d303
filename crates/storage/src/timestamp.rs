use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use time::format_description::well_known::Rfc3339;
use time::{OffsetDateTime, UtcOffset};

use crate::error::StorageError;

/// Years an RFC 3339 timestamp can spell with four digits.
const YEARS: std::ops::RangeInclusive<i32> = 0..=9999;

/// A UTC instant with millisecond precision.
///
/// Serialized as `YYYY-MM-DDTHH:MM:SS.mmmZ`. Construction always truncates
/// to whole milliseconds so a value survives a serialize/parse cycle
/// unchanged and compares equal afterwards. The UTC year is kept within
/// `0..=9999` for the same reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(OffsetDateTime);

impl Timestamp {
    /// The current wall-clock time.
    pub fn now() -> Self {
        Self(truncate(OffsetDateTime::now_utc()))
    }

    /// Wrap an arbitrary `OffsetDateTime`, normalizing it to UTC. Fails when
    /// the UTC year falls outside `0..=9999`.
    pub fn from_datetime(value: OffsetDateTime) -> Result<Self, StorageError> {
        Self::checked(value, || value.to_string())
    }

    fn checked(
        value: OffsetDateTime,
        raw: impl FnOnce() -> String,
    ) -> Result<Self, StorageError> {
        let utc = truncate(value.to_offset(UtcOffset::UTC));
        if !YEARS.contains(&utc.year()) {
            return Err(StorageError::InvalidTimestamp {
                value: raw(),
                message: format!("year {} is outside 0..=9999", utc.year()),
            });
        }
        Ok(Self(utc))
    }

    /// Build a timestamp from milliseconds since the Unix epoch.
    pub fn from_unix_millis(millis: i64) -> Result<Self, StorageError> {
        let nanos = i128::from(millis) * 1_000_000;
        let value = OffsetDateTime::from_unix_timestamp_nanos(nanos).map_err(|e| {
            StorageError::InvalidTimestamp {
                value: millis.to_string(),
                message: e.to_string(),
            }
        })?;
        Self::checked(value, || millis.to_string())
    }

    /// Parse an RFC 3339 string (any offset, any fractional precision).
    pub fn parse(value: &str) -> Result<Self, StorageError> {
        let parsed = OffsetDateTime::parse(value, &Rfc3339).map_err(|e| {
            StorageError::InvalidTimestamp {
                value: value.to_string(),
                message: e.to_string(),
            }
        })?;
        Self::checked(parsed, || value.to_string())
    }

    pub fn as_datetime(&self) -> OffsetDateTime {
        self.0
    }

    pub fn unix_millis(&self) -> i64 {
        (self.0.unix_timestamp_nanos() / 1_000_000) as i64
    }

    /// `YYYY-MM-DDTHH:MM:SS.mmmZ`.
    pub fn to_iso8601(&self) -> String {
        let t = self.0;
        format!(
            "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:03}Z",
            t.year(),
            t.month() as u8,
            t.day(),
            t.hour(),
            t.minute(),
            t.second(),
            t.millisecond()
        )
    }
}

fn truncate(utc: OffsetDateTime) -> OffsetDateTime {
    let millis_only = (utc.nanosecond() / 1_000_000) * 1_000_000;
    utc.replace_nanosecond(millis_only).unwrap_or(utc)
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_iso8601())
    }
}

impl FromStr for Timestamp {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_iso8601())
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_with_millisecond_precision() {
        let ts = Timestamp::parse("2026-03-04T05:06:07.123456Z").unwrap();
        assert_eq!(ts.to_iso8601(), "2026-03-04T05:06:07.123Z");
    }

    #[test]
    fn normalizes_offsets_to_utc() {
        let ts = Timestamp::parse("2026-03-04T07:06:07+02:00").unwrap();
        assert_eq!(ts.to_string(), "2026-03-04T05:06:07.000Z");
    }

    #[test]
    fn serde_uses_iso_string() {
        let ts = Timestamp::from_unix_millis(1_700_000_000_250).unwrap();
        let json = serde_json::to_string(&ts).unwrap();
        assert_eq!(json, "\"2023-11-14T22:13:20.250Z\"");
        let back: Timestamp = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ts);
    }

    #[test]
    fn rejects_garbage() {
        match Timestamp::parse("yesterday") {
            Err(StorageError::InvalidTimestamp { value, .. }) => assert_eq!(value, "yesterday"),
            other => panic!("expected InvalidTimestamp, got {other:?}"),
        }
    }

    #[test]
    fn year_range_edges_survive_a_round_trip() {
        for raw in ["0000-01-01T00:00:00.000Z", "9999-12-31T23:59:59.999Z"] {
            let ts = Timestamp::parse(raw).unwrap();
            assert_eq!(ts.to_iso8601(), raw);
            assert_eq!(Timestamp::parse(&ts.to_string()).unwrap(), ts);
        }
        let first = Timestamp::from_unix_millis(-62_167_219_200_000).unwrap();
        assert_eq!(first.to_iso8601(), "0000-01-01T00:00:00.000Z");
    }

    #[test]
    fn rejects_years_outside_four_digits() {
        match Timestamp::from_unix_millis(-62_167_219_200_001) {
            Err(StorageError::InvalidTimestamp { value, message }) => {
                assert_eq!(value, "-62167219200001");
                assert!(message.contains("year -1"), "{message}");
            }
            other => panic!("expected InvalidTimestamp, got {other:?}"),
        }
        // In range as written, year -1 once shifted to UTC.
        assert!(Timestamp::parse("0000-01-01T00:30:00+01:00").is_err());
        assert!(Timestamp::from_unix_millis(253_402_300_800_000).is_err());
    }

    #[test]
    fn orders_by_instant() {
        let earlier = Timestamp::parse("2026-01-01T00:00:00.001Z").unwrap();
        let later = Timestamp::parse("2026-01-01T00:00:00.002Z").unwrap();
        assert!(earlier < later);
    }
}
