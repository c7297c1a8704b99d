//! Text forms used for instants in the store, the reports and configuration.
//!
//! Formatting is infallible and hand-rolled so the stored text stays
//! lexically ordered; parsing goes through `time` format descriptions.

use time::macros::format_description;
use time::{Date, OffsetDateTime, PrimitiveDateTime, Time, UtcOffset};

use crate::SplError;

#[must_use]
pub fn date_key(value: Date) -> String {
    format!(
        "{:04}-{:02}-{:02}",
        value.year(),
        u8::from(value.month()),
        value.day()
    )
}

#[must_use]
pub fn time_of_day_key(value: Time) -> String {
    format!(
        "{:02}:{:02}:{:02}.{:06}",
        value.hour(),
        value.minute(),
        value.second(),
        value.microsecond()
    )
}

#[must_use]
pub fn clock_key(value: Time) -> String {
    format!(
        "{:02}:{:02}:{:02}",
        value.hour(),
        value.minute(),
        value.second()
    )
}

/// `YYYY-MM-DD HH:MM:SS.ffffff`, the storage form of reading timestamps.
#[must_use]
pub fn timestamp_key(value: PrimitiveDateTime) -> String {
    format!("{} {}", date_key(value.date()), time_of_day_key(value.time()))
}

/// Parses the storage form written by [`timestamp_key`].
///
/// # Errors
/// Returns [`SplError::Validation`] when the text is not a microsecond
/// timestamp.
pub fn parse_timestamp(value: &str) -> Result<PrimitiveDateTime, SplError> {
    PrimitiveDateTime::parse(
        value.trim(),
        format_description!("[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:6]"),
    )
    .map_err(|err| SplError::Validation(format!("invalid timestamp {value:?}: {err}")))
}

/// Parses a user supplied bound, with or without fractional seconds.
///
/// # Errors
/// Returns [`SplError::Validation`] when neither form matches.
pub fn parse_timestamp_bound(value: &str) -> Result<PrimitiveDateTime, SplError> {
    if let Ok(parsed) = parse_timestamp(value) {
        return Ok(parsed);
    }

    PrimitiveDateTime::parse(
        value.trim(),
        format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"),
    )
    .map_err(|err| {
        SplError::Validation(format!(
            "invalid timestamp {value:?}, expected YYYY-MM-DD HH:MM:SS: {err}"
        ))
    })
}

/// # Errors
/// Returns [`SplError::Validation`] for anything other than `YYYY-MM-DD`.
pub fn parse_date(value: &str) -> Result<Date, SplError> {
    Date::parse(value.trim(), format_description!("[year]-[month]-[day]"))
        .map_err(|err| SplError::Validation(format!("invalid date {value:?}: {err}")))
}

/// # Errors
/// Returns [`SplError::Validation`] for anything other than `HH:MM:SS.ffffff`.
pub fn parse_time_of_day(value: &str) -> Result<Time, SplError> {
    Time::parse(
        value.trim(),
        format_description!("[hour]:[minute]:[second].[subsecond digits:6]"),
    )
    .map_err(|err| SplError::Validation(format!("invalid time of day {value:?}: {err}")))
}

/// # Errors
/// Returns [`SplError::Configuration`] for anything other than `HH:MM:SS`.
pub fn parse_clock(value: &str) -> Result<Time, SplError> {
    Time::parse(
        value.trim(),
        format_description!("[hour]:[minute]:[second]"),
    )
    .map_err(|err| SplError::Configuration(format!("invalid clock time {value:?}: {err}")))
}

/// Parses the instrument's `Date:` header value, e.g. `18/05/2025 2:00:00 PM`.
///
/// # Errors
/// Returns [`SplError::Parse`] when the value does not match.
pub fn parse_header_timestamp(value: &str) -> Result<PrimitiveDateTime, SplError> {
    PrimitiveDateTime::parse(
        value.trim(),
        format_description!(
            "[day padding:none]/[month padding:none]/[year] [hour repr:12 padding:none]:[minute]:[second] [period case_sensitive:false]"
        ),
    )
    .map_err(|err| SplError::Parse(format!("invalid Date header {value:?}: {err}")))
}

/// Formats an instant as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`SplError::Validation`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, SplError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| SplError::Validation(format!("failed to format RFC3339 timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}

pub mod timestamp_text {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::PrimitiveDateTime;

    pub fn serialize<S: Serializer>(
        value: &PrimitiveDateTime,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::timestamp_key(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<PrimitiveDateTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_timestamp(&raw).map_err(serde::de::Error::custom)
    }
}

pub mod option_timestamp_text {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::PrimitiveDateTime;

    pub fn serialize<S: Serializer>(
        value: &Option<PrimitiveDateTime>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(inner) => serializer.serialize_some(&super::timestamp_key(*inner)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<PrimitiveDateTime>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|raw| super::parse_timestamp(&raw).map_err(serde::de::Error::custom))
            .transpose()
    }
}

pub mod date_text {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::Date;

    pub fn serialize<S: Serializer>(value: &Date, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::date_key(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Date, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_date(&raw).map_err(serde::de::Error::custom)
    }
}

pub mod time_of_day_text {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::Time;

    pub fn serialize<S: Serializer>(value: &Time, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::time_of_day_key(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Time, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_time_of_day(&raw).map_err(serde::de::Error::custom)
    }
}

pub mod clock_text {
    use serde::{Deserialize, Deserializer, Serializer};
    use time::Time;

    pub fn serialize<S: Serializer>(value: &Time, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::clock_key(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Time, D::Error> {
        let raw = String::deserialize(deserializer)?;
        super::parse_clock(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::{date, datetime, time};

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    #[test]
    fn timestamp_key_is_fixed_width_and_reparses() {
        let value = datetime!(2025-05-09 03:04:05.123456);
        let text = timestamp_key(value);
        assert_eq!(text, "2025-05-09 03:04:05.123456");
        assert_eq!(must_ok(parse_timestamp(&text)), value);
    }

    #[test]
    fn header_timestamp_accepts_unpadded_twelve_hour_clock() {
        let parsed = must_ok(parse_header_timestamp("18/05/2025 2:00:00 PM"));
        assert_eq!(parsed, datetime!(2025-05-18 14:00:00));

        let midnight = must_ok(parse_header_timestamp("01/06/2025 12:30:15 am"));
        assert_eq!(midnight, datetime!(2025-06-01 00:30:15));
    }

    #[test]
    fn header_timestamp_rejects_iso_text() {
        assert!(parse_header_timestamp("2025-05-18 14:00:00").is_err());
    }

    #[test]
    fn bound_parser_accepts_whole_seconds() {
        let parsed = must_ok(parse_timestamp_bound("2025-05-18 20:00:00"));
        assert_eq!(parsed, datetime!(2025-05-18 20:00:00));
    }

    #[test]
    fn date_and_clock_keys_round_trip() {
        assert_eq!(date_key(date!(2025-01-02)), "2025-01-02");
        assert_eq!(clock_key(time!(23:59:59)), "23:59:59");
        assert_eq!(must_ok(parse_clock("21:00:00")), time!(21:00));
        assert!(parse_clock("21:00").is_err());
    }
}
