use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use time::{Date, PrimitiveDateTime, Time};

use crate::{timefmt, Location, Reading};

/// A recurring weekly operating window. `weekday` counts from Monday = 0.
///
/// `start > end` means the window runs past midnight into the next day.
/// Both bounds are inclusive.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SessionWindow {
    pub label: String,
    pub weekday: u8,
    #[serde(with = "timefmt::clock_text")]
    pub start: Time,
    #[serde(with = "timefmt::clock_text")]
    pub end: Time,
}

impl SessionWindow {
    #[must_use]
    pub fn new(label: impl Into<String>, weekday: u8, start: Time, end: Time) -> Self {
        Self {
            label: label.into(),
            weekday,
            start,
            end,
        }
    }

    #[must_use]
    pub fn wraps_midnight(&self) -> bool {
        self.start > self.end
    }

    #[must_use]
    pub fn contains(&self, timestamp: PrimitiveDateTime) -> bool {
        self.occurrence_date(timestamp).is_some()
    }

    /// Calendar date on which the occurrence containing `timestamp` began,
    /// or `None` when the timestamp lies outside every occurrence.
    #[must_use]
    pub fn occurrence_date(&self, timestamp: PrimitiveDateTime) -> Option<Date> {
        let weekday = weekday_index(timestamp);
        let clock = timestamp.time();

        if !self.wraps_midnight() {
            let inside = weekday == self.weekday && self.start <= clock && clock <= self.end;
            return inside.then(|| timestamp.date());
        }

        if weekday == self.weekday && clock >= self.start {
            return Some(timestamp.date());
        }

        if weekday == (self.weekday + 1) % 7 && clock <= self.end {
            return timestamp.date().previous_day();
        }

        None
    }
}

/// Uniqueness key of a persisted session tag. `lceq_tenths` is LCeq rounded
/// to one decimal and held as an integer so keys compare exactly.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SessionKey {
    pub session: String,
    pub date: Date,
    pub time: Time,
    pub lceq_tenths: i64,
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionTag {
    pub session_label: String,
    #[serde(with = "timefmt::date_text")]
    pub occurrence_date: Date,
    #[serde(with = "timefmt::time_of_day_text")]
    pub time_of_day: Time,
    pub lceq: f64,
    pub source: String,
    pub location: Location,
    pub plot_ref: Option<String>,
}

impl SessionTag {
    #[must_use]
    pub fn key(&self) -> SessionKey {
        SessionKey {
            session: self.session_label.clone(),
            date: self.occurrence_date,
            time: self.time_of_day,
            lceq_tenths: lceq_tenths(self.lceq),
            source: self.source.clone(),
        }
    }
}

/// A tagged reading joined back to its stored row, carrying the unrounded
/// level and the absolute time it was recorded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaggedReading {
    pub session_label: String,
    #[serde(with = "timefmt::date_text")]
    pub occurrence_date: Date,
    #[serde(with = "timefmt::timestamp_text")]
    pub timestamp: PrimitiveDateTime,
    pub lceq: f64,
    pub source: String,
    pub location: Location,
}

impl TaggedReading {
    /// Pairs a reading with the occurrence of `window` that contains it.
    #[must_use]
    pub fn within(window: &SessionWindow, reading: &Reading) -> Option<Self> {
        let occurrence_date = window.occurrence_date(reading.timestamp)?;
        Some(Self {
            session_label: window.label.clone(),
            occurrence_date,
            timestamp: reading.timestamp,
            lceq: reading.lceq,
            source: reading.source.clone(),
            location: reading.location,
        })
    }

    /// The persisted form, with LCeq rounded to tenths.
    #[must_use]
    pub fn to_tag(&self) -> SessionTag {
        SessionTag {
            session_label: self.session_label.clone(),
            occurrence_date: self.occurrence_date,
            time_of_day: self.timestamp.time(),
            lceq: tenths_to_level(lceq_tenths(self.lceq)),
            source: self.source.clone(),
            location: self.location,
            plot_ref: None,
        }
    }
}

#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn lceq_tenths(lceq: f64) -> i64 {
    (lceq * 10.0).round() as i64
}

#[allow(clippy::cast_precision_loss)]
fn tenths_to_level(tenths: i64) -> f64 {
    tenths as f64 / 10.0
}

/// Maps readings onto every window they fall in and returns only tags whose
/// key is neither in `existing` nor produced earlier in this call.
///
/// Windows are evaluated independently, so a reading inside two windows with
/// different labels yields two tags.
#[must_use]
pub fn allocate(
    readings: &[Reading],
    windows: &[SessionWindow],
    existing: &BTreeSet<SessionKey>,
) -> Vec<SessionTag> {
    let mut seen = BTreeSet::new();
    let mut tags = Vec::new();

    for window in windows {
        for reading in readings {
            let Some(tagged) = TaggedReading::within(window, reading) else {
                continue;
            };

            let tag = tagged.to_tag();
            let key = tag.key();
            if existing.contains(&key) || seen.contains(&key) {
                continue;
            }
            seen.insert(key);
            tags.push(tag);
        }
    }

    tags
}

fn weekday_index(timestamp: PrimitiveDateTime) -> u8 {
    timestamp.weekday().number_days_from_monday()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use time::macros::{date, datetime, time};
    use time::Duration;

    fn late_friday() -> SessionWindow {
        SessionWindow::new("Friday_23-01", 4, time!(23:00), time!(01:00))
    }

    fn fixture_reading(timestamp: PrimitiveDateTime, lceq: f64) -> Reading {
        Reading {
            timestamp,
            lcs: lceq,
            lceq,
            lceq1m: lceq,
            lceq10m: lceq,
            lzpeak: Some(lceq + 10.0),
            source: "20250516/session.txt".to_string(),
            location: Location::Nightclub,
        }
    }

    #[test]
    fn wrapping_window_spans_midnight() {
        let window = late_friday();
        // 2025-05-16 is a Friday.
        assert!(window.contains(datetime!(2025-05-16 23:30)));
        assert!(window.contains(datetime!(2025-05-17 00:30)));
        assert!(!window.contains(datetime!(2025-05-17 02:00)));
        assert!(!window.contains(datetime!(2025-05-16 22:59:59)));
    }

    #[test]
    fn post_midnight_occurrence_is_dated_by_its_start() {
        let window = late_friday();
        assert_eq!(
            window.occurrence_date(datetime!(2025-05-17 00:30)),
            Some(date!(2025-05-16))
        );
        assert_eq!(
            window.occurrence_date(datetime!(2025-05-16 23:30)),
            Some(date!(2025-05-16))
        );
    }

    #[test]
    fn non_wrapping_bounds_are_inclusive() {
        let window = SessionWindow::new("Friday_01-04", 4, time!(01:00), time!(04:00));
        assert!(window.contains(datetime!(2025-05-16 01:00)));
        assert!(window.contains(datetime!(2025-05-16 04:00)));
        assert!(!window.contains(datetime!(2025-05-16 04:00:00.000001)));
        assert!(!window.contains(datetime!(2025-05-17 02:00)));
    }

    #[test]
    fn sunday_to_monday_wrap_uses_weekday_modulo() {
        let window = SessionWindow::new("Sunday_22-02", 6, time!(22:00), time!(02:00));
        // 2025-05-18 is a Sunday, 2025-05-19 a Monday.
        assert!(window.contains(datetime!(2025-05-18 23:00)));
        assert!(window.contains(datetime!(2025-05-19 01:59)));
        assert!(!window.contains(datetime!(2025-05-19 23:00)));
    }

    #[test]
    fn second_allocation_yields_no_new_tags() {
        let windows = vec![late_friday()];
        let readings = vec![
            fixture_reading(datetime!(2025-05-16 23:30), 81.24),
            fixture_reading(datetime!(2025-05-17 00:30), 79.96),
            fixture_reading(datetime!(2025-05-17 03:00), 70.0),
        ];

        let first = allocate(&readings, &windows, &BTreeSet::new());
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].lceq, 81.2);
        assert_eq!(first[1].lceq, 80.0);

        let persisted: BTreeSet<SessionKey> = first.iter().map(SessionTag::key).collect();
        let second = allocate(&readings, &windows, &persisted);
        assert!(second.is_empty());
    }

    #[test]
    fn duplicate_window_definitions_do_not_duplicate_tags() {
        let windows = vec![late_friday(), late_friday()];
        let readings = vec![fixture_reading(datetime!(2025-05-16 23:30), 85.0)];
        let tags = allocate(&readings, &windows, &BTreeSet::new());
        assert_eq!(tags.len(), 1);
    }

    #[test]
    fn overlapping_labels_each_receive_a_tag() {
        let windows = vec![
            late_friday(),
            SessionWindow::new("Friday_21-00", 4, time!(21:00), time!(23:59:59)),
        ];
        let readings = vec![fixture_reading(datetime!(2025-05-16 23:30), 85.0)];
        let tags = allocate(&readings, &windows, &BTreeSet::new());
        assert_eq!(tags.len(), 2);
        assert!(tags.iter().all(|tag| tag.plot_ref.is_none()));
    }

    #[test]
    fn tagged_reading_keeps_raw_level_and_timestamp() {
        let window = late_friday();
        let reading = fixture_reading(datetime!(2025-05-17 00:30), 80.04);
        let tagged = TaggedReading::within(&window, &reading);
        let Some(tagged) = tagged else {
            panic!("post-midnight reading should fall inside the window");
        };
        assert_eq!(tagged.occurrence_date, date!(2025-05-16));
        assert_eq!(tagged.timestamp, datetime!(2025-05-17 00:30));
        assert_eq!(tagged.lceq, 80.04);

        let tags = allocate(&[reading], &[window], &BTreeSet::new());
        assert_eq!(tags[0].lceq, 80.0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(256))]

        #[test]
        fn prop_occurrence_starts_on_window_weekday(
            minutes in 0i64..(60 * 24 * 28),
            weekday in 0u8..7,
            start_minute in 0u8..(24 * 4),
            end_minute in 0u8..(24 * 4),
        ) {
            let start = Time::from_hms(start_minute / 4, (start_minute % 4) * 15, 0);
            let end = Time::from_hms(end_minute / 4, (end_minute % 4) * 15, 0);
            let (Ok(start), Ok(end)) = (start, end) else {
                return Err(TestCaseError::fail("fixture clock out of range"));
            };
            let window = SessionWindow::new("prop", weekday, start, end);
            let timestamp = datetime!(2025-05-05 00:00) + Duration::minutes(minutes);

            if let Some(date) = window.occurrence_date(timestamp) {
                prop_assert_eq!(date.weekday().number_days_from_monday(), weekday);
                let began = PrimitiveDateTime::new(date, window.start);
                prop_assert!(began <= timestamp);
                prop_assert!(timestamp - began < Duration::DAY);
            }
        }
    }
}
