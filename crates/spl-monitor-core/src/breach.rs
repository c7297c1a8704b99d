//! Day/night limit classification and per-session breach aggregation.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use time::macros::time;
use time::{Date, PrimitiveDateTime, Time};

use crate::config::MonitorConfig;
use crate::session::TaggedReading;
use crate::{timefmt, Location};

const DAY_START: Time = time!(10:00);
const DAY_END: Time = time!(23:59);
const EXTENDED_DAY_END: Time = time!(01:00);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
pub enum Period {
    Day,
    Night,
}

impl Period {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Day => "Day",
            Self::Night => "Night",
        }
    }
}

/// Sunday through Thursday count as day from 10:00 to 23:59 inclusive.
/// Friday and Saturday extend the day past midnight up to 01:00 inclusive.
#[must_use]
pub fn classify_period(timestamp: PrimitiveDateTime) -> Period {
    let clock = timestamp.time();
    let day = match timestamp.weekday().number_days_from_monday() {
        4 | 5 => clock >= DAY_START || clock <= EXTENDED_DAY_END,
        _ => (DAY_START..=DAY_END).contains(&clock),
    };

    if day {
        Period::Day
    } else {
        Period::Night
    }
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct ReadingAssessment {
    #[serde(with = "timefmt::timestamp_text")]
    pub timestamp: PrimitiveDateTime,
    pub location: Location,
    pub adjusted_lceq: f64,
    pub limit: f64,
    pub period: Period,
    pub breached: bool,
}

impl ReadingAssessment {
    #[must_use]
    pub fn new(
        timestamp: PrimitiveDateTime,
        lceq: f64,
        location: Location,
        config: &MonitorConfig,
    ) -> Self {
        let period = classify_period(timestamp);
        let limit = match period {
            Period::Day => config.limit_day_db,
            Period::Night => config.limit_night_db,
        };
        let adjusted_lceq = lceq + config.facade_gain_db;

        Self {
            timestamp,
            location,
            adjusted_lceq,
            limit,
            period,
            breached: adjusted_lceq > limit,
        }
    }
}

/// One row of the session summary report.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SessionSummary {
    pub session_id: String,
    pub session_label: String,
    #[serde(with = "timefmt::date_text")]
    pub occurrence_date: Date,
    #[serde(with = "timefmt::timestamp_text")]
    pub epoch: PrimitiveDateTime,
    pub readings: usize,
    pub max_adjusted_lceq: f64,
    #[serde(with = "timefmt::timestamp_text")]
    pub max_at: PrimitiveDateTime,
    pub max_location: Location,
    pub limit_at_max: f64,
    pub period_at_max: Period,
    pub breach_count: usize,
    #[serde(with = "timefmt::option_timestamp_text")]
    pub first_breach_at: Option<PrimitiveDateTime>,
    #[serde(with = "timefmt::option_timestamp_text")]
    pub last_breach_at: Option<PrimitiveDateTime>,
}

/// A run of breaching readings at one location whose gaps never exceed the
/// context window.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BreachEvent {
    pub session_id: String,
    pub location: Location,
    #[serde(with = "timefmt::timestamp_text")]
    pub started_at: PrimitiveDateTime,
    #[serde(with = "timefmt::timestamp_text")]
    pub ended_at: PrimitiveDateTime,
    pub duration_seconds: f64,
    pub peak_adjusted_lceq: f64,
    #[serde(with = "timefmt::timestamp_text")]
    pub peak_at: PrimitiveDateTime,
    pub limit: f64,
    pub breaching_readings: usize,
    #[serde(with = "timefmt::timestamp_text")]
    pub context_start: PrimitiveDateTime,
    #[serde(with = "timefmt::timestamp_text")]
    pub context_end: PrimitiveDateTime,
    pub context_readings: usize,
    pub context_max_lceq: f64,
    pub sustained: bool,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct Evaluation {
    pub summaries: Vec<SessionSummary>,
    pub breaches: Vec<BreachEvent>,
    pub days_processed: usize,
    pub sessions_processed: usize,
    pub readings_evaluated: usize,
}

/// Groups tagged readings into session instances keyed by
/// `(occurrence_date, label)` and evaluates every reading's raw level against
/// its day or night limit.
///
/// Output is ordered by occurrence date, then label.
#[must_use]
pub fn evaluate(readings: &[TaggedReading], config: &MonitorConfig) -> Evaluation {
    let mut instances: BTreeMap<(Date, &str), Vec<ReadingAssessment>> = BTreeMap::new();
    let mut days = BTreeSet::new();

    for reading in readings {
        days.insert(reading.timestamp.date());
        instances
            .entry((reading.occurrence_date, reading.session_label.as_str()))
            .or_default()
            .push(ReadingAssessment::new(
                reading.timestamp,
                reading.lceq,
                reading.location,
                config,
            ));
    }

    let mut evaluation = Evaluation {
        days_processed: days.len(),
        sessions_processed: instances.len(),
        readings_evaluated: readings.len(),
        ..Evaluation::default()
    };

    for ((occurrence_date, label), mut assessments) in instances {
        assessments.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.location.cmp(&b.location))
        });
        let session_id = format!("{}_{label}", timefmt::date_key(occurrence_date));

        if let Some(summary) = summarize(&session_id, label, occurrence_date, &assessments) {
            evaluation.summaries.push(summary);
        }
        evaluation
            .breaches
            .extend(breach_events(&session_id, &assessments, config));
    }

    evaluation
}

fn summarize(
    session_id: &str,
    label: &str,
    occurrence_date: Date,
    assessments: &[ReadingAssessment],
) -> Option<SessionSummary> {
    let epoch = assessments.first()?.timestamp;
    let peak = assessments.iter().fold(None::<&ReadingAssessment>, |best, item| {
        match best {
            Some(best) if best.adjusted_lceq >= item.adjusted_lceq => Some(best),
            _ => Some(item),
        }
    })?;
    let breached: Vec<&ReadingAssessment> =
        assessments.iter().filter(|item| item.breached).collect();

    Some(SessionSummary {
        session_id: session_id.to_string(),
        session_label: label.to_string(),
        occurrence_date,
        epoch,
        readings: assessments.len(),
        max_adjusted_lceq: peak.adjusted_lceq,
        max_at: peak.timestamp,
        max_location: peak.location,
        limit_at_max: peak.limit,
        period_at_max: peak.period,
        breach_count: breached.len(),
        first_breach_at: breached.first().map(|item| item.timestamp),
        last_breach_at: breached.last().map(|item| item.timestamp),
    })
}

fn breach_events(
    session_id: &str,
    assessments: &[ReadingAssessment],
    config: &MonitorConfig,
) -> Vec<BreachEvent> {
    let window = config.breach_context();
    let mut events = Vec::new();

    for location in [Location::Balcony, Location::Nightclub] {
        let at_location: Vec<&ReadingAssessment> = assessments
            .iter()
            .filter(|item| item.location == location)
            .collect();

        let mut cluster: Vec<&ReadingAssessment> = Vec::new();
        for item in at_location.iter().copied().filter(|item| item.breached) {
            if let Some(last) = cluster.last() {
                if item.timestamp - last.timestamp > window {
                    events.extend(close_event(session_id, &cluster, &at_location, config));
                    cluster.clear();
                }
            }
            cluster.push(item);
        }
        events.extend(close_event(session_id, &cluster, &at_location, config));
    }

    events.sort_by(|a, b| a.started_at.cmp(&b.started_at));
    events
}

fn close_event(
    session_id: &str,
    cluster: &[&ReadingAssessment],
    at_location: &[&ReadingAssessment],
    config: &MonitorConfig,
) -> Option<BreachEvent> {
    let first = cluster.first()?;
    let last = cluster.last()?;
    let peak = cluster.iter().copied().fold(*first, |best, item| {
        if item.adjusted_lceq > best.adjusted_lceq {
            item
        } else {
            best
        }
    });

    let window = config.breach_context();
    let context_start = first.timestamp - window;
    let context_end = last.timestamp + window;
    let context: Vec<&&ReadingAssessment> = at_location
        .iter()
        .filter(|item| (context_start..=context_end).contains(&item.timestamp))
        .collect();
    let context_max_lceq = context
        .iter()
        .map(|item| item.adjusted_lceq)
        .fold(f64::NEG_INFINITY, f64::max);

    let duration = last.timestamp - first.timestamp;

    Some(BreachEvent {
        session_id: session_id.to_string(),
        location: first.location,
        started_at: first.timestamp,
        ended_at: last.timestamp,
        duration_seconds: duration.as_seconds_f64(),
        peak_adjusted_lceq: peak.adjusted_lceq,
        peak_at: peak.timestamp,
        limit: peak.limit,
        breaching_readings: cluster.len(),
        context_start,
        context_end,
        context_readings: context.len(),
        context_max_lceq,
        sustained: duration >= window,
    })
}
