//! Domain model and evaluation engine for sound-pressure-level compliance logs.
//!
//! The crate is storage agnostic: the validator and parser turn raw instrument
//! logs into [`Reading`]s, [`session::allocate`] maps readings onto recurring
//! weekly windows, and [`breach::evaluate`] classifies tagged readings against
//! the day/night limits of a [`MonitorConfig`].

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::PrimitiveDateTime;

pub mod breach;
pub mod config;
pub mod parse;
pub mod session;
pub mod timefmt;
pub mod validate;

pub use breach::{
    classify_period, evaluate, BreachEvent, Evaluation, Period, ReadingAssessment, SessionSummary,
};
pub use config::MonitorConfig;
pub use parse::{parse_log, ParsedLog, RawRow};
pub use session::{allocate, lceq_tenths, SessionKey, SessionTag, SessionWindow, TaggedReading};
pub use validate::{detect_location, inspect_header, HeaderVerdict};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum SplError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Location {
    Balcony,
    Nightclub,
}

impl Location {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Balcony => "Balcony",
            Self::Nightclub => "Nightclub",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Balcony" => Some(Self::Balcony),
            "Nightclub" => Some(Self::Nightclub),
            _ => None,
        }
    }
}

impl Display for Location {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One instrument sample as persisted in `spl_data`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reading {
    #[serde(with = "timefmt::timestamp_text")]
    pub timestamp: PrimitiveDateTime,
    pub lcs: f64,
    pub lceq: f64,
    pub lceq1m: f64,
    pub lceq10m: f64,
    pub lzpeak: Option<f64>,
    pub source: String,
    pub location: Location,
}

impl Reading {
    /// True when every averaged channel is at or above `floor_db`.
    ///
    /// `NaN` cells (blank or malformed in the log) never pass.
    #[must_use]
    pub fn is_plausible(&self, floor_db: f64) -> bool {
        [self.lcs, self.lceq, self.lceq1m, self.lceq10m]
            .iter()
            .all(|level| *level >= floor_db)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RejectionKind {
    Validation,
    Parse,
    MissingExtendedColumns,
    Implausible,
    Unreadable,
}

impl RejectionKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Parse => "parse",
            Self::MissingExtendedColumns => "missing_extended_columns",
            Self::Implausible => "implausible",
            Self::Unreadable => "unreadable",
        }
    }
}

/// Why a log file produced no readings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Rejection {
    pub kind: RejectionKind,
    pub reason: String,
}

impl Rejection {
    #[must_use]
    pub fn new(kind: RejectionKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }
}

impl Display for Rejection {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn fixture_reading(lcs: f64, lceq: f64, lceq1m: f64, lceq10m: f64) -> Reading {
        Reading {
            timestamp: datetime!(2025-05-16 22:00:00),
            lcs,
            lceq,
            lceq1m,
            lceq10m,
            lzpeak: Some(99.0),
            source: "20250516/log.txt".to_string(),
            location: Location::Balcony,
        }
    }

    #[test]
    fn plausibility_requires_every_averaged_channel_at_floor() {
        assert!(fixture_reading(50.0, 50.0, 50.0, 50.0).is_plausible(50.0));
        assert!(!fixture_reading(49.9, 70.0, 70.0, 70.0).is_plausible(50.0));
        assert!(!fixture_reading(70.0, 70.0, 70.0, 49.99).is_plausible(50.0));
        assert!(!fixture_reading(70.0, f64::NAN, 70.0, 70.0).is_plausible(50.0));
    }

    #[test]
    fn lzpeak_is_not_part_of_plausibility() {
        let mut reading = fixture_reading(60.0, 60.0, 60.0, 60.0);
        reading.lzpeak = None;
        assert!(reading.is_plausible(50.0));
    }

    #[test]
    fn location_text_round_trips() {
        for location in [Location::Balcony, Location::Nightclub] {
            assert_eq!(Location::parse(location.as_str()), Some(location));
        }
        assert_eq!(Location::parse("balcony"), None);
    }
}
