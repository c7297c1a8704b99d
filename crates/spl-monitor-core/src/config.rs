use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::macros::time;
use time::Duration;

use crate::session::SessionWindow;
use crate::SplError;

/// Every tunable of the pipeline. Built once and passed by reference into the
/// validator, parser, allocator and evaluator.
///
/// Fields missing from a JSON document take their [`MonitorConfig::v1`] value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MonitorConfig {
    pub config_version: u32,
    pub instrument_banner: String,
    pub required_cal_file: String,
    pub header_scan_lines: usize,
    pub required_metric_marker: String,
    pub rejected_metric_markers: Vec<String>,
    pub loopback_marker: String,
    pub note_line_index: usize,
    pub nightclub_keywords: Vec<String>,
    pub sample_interval_seconds: f64,
    pub data_start_fallback_line: usize,
    pub min_spl_db: f64,
    pub limit_day_db: f64,
    pub limit_night_db: f64,
    pub facade_gain_db: f64,
    pub breach_context_seconds: u32,
    pub sessions: Vec<SessionWindow>,
}

impl MonitorConfig {
    #[must_use]
    pub fn v1() -> Self {
        Self {
            config_version: 1,
            instrument_banner: "SPL log data saved by REW".to_string(),
            required_cal_file: "7097828_90deg.txt".to_string(),
            header_scan_lines: 15,
            required_metric_marker: "LCS".to_string(),
            rejected_metric_markers: vec!["LAS".to_string(), "LAeq".to_string()],
            loopback_marker: "VirtualMic.txt".to_string(),
            note_line_index: 1,
            nightclub_keywords: ["nightclub", "prohibition", "club", "site"]
                .iter()
                .map(ToString::to_string)
                .collect(),
            sample_interval_seconds: 0.170_666_666_7,
            data_start_fallback_line: 8,
            min_spl_db: 50.0,
            limit_day_db: 90.0,
            limit_night_db: 80.0,
            facade_gain_db: 0.0,
            breach_context_seconds: 90,
            sessions: default_sessions(),
        }
    }

    /// Validates numeric bounds and the session window list.
    ///
    /// # Errors
    /// Returns [`SplError::Configuration`] naming the first offending field.
    pub fn validate(&self) -> Result<(), SplError> {
        if self.config_version == 0 {
            return Err(SplError::Configuration(
                "config_version MUST be >= 1".to_string(),
            ));
        }

        for (name, value) in [
            ("instrument_banner", &self.instrument_banner),
            ("required_cal_file", &self.required_cal_file),
            ("required_metric_marker", &self.required_metric_marker),
            ("loopback_marker", &self.loopback_marker),
        ] {
            if value.trim().is_empty() {
                return Err(SplError::Configuration(format!(
                    "{name} MUST NOT be empty"
                )));
            }
        }

        if self
            .rejected_metric_markers
            .iter()
            .chain(&self.nightclub_keywords)
            .any(|marker| marker.trim().is_empty())
        {
            return Err(SplError::Configuration(
                "metric markers and location keywords MUST NOT be empty".to_string(),
            ));
        }

        if self.header_scan_lines == 0 {
            return Err(SplError::Configuration(
                "header_scan_lines MUST be >= 1".to_string(),
            ));
        }

        if !self.sample_interval_seconds.is_finite() || self.sample_interval_seconds <= 0.0 {
            return Err(SplError::Configuration(
                "sample_interval_seconds MUST be a positive number".to_string(),
            ));
        }

        for (name, value) in [
            ("min_spl_db", self.min_spl_db),
            ("limit_day_db", self.limit_day_db),
            ("limit_night_db", self.limit_night_db),
            ("facade_gain_db", self.facade_gain_db),
        ] {
            if !value.is_finite() {
                return Err(SplError::Configuration(format!(
                    "{name} MUST be a finite number"
                )));
            }
        }

        if self.breach_context_seconds == 0 {
            return Err(SplError::Configuration(
                "breach_context_seconds MUST be >= 1".to_string(),
            ));
        }

        let mut labels = BTreeSet::new();
        for window in &self.sessions {
            if window.label.trim().is_empty() {
                return Err(SplError::Configuration(
                    "session label MUST NOT be empty".to_string(),
                ));
            }
            if window.weekday > 6 {
                return Err(SplError::Configuration(format!(
                    "session {} weekday MUST be in [0, 6]",
                    window.label
                )));
            }
            if !labels.insert(window.label.as_str()) {
                return Err(SplError::Configuration(format!(
                    "duplicate session label {}",
                    window.label
                )));
            }
        }

        Ok(())
    }

    /// Decodes and validates a configuration from JSON.
    ///
    /// # Errors
    /// Returns [`SplError::Configuration`] when decoding fails or the decoded
    /// values violate configuration constraints.
    pub fn from_json(value: &Value) -> Result<Self, SplError> {
        let config: Self = serde_json::from_value(value.clone()).map_err(|err| {
            SplError::Configuration(format!("invalid configuration JSON payload: {err}"))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a JSON configuration file.
    ///
    /// # Errors
    /// Returns [`SplError::Configuration`] when the file cannot be read or
    /// does not hold a valid configuration.
    pub fn load(path: &Path) -> Result<Self, SplError> {
        let body = std::fs::read_to_string(path).map_err(|err| {
            SplError::Configuration(format!("failed to read {}: {err}", path.display()))
        })?;
        let value: Value = serde_json::from_str(&body).map_err(|err| {
            SplError::Configuration(format!("{} is not JSON: {err}", path.display()))
        })?;
        Self::from_json(&value)
    }

    #[must_use]
    pub fn breach_context(&self) -> Duration {
        Duration::seconds(i64::from(self.breach_context_seconds))
    }

    /// Offset of data row `index` from the log's start time, rounded to
    /// whole microseconds.
    #[must_use]
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    pub fn sample_offset(&self, index: usize) -> Duration {
        let micros = (index as f64 * self.sample_interval_seconds * 1_000_000.0).round();
        Duration::microseconds(micros as i64)
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self::v1()
    }
}

fn default_sessions() -> Vec<SessionWindow> {
    vec![
        SessionWindow::new("Thursday_21-00", 3, time!(21:00), time!(23:59:59)),
        SessionWindow::new("Friday_00-01", 4, time!(00:00), time!(01:00)),
        SessionWindow::new("Friday_01-04", 4, time!(01:00), time!(04:00)),
        SessionWindow::new("Friday_21-00", 4, time!(21:00), time!(23:59:59)),
        SessionWindow::new("Saturday_00-01", 5, time!(00:00), time!(01:00)),
        SessionWindow::new("Saturday_01-04", 5, time!(01:00), time!(04:00)),
        SessionWindow::new("Saturday_21-00", 5, time!(21:00), time!(23:59:59)),
        SessionWindow::new("Sunday_00-01", 6, time!(00:00), time!(01:00)),
        SessionWindow::new("Sunday_01-04", 6, time!(01:00), time!(04:00)),
        SessionWindow::new("Sunday_21-00", 6, time!(21:00), time!(23:59:59)),
        SessionWindow::new("Monday_00-01", 0, time!(00:00), time!(01:00)),
        SessionWindow::new("Monday_01-04", 0, time!(01:00), time!(04:00)),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    #[test]
    fn v1_defaults_are_valid() {
        must_ok(MonitorConfig::v1().validate());
        assert_eq!(MonitorConfig::v1().sessions.len(), 12);
    }

    #[test]
    fn json_round_trip_keeps_clock_text() {
        let value = must_ok(serde_json::to_value(MonitorConfig::v1()));
        assert_eq!(value["sessions"][0]["start"], "21:00:00");
        assert_eq!(value["sessions"][0]["end"], "23:59:59");

        let decoded = must_ok(MonitorConfig::from_json(&value));
        assert_eq!(decoded.sessions, MonitorConfig::v1().sessions);
        assert_eq!(decoded.required_cal_file, "7097828_90deg.txt");
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let value = serde_json::json!({ "limit_night_db": 75.0, "min_spl_db": 45.0 });
        let decoded = must_ok(MonitorConfig::from_json(&value));
        assert_eq!(decoded.limit_night_db, 75.0);
        assert_eq!(decoded.min_spl_db, 45.0);
        assert_eq!(decoded.sessions.len(), 12);

        let invalid = serde_json::json!({ "config_version": 0 });
        assert!(matches!(
            MonitorConfig::from_json(&invalid),
            Err(SplError::Configuration(message)) if message.contains("config_version")
        ));
    }

    #[test]
    fn duplicate_labels_are_rejected() {
        let mut config = MonitorConfig::v1();
        let first = config.sessions[0].clone();
        config.sessions.push(first);
        assert!(matches!(
            config.validate(),
            Err(SplError::Configuration(message)) if message.contains("duplicate")
        ));
    }

    #[test]
    fn out_of_range_weekday_is_rejected() {
        let mut config = MonitorConfig::v1();
        config.sessions[0].weekday = 7;
        assert!(config.validate().is_err());
    }

    #[test]
    fn non_positive_interval_is_rejected() {
        let mut config = MonitorConfig::v1();
        config.sample_interval_seconds = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn sample_offset_rounds_to_microseconds() {
        let config = MonitorConfig::v1();
        assert_eq!(config.sample_offset(0), Duration::ZERO);
        assert_eq!(config.sample_offset(3), Duration::microseconds(512_000));
        assert_eq!(config.sample_offset(6), Duration::microseconds(1_024_000));
    }

    #[test]
    fn malformed_clock_in_json_is_a_configuration_error() {
        let mut value = must_ok(serde_json::to_value(MonitorConfig::v1()));
        value["sessions"][0]["start"] = Value::String("9pm".to_string());
        assert!(matches!(
            MonitorConfig::from_json(&value),
            Err(SplError::Configuration(_))
        ));
    }
}
