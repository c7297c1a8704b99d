//! Header checks applied before a log is parsed.
//!
//! Inspection never fails: anything that cannot be read or decoded is simply
//! an invalid log.

use crate::config::MonitorConfig;
use crate::Location;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderVerdict {
    Valid,
    Invalid(String),
}

impl HeaderVerdict {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }
}

#[must_use]
pub fn inspect_header(content: &[u8], config: &MonitorConfig) -> HeaderVerdict {
    match std::str::from_utf8(content) {
        Ok(text) => inspect_header_text(text, config),
        Err(err) => HeaderVerdict::Invalid(format!("log is not UTF-8 text: {err}")),
    }
}

#[must_use]
pub fn inspect_header_text(text: &str, config: &MonitorConfig) -> HeaderVerdict {
    let header: Vec<&str> = strip_bom(text)
        .lines()
        .take(config.header_scan_lines)
        .collect();

    if header
        .iter()
        .any(|line| line.contains(config.loopback_marker.as_str()))
    {
        return HeaderVerdict::Invalid(format!(
            "captured from a virtual source ({})",
            config.loopback_marker
        ));
    }

    if let Some(marker) = config
        .rejected_metric_markers
        .iter()
        .find(|marker| header.iter().any(|line| line.contains(marker.as_str())))
    {
        return HeaderVerdict::Invalid(format!("incompatible metric family ({marker})"));
    }

    if !header
        .first()
        .is_some_and(|line| line.starts_with(config.instrument_banner.as_str()))
    {
        return HeaderVerdict::Invalid(format!(
            "first line is not {:?}",
            config.instrument_banner
        ));
    }

    let calibration = format!("Mic/meter cal: {}", config.required_cal_file);
    if !header.iter().any(|line| line.contains(&calibration)) {
        return HeaderVerdict::Invalid(format!(
            "calibration file is not {}",
            config.required_cal_file
        ));
    }

    if !header
        .iter()
        .any(|line| line.contains(config.required_metric_marker.as_str()))
    {
        return HeaderVerdict::Invalid(format!(
            "no {} channel in header",
            config.required_metric_marker
        ));
    }

    HeaderVerdict::Valid
}

/// Reads the note line of the header. Any configured keyword, matched
/// case-insensitively, marks the log as recorded inside the venue.
#[must_use]
pub fn detect_location(text: &str, config: &MonitorConfig) -> Location {
    let Some(line) = strip_bom(text).lines().nth(config.note_line_index) else {
        return Location::Balcony;
    };

    let note = line.to_lowercase();
    if !note.contains("note") {
        return Location::Balcony;
    }

    if config
        .nightclub_keywords
        .iter()
        .any(|keyword| note.contains(&keyword.to_lowercase()))
    {
        Location::Nightclub
    } else {
        Location::Balcony
    }
}

pub(crate) fn strip_bom(text: &str) -> &str {
    text.strip_prefix('\u{feff}').unwrap_or(text)
}
