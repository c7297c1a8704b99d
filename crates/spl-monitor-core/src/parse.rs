use time::PrimitiveDateTime;

use crate::config::MonitorConfig;
use crate::validate::strip_bom;
use crate::{timefmt, Location, Reading, SplError};

pub const EXTENDED_COLUMNS: [&str; 3] = ["lceq1m", "lceq10m", "lzpeak"];

/// One data row. Blank or malformed cells, and cells of absent columns, are `NaN`.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRow {
    pub timestamp: PrimitiveDateTime,
    pub lcs: f64,
    pub lceq: f64,
    pub lceq1m: f64,
    pub lceq10m: f64,
    pub lzpeak: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedLog {
    pub started_at: PrimitiveDateTime,
    pub columns: Vec<String>,
    pub rows: Vec<RawRow>,
}

impl ParsedLog {
    #[must_use]
    pub fn missing_extended_columns(&self) -> Vec<&'static str> {
        EXTENDED_COLUMNS
            .iter()
            .copied()
            .filter(|name| !self.columns.iter().any(|column| column == name))
            .collect()
    }

    /// Attaches provenance to every row.
    ///
    /// # Errors
    /// Returns [`SplError::Parse`] when any extended column is absent.
    pub fn readings(&self, source: &str, location: Location) -> Result<Vec<Reading>, SplError> {
        let missing = self.missing_extended_columns();
        if !missing.is_empty() {
            return Err(SplError::Parse(format!(
                "missing required columns: {}",
                missing.join(", ")
            )));
        }

        Ok(self
            .rows
            .iter()
            .map(|row| Reading {
                timestamp: row.timestamp,
                lcs: row.lcs,
                lceq: row.lceq,
                lceq1m: row.lceq1m,
                lceq10m: row.lceq10m,
                lzpeak: row.lzpeak.is_finite().then_some(row.lzpeak),
                source: source.to_string(),
                location,
            })
            .collect())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delimiter {
    Comma,
    Whitespace,
}

impl Delimiter {
    /// Splits the header line and the data lines into trimmed cells.
    fn records(self, header: &str, data: &[&str]) -> Result<Vec<Vec<String>>, SplError> {
        match self {
            Self::Comma => {
                let body = std::iter::once(header)
                    .chain(data.iter().copied())
                    .collect::<Vec<_>>()
                    .join("\n");
                let mut reader = csv::ReaderBuilder::new()
                    .has_headers(false)
                    .flexible(true)
                    .trim(csv::Trim::All)
                    .from_reader(body.as_bytes());

                let mut records = Vec::with_capacity(data.len() + 1);
                for record in reader.records() {
                    let record =
                        record.map_err(|err| SplError::Parse(format!("malformed row: {err}")))?;
                    records.push(record.iter().map(str::to_string).collect());
                }
                Ok(records)
            }
            Self::Whitespace => Ok(std::iter::once(header)
                .chain(data.iter().copied())
                .map(|line| line.split_whitespace().map(str::to_string).collect())
                .collect()),
        }
    }
}

/// Extracts the time series of a validated log.
///
/// Row `n` is stamped `start + n * sample_interval`; any time column in the
/// file is ignored.
///
/// # Errors
/// Returns [`SplError::Parse`] when the `Date:` header is missing or
/// malformed, the column header line is absent, no data row follows it, or
/// `lcs`/`lceq` columns are not present.
pub fn parse_log(text: &str, config: &MonitorConfig) -> Result<ParsedLog, SplError> {
    let lines: Vec<&str> = strip_bom(text).lines().collect();

    let date_value = lines
        .iter()
        .find_map(|line| line.strip_prefix("Date:"))
        .ok_or_else(|| SplError::Parse("no Date header".to_string()))?;
    let started_at = timefmt::parse_header_timestamp(date_value)?;

    let data_start = lines
        .iter()
        .position(|line| line.contains("Time[s]"))
        .unwrap_or(config.data_start_fallback_line);
    let header_line = lines.get(data_start).ok_or_else(|| {
        SplError::Parse(format!("no column header at line {}", data_start + 1))
    })?;

    let data_lines: Vec<&str> = lines
        .iter()
        .skip(data_start + 1)
        .copied()
        .filter(|line| !line.trim().is_empty())
        .collect();
    let Some(first_row) = data_lines.first() else {
        return Err(SplError::Parse(format!(
            "no data rows after column header at line {}",
            data_start + 1
        )));
    };

    let delimiter = if first_row.contains(',') {
        Delimiter::Comma
    } else {
        Delimiter::Whitespace
    };

    let mut records = delimiter.records(header_line, &data_lines)?.into_iter();
    let columns: Vec<String> = records
        .next()
        .unwrap_or_default()
        .into_iter()
        .map(|name| name.to_lowercase())
        .collect();

    let position = |name: &str| columns.iter().position(|column| column == name);
    let (Some(lcs_at), Some(lceq_at)) = (position("lcs"), position("lceq")) else {
        return Err(SplError::Parse(format!(
            "missing lcs/lceq columns, found [{}]",
            columns.join(", ")
        )));
    };
    let lceq1m_at = position("lceq1m");
    let lceq10m_at = position("lceq10m");
    let lzpeak_at = position("lzpeak");

    let mut rows = Vec::with_capacity(data_lines.len());
    for (index, fields) in records.enumerate() {
        let cell = |at: Option<usize>| {
            at.and_then(|at| fields.get(at))
                .and_then(|raw| raw.parse::<f64>().ok())
                .unwrap_or(f64::NAN)
        };

        let timestamp = started_at
            .checked_add(config.sample_offset(index))
            .ok_or_else(|| SplError::Parse(format!("row {index} overflows the calendar")))?;

        rows.push(RawRow {
            timestamp,
            lcs: cell(Some(lcs_at)),
            lceq: cell(Some(lceq_at)),
            lceq1m: cell(lceq1m_at),
            lceq10m: cell(lceq10m_at),
            lzpeak: cell(lzpeak_at),
        });
    }

    Ok(ParsedLog {
        started_at,
        columns,
        rows,
    })
}
