#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::collections::BTreeSet;
use std::fmt::Display;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::Serialize;
use sha2::{Digest, Sha256};
use spl_monitor_core::timefmt::{self, format_rfc3339, now_utc};
use spl_monitor_core::{
    allocate, detect_location, inspect_header, lceq_tenths, parse_log, HeaderVerdict, Location,
    MonitorConfig, Reading, Rejection, RejectionKind, SessionKey, SessionTag, SessionWindow,
    TaggedReading,
};
use time::{Date, PrimitiveDateTime};
use tracing::{debug, info, warn};

const SPL_MIGRATION_VERSION: i64 = 1;

const SCHEMA_SPL_V1: &str = r"
CREATE TABLE IF NOT EXISTS spl_data (
  id INTEGER PRIMARY KEY,
  timestamp TEXT NOT NULL,
  lceq REAL NOT NULL,
  lcs REAL NOT NULL,
  lceq1m REAL NOT NULL,
  lceq10m REAL NOT NULL,
  lzpeak REAL,
  source TEXT NOT NULL,
  location TEXT NOT NULL CHECK (location IN ('Balcony', 'Nightclub'))
);

CREATE INDEX IF NOT EXISTS idx_spl_data_location_timestamp
  ON spl_data(location, timestamp);
CREATE INDEX IF NOT EXISTS idx_spl_data_timestamp
  ON spl_data(timestamp);

CREATE TRIGGER IF NOT EXISTS trg_spl_data_no_update
BEFORE UPDATE ON spl_data
BEGIN
  SELECT RAISE(FAIL, 'spl_data is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_spl_data_no_delete
BEFORE DELETE ON spl_data
BEGIN
  SELECT RAISE(FAIL, 'spl_data is append-only');
END;

CREATE TABLE IF NOT EXISTS processed_files (
  content_hash TEXT PRIMARY KEY,
  source TEXT NOT NULL,
  recorded_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS trg_processed_files_no_update
BEFORE UPDATE ON processed_files
BEGIN
  SELECT RAISE(FAIL, 'processed_files is append-only');
END;

CREATE TRIGGER IF NOT EXISTS trg_processed_files_no_delete
BEFORE DELETE ON processed_files
BEGIN
  SELECT RAISE(FAIL, 'processed_files is append-only');
END;

CREATE TABLE IF NOT EXISTS sessions (
  id INTEGER PRIMARY KEY,
  session TEXT NOT NULL,
  date TEXT NOT NULL,
  time TEXT NOT NULL,
  lceq REAL NOT NULL,
  source TEXT NOT NULL,
  plot TEXT,
  location TEXT NOT NULL CHECK (location IN ('Balcony', 'Nightclub')),
  UNIQUE (session, date, time, lceq, source)
);

CREATE INDEX IF NOT EXISTS idx_sessions_date_session
  ON sessions(date, session, time);

CREATE TRIGGER IF NOT EXISTS trg_sessions_plot_only
BEFORE UPDATE OF session, date, time, lceq, source, location ON sessions
BEGIN
  SELECT RAISE(FAIL, 'sessions only allows plot updates');
END;

CREATE TRIGGER IF NOT EXISTS trg_sessions_no_delete
BEFORE DELETE ON sessions
BEGIN
  SELECT RAISE(FAIL, 'sessions is append-only');
END;
";

pub struct SqliteSplStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IngestOutcome {
    Inserted { readings: usize, location: Location },
    AlreadyProcessed,
    Rejected(Rejection),
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RejectedFile {
    pub source: String,
    pub kind: RejectionKind,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StoreFailure {
    pub source: String,
    pub error: String,
}

/// Running totals of one ingestion batch. Rejections and store failures are
/// collected here instead of aborting the batch.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct IngestReport {
    pub files_seen: usize,
    pub inserted_files: usize,
    pub inserted_readings: usize,
    pub duplicates: usize,
    pub rejected: Vec<RejectedFile>,
    pub store_failures: Vec<StoreFailure>,
}

impl IngestReport {
    pub fn record(&mut self, source: &str, outcome: IngestOutcome) {
        self.files_seen += 1;
        match outcome {
            IngestOutcome::Inserted { readings, .. } => {
                self.inserted_files += 1;
                self.inserted_readings += readings;
            }
            IngestOutcome::AlreadyProcessed => self.duplicates += 1,
            IngestOutcome::Rejected(rejection) => self.rejected.push(RejectedFile {
                source: source.to_string(),
                kind: rejection.kind,
                reason: rejection.reason,
            }),
        }
    }

    pub fn record_store_failure(&mut self, source: &str, err: &anyhow::Error) {
        self.files_seen += 1;
        self.store_failures.push(StoreFailure {
            source: source.to_string(),
            error: format!("{err:#}"),
        });
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AllocationReport {
    pub readings_scanned: usize,
    pub existing_tags: usize,
    pub tags_inserted: usize,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProcessedFile {
    pub content_hash: String,
    pub source: String,
    pub recorded_at: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StoreStats {
    pub schema_version: i64,
    pub readings: usize,
    pub processed_files: usize,
    pub session_tags: usize,
    pub session_instances: usize,
    pub plots_attached: usize,
    pub first_reading_at: Option<String>,
    pub last_reading_at: Option<String>,
}

impl SqliteSplStore {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_SPL_V1)
            .context("failed to apply spl schema")?;

        let now = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![SPL_MIGRATION_VERSION, now],
            )
            .context("failed to register spl schema migration")?;

        Ok(())
    }

    pub fn is_processed(&self, content_hash: &str) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM processed_files WHERE content_hash = ?1",
                params![content_hash],
                |row| row.get(0),
            )
            .optional()
            .context("failed to look up processed file hash")?;
        Ok(found.is_some())
    }

    /// Ingests one log file.
    ///
    /// Byte-identical content already recorded is skipped whatever its path.
    /// Rejected files leave the store untouched and are not recorded as
    /// processed, so they are inspected again on the next run. Accepted
    /// readings and the processed-file record commit in one transaction.
    pub fn ingest(
        &mut self,
        source: &str,
        content: &[u8],
        config: &MonitorConfig,
    ) -> Result<IngestOutcome> {
        let hash = content_hash(content);
        if self.is_processed(&hash)? {
            debug!(source, hash = %hash, "skipping already processed content");
            return Ok(IngestOutcome::AlreadyProcessed);
        }

        let readings = match prepare_readings(source, content, config) {
            Ok(readings) => readings,
            Err(rejection) => {
                warn!(source, kind = rejection.kind.as_str(), reason = %rejection.reason, "rejected log");
                return Ok(IngestOutcome::Rejected(rejection));
            }
        };

        let location = readings
            .first()
            .map_or(Location::Balcony, |reading| reading.location);
        let recorded_at = format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?;

        let tx = self
            .conn
            .transaction()
            .context("failed to start ingest transaction")?;
        insert_readings(&tx, &readings)?;
        tx.execute(
            "INSERT INTO processed_files(content_hash, source, recorded_at) VALUES (?1, ?2, ?3)",
            params![hash, source, recorded_at],
        )
        .with_context(|| format!("failed to record processed file {source}"))?;
        tx.commit().context("failed to commit ingest transaction")?;

        info!(source, readings = readings.len(), location = %location, "ingested log");
        Ok(IngestOutcome::Inserted {
            readings: readings.len(),
            location,
        })
    }

    /// Ingests every `(source, content)` pair. A store error on one file is
    /// rolled back and reported; the batch moves on to the next file.
    pub fn ingest_batch<I, S>(&mut self, files: I, config: &MonitorConfig) -> IngestReport
    where
        I: IntoIterator<Item = (S, Vec<u8>)>,
        S: AsRef<str>,
    {
        let mut report = IngestReport::default();
        for (source, content) in files {
            self.ingest_into(&mut report, source.as_ref(), &content, config);
        }
        report
    }

    pub fn ingest_into(
        &mut self,
        report: &mut IngestReport,
        source: &str,
        content: &[u8],
        config: &MonitorConfig,
    ) {
        match self.ingest(source, content, config) {
            Ok(outcome) => report.record(source, outcome),
            Err(err) => {
                warn!(source, error = %format!("{err:#}"), "store failure, file skipped");
                report.record_store_failure(source, &err);
            }
        }
    }

    pub fn list_readings(&self) -> Result<Vec<Reading>> {
        let mut stmt = self.conn.prepare(
            "SELECT timestamp, lcs, lceq, lceq1m, lceq10m, lzpeak, source, location
             FROM spl_data
             ORDER BY timestamp ASC, id ASC",
        )?;
        let rows = stmt.query_map([], parse_reading_row)?;
        collect_rows(rows).context("failed to load readings")
    }

    /// Readings at `location` with `start <= timestamp <= stop`, chronological.
    pub fn readings_between(
        &self,
        location: Location,
        start: PrimitiveDateTime,
        stop: PrimitiveDateTime,
    ) -> Result<Vec<Reading>> {
        let mut stmt = self.conn.prepare(
            "SELECT timestamp, lcs, lceq, lceq1m, lceq10m, lzpeak, source, location
             FROM spl_data
             WHERE location = ?1 AND timestamp >= ?2 AND timestamp <= ?3
             ORDER BY timestamp ASC, id ASC",
        )?;
        let rows = stmt.query_map(
            params![
                location.as_str(),
                timefmt::timestamp_key(start),
                timefmt::timestamp_key(stop)
            ],
            parse_reading_row,
        )?;
        collect_rows(rows).context("failed to load readings in range")
    }

    pub fn session_keys(&self) -> Result<BTreeSet<SessionKey>> {
        let mut stmt = self
            .conn
            .prepare("SELECT session, date, time, lceq, source FROM sessions")?;
        let rows = stmt.query_map([], |row| {
            let date_raw: String = row.get(1)?;
            let time_raw: String = row.get(2)?;
            let lceq: f64 = row.get(3)?;
            Ok(SessionKey {
                session: row.get(0)?,
                date: timefmt::parse_date(&date_raw).map_err(to_sql_error)?,
                time: timefmt::parse_time_of_day(&time_raw).map_err(to_sql_error)?,
                lceq_tenths: lceq_tenths(lceq),
                source: row.get(4)?,
            })
        })?;

        let mut keys = BTreeSet::new();
        for key in collect_rows(rows).context("failed to load session keys")? {
            keys.insert(key);
        }
        Ok(keys)
    }

    /// Returns the number of rows actually written; keys already present are
    /// ignored.
    pub fn insert_session_tags(&mut self, tags: &[SessionTag]) -> Result<usize> {
        let tx = self
            .conn
            .transaction()
            .context("failed to start session transaction")?;

        let mut inserted = 0;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO sessions(session, date, time, lceq, source, plot, location)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            )?;
            for tag in tags {
                inserted += stmt
                    .execute(params![
                        tag.session_label,
                        timefmt::date_key(tag.occurrence_date),
                        timefmt::time_of_day_key(tag.time_of_day),
                        tag.lceq,
                        tag.source,
                        tag.plot_ref,
                        tag.location.as_str(),
                    ])
                    .with_context(|| format!("failed to insert session tag {}", tag.session_label))?;
            }
        }

        tx.commit().context("failed to commit session transaction")?;
        Ok(inserted)
    }

    /// Tags every stored reading against `windows`, persisting only new keys.
    pub fn allocate_sessions(&mut self, windows: &[SessionWindow]) -> Result<AllocationReport> {
        let readings = self.list_readings()?;
        let existing = self.session_keys()?;
        let tags = allocate(&readings, windows, &existing);
        let inserted = self.insert_session_tags(&tags)?;

        info!(
            readings = readings.len(),
            existing = existing.len(),
            inserted,
            "allocated sessions"
        );
        Ok(AllocationReport {
            readings_scanned: readings.len(),
            existing_tags: existing.len(),
            tags_inserted: inserted,
        })
    }

    pub fn list_session_tags(&self) -> Result<Vec<SessionTag>> {
        let mut stmt = self.conn.prepare(
            "SELECT session, date, time, lceq, source, location, plot
             FROM sessions
             ORDER BY date ASC, session ASC, time ASC, id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let date_raw: String = row.get(1)?;
            let time_raw: String = row.get(2)?;
            let location_raw: String = row.get(5)?;
            Ok(SessionTag {
                session_label: row.get(0)?,
                occurrence_date: timefmt::parse_date(&date_raw).map_err(to_sql_error)?,
                time_of_day: timefmt::parse_time_of_day(&time_raw).map_err(to_sql_error)?,
                lceq: row.get(3)?,
                source: row.get(4)?,
                location: parse_location(&location_raw)?,
                plot_ref: row.get(6)?,
            })
        })?;
        collect_rows(rows).context("failed to load session tags")
    }

    /// Joins every tag back to the stored reading it was allocated from, so
    /// evaluation sees the unrounded level and the recorded timestamp.
    ///
    /// A tag matches the reading from the same source and location whose
    /// timestamp is the tag's time on its occurrence date or the day after,
    /// and whose level rounds to the tag's tenths.
    pub fn list_tagged_readings(&self) -> Result<Vec<TaggedReading>> {
        let mut stmt = self.conn.prepare(
            "SELECT s.session, s.date, d.timestamp, d.lceq, d.source, d.location
             FROM sessions s
             JOIN spl_data d ON d.id = (
               SELECT c.id FROM spl_data c
               WHERE c.source = s.source
                 AND c.location = s.location
                 AND c.timestamp IN (s.date || ' ' || s.time, date(s.date, '+1 day') || ' ' || s.time)
                 AND CAST(round(c.lceq * 10) AS INTEGER) = CAST(round(s.lceq * 10) AS INTEGER)
               ORDER BY c.timestamp ASC, c.id ASC
               LIMIT 1
             )
             ORDER BY s.date ASC, s.session ASC, d.timestamp ASC, s.id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let date_raw: String = row.get(1)?;
            let timestamp_raw: String = row.get(2)?;
            let location_raw: String = row.get(5)?;
            Ok(TaggedReading {
                session_label: row.get(0)?,
                occurrence_date: timefmt::parse_date(&date_raw).map_err(to_sql_error)?,
                timestamp: timefmt::parse_timestamp(&timestamp_raw).map_err(to_sql_error)?,
                lceq: row.get(3)?,
                source: row.get(4)?,
                location: parse_location(&location_raw)?,
            })
        })?;
        collect_rows(rows).context("failed to load tagged readings")
    }

    /// Attaches a rendered plot reference to every tag of one session
    /// instance. Returns the number of tags updated.
    pub fn set_plot_ref(&self, session: &str, date: Date, plot: &str) -> Result<usize> {
        let updated = self
            .conn
            .execute(
                "UPDATE sessions SET plot = ?1 WHERE session = ?2 AND date = ?3",
                params![plot, session, timefmt::date_key(date)],
            )
            .with_context(|| format!("failed to set plot for {session} on {date}"))?;
        Ok(updated)
    }

    pub fn list_processed_files(&self) -> Result<Vec<ProcessedFile>> {
        let mut stmt = self.conn.prepare(
            "SELECT content_hash, source, recorded_at FROM processed_files ORDER BY recorded_at ASC, source ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ProcessedFile {
                content_hash: row.get(0)?,
                source: row.get(1)?,
                recorded_at: row.get(2)?,
            })
        })?;
        collect_rows(rows).context("failed to load processed files")
    }

    pub fn store_stats(&self) -> Result<StoreStats> {
        let schema_version: i64 = self
            .conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .context("failed to read schema version")?;
        let (first_reading_at, last_reading_at): (Option<String>, Option<String>) = self
            .conn
            .query_row("SELECT MIN(timestamp), MAX(timestamp) FROM spl_data", [], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })
            .context("failed to read reading range")?;

        Ok(StoreStats {
            schema_version,
            readings: self.count("SELECT COUNT(*) FROM spl_data")?,
            processed_files: self.count("SELECT COUNT(*) FROM processed_files")?,
            session_tags: self.count("SELECT COUNT(*) FROM sessions")?,
            session_instances: self
                .count("SELECT COUNT(*) FROM (SELECT DISTINCT date, session FROM sessions)")?,
            plots_attached: self.count("SELECT COUNT(*) FROM sessions WHERE plot IS NOT NULL")?,
            first_reading_at,
            last_reading_at,
        })
    }

    fn count(&self, sql: &str) -> Result<usize> {
        let value: i64 = self
            .conn
            .query_row(sql, [], |row| row.get(0))
            .with_context(|| format!("failed to run count query: {sql}"))?;
        usize::try_from(value).with_context(|| format!("negative count: {value}"))
    }

    #[cfg(test)]
    fn connection(&self) -> &Connection {
        &self.conn
    }
}

/// SHA-256 hex digest of the full file content.
#[must_use]
pub fn content_hash(content: &[u8]) -> String {
    hex::encode(Sha256::digest(content))
}

/// Runs the header check, the parser and the plausibility filter.
///
/// Only rows whose averaged channels all reach the configured floor survive;
/// a file left with no rows is rejected as implausible.
pub fn prepare_readings(
    source: &str,
    content: &[u8],
    config: &MonitorConfig,
) -> std::result::Result<Vec<Reading>, Rejection> {
    if let HeaderVerdict::Invalid(reason) = inspect_header(content, config) {
        return Err(Rejection::new(RejectionKind::Validation, reason));
    }

    let text = std::str::from_utf8(content)
        .map_err(|err| Rejection::new(RejectionKind::Validation, err.to_string()))?;
    let location = detect_location(text, config);

    let parsed = parse_log(text, config)
        .map_err(|err| Rejection::new(RejectionKind::Parse, err.to_string()))?;
    let readings = parsed
        .readings(source, location)
        .map_err(|err| Rejection::new(RejectionKind::MissingExtendedColumns, err.to_string()))?;

    let total = readings.len();
    let plausible: Vec<Reading> = readings
        .into_iter()
        .filter(|reading| reading.is_plausible(config.min_spl_db))
        .collect();

    if plausible.is_empty() {
        return Err(Rejection::new(
            RejectionKind::Implausible,
            format!(
                "none of {total} rows reach {} dB on every channel",
                config.min_spl_db
            ),
        ));
    }

    Ok(plausible)
}

fn insert_readings(tx: &Transaction<'_>, readings: &[Reading]) -> Result<()> {
    let mut stmt = tx.prepare_cached(
        "INSERT INTO spl_data(timestamp, lceq, lcs, lceq1m, lceq10m, lzpeak, source, location)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )?;
    for reading in readings {
        stmt.execute(params![
            timefmt::timestamp_key(reading.timestamp),
            reading.lceq,
            reading.lcs,
            reading.lceq1m,
            reading.lceq10m,
            reading.lzpeak,
            reading.source,
            reading.location.as_str(),
        ])
        .with_context(|| format!("failed to insert reading from {}", reading.source))?;
    }
    Ok(())
}

fn parse_reading_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Reading> {
    let timestamp_raw: String = row.get(0)?;
    let location_raw: String = row.get(7)?;
    Ok(Reading {
        timestamp: timefmt::parse_timestamp(&timestamp_raw).map_err(to_sql_error)?,
        lcs: row.get(1)?,
        lceq: row.get(2)?,
        lceq1m: row.get(3)?,
        lceq10m: row.get(4)?,
        lzpeak: row.get(5)?,
        source: row.get(6)?,
        location: parse_location(&location_raw)?,
    })
}

fn parse_location(raw: &str) -> rusqlite::Result<Location> {
    Location::parse(raw).ok_or_else(|| to_sql_error(format!("unknown location {raw:?}")))
}

#[allow(clippy::needless_pass_by_value)]
fn to_sql_error(err: impl Display) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            err.to_string(),
        )),
    )
}

fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
