use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use spl_monitor_core::timefmt::{format_rfc3339, now_utc};
use spl_monitor_core::Evaluation;
use spl_monitor_store_sqlite::RejectedFile;
use tracing::info;
use ulid::Ulid;

pub const BAD_FILES_CSV: &str = "bad_files.csv";
pub const SUMMARY_CSV: &str = "Session_Max_Summary.csv";
pub const BREACHES_CSV: &str = "Breaches.csv";
pub const BATCH_DETAILS: &str = "batch_details.txt";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BatchMetadata {
    pub run_id: Ulid,
    pub generated_at: String,
    pub database: String,
    pub days_processed: usize,
    pub sessions_processed: usize,
    pub readings_evaluated: usize,
    pub breach_events: usize,
    pub output_dir: String,
    pub summary_csv: String,
    pub breaches_csv: String,
    pub batch_details: String,
}

/// Writes `bad_file,reason` rows. Nothing is written for an empty list.
pub fn write_bad_files(path: &Path, rejected: &[RejectedFile]) -> Result<Option<PathBuf>> {
    if rejected.is_empty() {
        return Ok(None);
    }

    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    writer
        .write_record(["bad_file", "reason"])
        .context("failed to write bad files header")?;
    for file in rejected {
        let reason = format!("{}: {}", file.kind.as_str(), file.reason);
        writer
            .write_record([file.source.as_str(), reason.as_str()])
            .with_context(|| format!("failed to write bad file row for {}", file.source))?;
    }
    writer.flush().context("failed to flush bad files report")?;

    info!(path = %path.display(), files = rejected.len(), "bad files logged");
    Ok(Some(path.to_path_buf()))
}

/// Replaces the summary, breach and metadata outputs in `output_dir`.
pub fn write_evaluation(
    output_dir: &Path,
    database: &Path,
    evaluation: &Evaluation,
) -> Result<BatchMetadata> {
    fs::create_dir_all(output_dir)
        .with_context(|| format!("failed to create output directory {}", output_dir.display()))?;

    let summary_path = output_dir.join(SUMMARY_CSV);
    let breaches_path = output_dir.join(BREACHES_CSV);
    let details_path = output_dir.join(BATCH_DETAILS);
    for stale in [&summary_path, &breaches_path, &details_path] {
        if stale.exists() {
            fs::remove_file(stale)
                .with_context(|| format!("failed to remove previous output {}", stale.display()))?;
        }
    }

    write_rows(&summary_path, &evaluation.summaries)?;
    write_rows(&breaches_path, &evaluation.breaches)?;

    let metadata = BatchMetadata {
        run_id: Ulid::new(),
        generated_at: format_rfc3339(now_utc()).map_err(|err| anyhow!(err.to_string()))?,
        database: database.display().to_string(),
        days_processed: evaluation.days_processed,
        sessions_processed: evaluation.sessions_processed,
        readings_evaluated: evaluation.readings_evaluated,
        breach_events: evaluation.breaches.len(),
        output_dir: output_dir.display().to_string(),
        summary_csv: summary_path.display().to_string(),
        breaches_csv: breaches_path.display().to_string(),
        batch_details: details_path.display().to_string(),
    };
    write_batch_details(&details_path, &metadata)?;

    info!(
        run_id = %metadata.run_id,
        sessions = metadata.sessions_processed,
        breaches = metadata.breach_events,
        "evaluation reports written"
    );
    Ok(metadata)
}

fn write_rows<T: Serialize>(path: &Path, rows: &[T]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    for row in rows {
        writer
            .serialize(row)
            .with_context(|| format!("failed to write row to {}", path.display()))?;
    }
    writer
        .flush()
        .with_context(|| format!("failed to flush {}", path.display()))?;
    Ok(())
}

fn write_batch_details(path: &Path, metadata: &BatchMetadata) -> Result<()> {
    let mut file = fs::File::create(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    let body = format!(
        "Batch run completed: {}\n\
         Run id: {}\n\
         Database source: {}\n\
         Days processed: {}\n\
         Sessions processed: {}\n\
         Readings evaluated: {}\n\
         Breach events: {}\n\
         Output directory: {}\n\
         Summary CSV: {}\n\
         Breaches CSV: {}\n",
        metadata.generated_at,
        metadata.run_id,
        metadata.database,
        metadata.days_processed,
        metadata.sessions_processed,
        metadata.readings_evaluated,
        metadata.breach_events,
        metadata.output_dir,
        metadata.summary_csv,
        metadata.breaches_csv,
    );
    file.write_all(body.as_bytes())
        .with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use spl_monitor_core::{evaluate, Location, MonitorConfig, RejectionKind, TaggedReading};
    use time::macros::{date, datetime};

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn fixture_dir(label: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("splmon-report-{label}-{}", Ulid::new()));
        must(fs::create_dir_all(&dir).map_err(anyhow::Error::from));
        dir
    }

    fn read(path: &Path) -> String {
        fs::read_to_string(path)
            .unwrap_or_else(|err| panic!("failed to read {}: {err}", path.display()))
    }

    #[test]
    fn bad_files_report_is_skipped_when_empty() {
        let dir = fixture_dir("empty");
        let path = dir.join(BAD_FILES_CSV);
        assert_eq!(must(write_bad_files(&path, &[])), None);
        assert!(!path.exists());
    }

    #[test]
    fn bad_files_report_lists_source_and_reason() {
        let dir = fixture_dir("bad");
        let path = dir.join(BAD_FILES_CSV);
        let rejected = vec![RejectedFile {
            source: "20250516/short, log.txt".to_string(),
            kind: RejectionKind::MissingExtendedColumns,
            reason: "missing required columns: lceq1m".to_string(),
        }];
        must(write_bad_files(&path, &rejected));

        let body = read(&path);
        let mut lines = body.lines();
        assert_eq!(lines.next(), Some("bad_file,reason"));
        assert_eq!(
            lines.next(),
            Some("\"20250516/short, log.txt\",missing_extended_columns: missing required columns: lceq1m")
        );
    }

    #[test]
    fn evaluation_outputs_replace_previous_run() {
        let dir = fixture_dir("eval");
        must(fs::write(dir.join(BREACHES_CSV), "stale").map_err(anyhow::Error::from));

        let readings = vec![TaggedReading {
            session_label: "Friday_01-04".to_string(),
            occurrence_date: date!(2025-05-16),
            timestamp: datetime!(2025-05-16 02:00),
            lceq: 85.0,
            source: "20250516/a.txt".to_string(),
            location: Location::Balcony,
        }];
        let evaluation = evaluate(&readings, &MonitorConfig::v1());
        let metadata = must(write_evaluation(&dir, Path::new("club_sessions.db"), &evaluation));

        assert_eq!(metadata.sessions_processed, 1);
        assert_eq!(metadata.breach_events, 1);

        let summary = read(&dir.join(SUMMARY_CSV));
        assert!(summary.starts_with("session_id,session_label,occurrence_date,epoch,"));
        assert!(summary.contains("2025-05-16_Friday_01-04"));

        let breaches = read(&dir.join(BREACHES_CSV));
        assert!(!breaches.contains("stale"));
        assert!(breaches.contains("Balcony"));

        let details = read(&dir.join(BATCH_DETAILS));
        assert!(details.contains("Sessions processed: 1"));
        assert!(details.contains(&format!("Run id: {}", metadata.run_id)));
    }
}
