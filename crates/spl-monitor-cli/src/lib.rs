//! Command surface of the `splmon` binary.
//!
//! Every command prints its result as pretty JSON on stdout; progress and
//! per-file diagnostics go through `tracing` to stderr.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use spl_monitor_core::timefmt::{self, parse_date, parse_timestamp_bound};
use spl_monitor_core::{evaluate, Location, MonitorConfig};
use spl_monitor_store_sqlite::{AllocationReport, IngestReport, SqliteSplStore};
use time::PrimitiveDateTime;

pub mod report;
pub mod scan;

use report::{write_bad_files, write_evaluation, BatchMetadata, BAD_FILES_CSV};

#[derive(Debug, Parser)]
#[command(name = "splmon")]
#[command(about = "SPL log ingestion, session allocation and breach evaluation")]
pub struct Cli {
    #[arg(long, default_value = "./club_sessions.db")]
    db: PathBuf,

    /// JSON configuration file; built-in defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Ingest every log under the day folders of a measurement root.
    Ingest(IngestArgs),
    /// Tag stored readings with the configured session windows.
    Allocate,
    /// Write the session summary, breach and batch reports.
    Evaluate(EvaluateArgs),
    /// Ingest, allocate and evaluate in one pass.
    Run(RunArgs),
    /// Chronological readings for one location and time range.
    Query(QueryArgs),
    Sessions {
        #[command(subcommand)]
        command: SessionsCommand,
    },
    Status,
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Debug, Args)]
pub struct IngestArgs {
    #[arg(long)]
    root: PathBuf,
    #[arg(long, default_value = BAD_FILES_CSV)]
    bad_files: PathBuf,
}

#[derive(Debug, Args)]
pub struct EvaluateArgs {
    #[arg(long)]
    output: PathBuf,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    #[arg(long)]
    root: PathBuf,
    #[arg(long)]
    output: PathBuf,
    /// Defaults to `bad_files.csv` inside the output directory.
    #[arg(long)]
    bad_files: Option<PathBuf>,
}

#[derive(Debug, Args)]
pub struct QueryArgs {
    #[arg(long, value_enum, ignore_case = true)]
    location: LocationArg,
    /// `YYYY-MM-DD HH:MM:SS`, inclusive.
    #[arg(long)]
    start: String,
    /// `YYYY-MM-DD HH:MM:SS`, inclusive.
    #[arg(long)]
    stop: String,
}

#[derive(Debug, Subcommand)]
pub enum SessionsCommand {
    /// Attach a plot reference to every tag of one session instance.
    SetPlot(SetPlotArgs),
}

#[derive(Debug, Args)]
pub struct SetPlotArgs {
    #[arg(long)]
    session: String,
    /// Occurrence date, `YYYY-MM-DD`.
    #[arg(long)]
    date: String,
    #[arg(long)]
    plot: String,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    Show,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum LocationArg {
    Balcony,
    Nightclub,
}

impl From<LocationArg> for Location {
    fn from(value: LocationArg) -> Self {
        match value {
            LocationArg::Balcony => Self::Balcony,
            LocationArg::Nightclub => Self::Nightclub,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct IngestSummary {
    #[serde(flatten)]
    pub report: IngestReport,
    pub bad_files_report: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RunSummary {
    pub ingest: IngestSummary,
    pub allocation: AllocationReport,
    pub evaluation: BatchMetadata,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SeriesPoint {
    #[serde(with = "timefmt::timestamp_text")]
    pub timestamp: PrimitiveDateTime,
    pub lcs: f64,
    pub lceq: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct QuerySeries {
    pub location: Location,
    #[serde(with = "timefmt::timestamp_text")]
    pub start: PrimitiveDateTime,
    #[serde(with = "timefmt::timestamp_text")]
    pub stop: PrimitiveDateTime,
    pub points: Vec<SeriesPoint>,
    /// Loudest LCeq in range; the earliest one wins ties.
    pub peak: Option<SeriesPoint>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PlotAssignment {
    pub session: String,
    pub date: String,
    pub plot: String,
    pub updated: usize,
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when the configuration is invalid, the database cannot
/// be opened or migrated, or the command itself fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_deref())?;
    match cli.command {
        Command::Config {
            command: ConfigCommand::Show,
        } => print_json(&config),
        command => {
            let mut store = SqliteSplStore::open(&cli.db)?;
            store.migrate()?;
            run_command(command, &mut store, &cli.db, &config)
        }
    }
}

/// Executes one command against an open store.
///
/// # Errors
/// Returns an error when I/O on the log root or output directory fails, or a
/// store query fails.
pub fn run_command(
    command: Command,
    store: &mut SqliteSplStore,
    db_path: &Path,
    config: &MonitorConfig,
) -> Result<()> {
    match command {
        Command::Ingest(args) => {
            let summary = ingest(store, &args.root, &args.bad_files, config)?;
            print_json(&summary)
        }
        Command::Allocate => {
            let allocation = store.allocate_sessions(&config.sessions)?;
            print_json(&allocation)
        }
        Command::Evaluate(args) => {
            let metadata = evaluate_to(store, &args.output, db_path, config)?;
            print_json(&metadata)
        }
        Command::Run(args) => {
            std::fs::create_dir_all(&args.output).with_context(|| {
                format!("failed to create output directory {}", args.output.display())
            })?;
            let bad_files = args
                .bad_files
                .unwrap_or_else(|| args.output.join(BAD_FILES_CSV));
            let ingest = ingest(store, &args.root, &bad_files, config)?;
            let allocation = store.allocate_sessions(&config.sessions)?;
            let evaluation = evaluate_to(store, &args.output, db_path, config)?;
            print_json(&RunSummary {
                ingest,
                allocation,
                evaluation,
            })
        }
        Command::Query(args) => {
            let start = parse_timestamp_bound(&args.start)?;
            let stop = parse_timestamp_bound(&args.stop)?;
            let series = query_series(store, args.location.into(), start, stop)?;
            print_json(&series)
        }
        Command::Sessions {
            command: SessionsCommand::SetPlot(args),
        } => {
            let date = parse_date(&args.date)?;
            let updated = store.set_plot_ref(&args.session, date, &args.plot)?;
            if updated == 0 {
                return Err(anyhow!(
                    "no session tags for {} on {}",
                    args.session,
                    args.date
                ));
            }
            print_json(&PlotAssignment {
                session: args.session,
                date: timefmt::date_key(date),
                plot: args.plot,
                updated,
            })
        }
        Command::Status => print_json(&store.store_stats()?),
        Command::Config {
            command: ConfigCommand::Show,
        } => print_json(config),
    }
}

/// Reads `path` as a JSON configuration, or returns the built-in defaults.
///
/// # Errors
/// Returns an error when the file cannot be read or fails validation.
pub fn load_config(path: Option<&Path>) -> Result<MonitorConfig> {
    match path {
        Some(path) => Ok(MonitorConfig::load(path)?),
        None => Ok(MonitorConfig::v1()),
    }
}

fn ingest(
    store: &mut SqliteSplStore,
    root: &Path,
    bad_files: &Path,
    config: &MonitorConfig,
) -> Result<IngestSummary> {
    let report = scan::ingest_tree(store, root, config)?;
    let written = write_bad_files(bad_files, &report.rejected)?;
    Ok(IngestSummary {
        report,
        bad_files_report: written.map(|path| path.display().to_string()),
    })
}

fn evaluate_to(
    store: &SqliteSplStore,
    output: &Path,
    db_path: &Path,
    config: &MonitorConfig,
) -> Result<BatchMetadata> {
    let readings = store.list_tagged_readings()?;
    let evaluation = evaluate(&readings, config);
    write_evaluation(output, db_path, &evaluation)
}

/// Loads the chronological `(timestamp, lcs, lceq)` series for one location.
///
/// # Errors
/// Returns an error when `start` is after `stop` or the store query fails.
pub fn query_series(
    store: &SqliteSplStore,
    location: Location,
    start: PrimitiveDateTime,
    stop: PrimitiveDateTime,
) -> Result<QuerySeries> {
    if start > stop {
        return Err(anyhow!("start must not be after stop"));
    }

    let points: Vec<SeriesPoint> = store
        .readings_between(location, start, stop)?
        .into_iter()
        .map(|reading| SeriesPoint {
            timestamp: reading.timestamp,
            lcs: reading.lcs,
            lceq: reading.lceq,
        })
        .collect();

    let peak = points.iter().fold(None::<&SeriesPoint>, |best, point| match best {
        Some(best) if best.lceq >= point.lceq => Some(best),
        _ => Some(point),
    });

    Ok(QuerySeries {
        location,
        start,
        stop,
        peak: peak.cloned(),
        points,
    })
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::float_cmp)]

    use super::*;
    use time::macros::datetime;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn fixture_store() -> SqliteSplStore {
        let mut store = must(SqliteSplStore::open(Path::new(":memory:")));
        must(store.migrate());
        let content = "SPL log data saved by REW V5.40\n\
Note: balcony\n\
Date: 18/05/2025 2:00:00 PM\n\
Mic/meter cal: 7097828_90deg.txt\n\
\n\
Time[s],LCS,LCeq,LCeq1m,LCeq10m,LZpeak\n\
0.000,70.0,71.0,70.0,70.0,95.0\n\
0.171,74.0,75.5,70.0,70.0,95.0\n\
0.341,73.0,75.5,70.0,70.0,95.0\n";
        let outcome = must(store.ingest(
            "20250518/a.txt",
            content.as_bytes(),
            &MonitorConfig::v1(),
        ));
        assert!(matches!(
            outcome,
            spl_monitor_store_sqlite::IngestOutcome::Inserted { readings: 3, .. }
        ));
        store
    }

    #[test]
    fn query_series_reports_first_loudest_point() {
        let store = fixture_store();
        let series = must(query_series(
            &store,
            Location::Balcony,
            datetime!(2025-05-18 14:00:00),
            datetime!(2025-05-18 20:00:00),
        ));
        assert_eq!(series.points.len(), 3);
        let peak = match series.peak {
            Some(value) => value,
            None => panic!("expected a peak"),
        };
        assert_eq!(peak.lceq, 75.5);
        assert_eq!(peak.lcs, 74.0);
    }

    #[test]
    fn query_series_empty_range_has_no_peak() {
        let store = fixture_store();
        let series = must(query_series(
            &store,
            Location::Nightclub,
            datetime!(2025-05-18 14:00:00),
            datetime!(2025-05-18 20:00:00),
        ));
        assert!(series.points.is_empty());
        assert_eq!(series.peak, None);

        let value = must(serde_json::to_value(&series).map_err(anyhow::Error::from));
        assert_eq!(value["peak"], serde_json::Value::Null);
        assert_eq!(value["start"], "2025-05-18 14:00:00.000000");
    }

    #[test]
    fn inverted_range_is_rejected() {
        let store = fixture_store();
        assert!(query_series(
            &store,
            Location::Balcony,
            datetime!(2025-05-18 20:00:00),
            datetime!(2025-05-18 14:00:00),
        )
        .is_err());
    }

    #[test]
    fn location_argument_ignores_case() {
        let cli = Cli::try_parse_from([
            "splmon",
            "query",
            "--location",
            "Balcony",
            "--start",
            "2025-05-18 14:00:00",
            "--stop",
            "2025-05-18 20:00:00",
        ]);
        assert!(matches!(
            cli.map(|cli| cli.command),
            Ok(Command::Query(QueryArgs {
                location: LocationArg::Balcony,
                ..
            }))
        ));
    }
}
