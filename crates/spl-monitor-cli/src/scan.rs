//! Discovery of instrument logs under a measurement root.
//!
//! Only top-level folders named `YYYYMMDD` are visited. Inside them every
//! `.txt` file, at any depth, is a candidate log.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use spl_monitor_core::{MonitorConfig, Rejection, RejectionKind};
use spl_monitor_store_sqlite::{IngestOutcome, IngestReport, SqliteSplStore};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFile {
    /// Path relative to the scan root, `/` separated.
    pub source: String,
    pub path: PathBuf,
}

/// A day-folder entry the walker could not access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnreadableEntry {
    pub source: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Discovery {
    pub logs: Vec<LogFile>,
    pub unreadable: Vec<UnreadableEntry>,
}

#[must_use]
pub fn is_day_folder(name: &str) -> bool {
    name.len() == 8 && name.bytes().all(|byte| byte.is_ascii_digit())
}

#[must_use]
pub fn is_log_file(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("txt"))
}

pub fn discover_logs(root: &Path) -> Result<Discovery> {
    let entries = std::fs::read_dir(root)
        .with_context(|| format!("failed to read log root {}", root.display()))?;

    let mut day_folders = Vec::new();
    for entry in entries {
        let entry = entry.with_context(|| format!("failed to list {}", root.display()))?;
        let is_dir = entry.file_type().is_ok_and(|kind| kind.is_dir());
        let name = entry.file_name();
        if is_dir && name.to_str().is_some_and(is_day_folder) {
            day_folders.push(entry.path());
        } else {
            debug!(path = %entry.path().display(), "ignoring entry outside day folders");
        }
    }
    day_folders.sort();

    let mut discovery = Discovery::default();
    for folder in day_folders {
        let walker = WalkDir::new(&folder)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter();

        for entry in walker {
            match entry {
                Ok(entry) if entry.file_type().is_file() && is_log_file(entry.path()) => {
                    discovery.logs.push(LogFile {
                        source: relative_source(root, entry.path()),
                        path: entry.path().to_path_buf(),
                    });
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(folder = %folder.display(), error = %err, "error accessing entry");
                    let path = err.path().unwrap_or(folder.as_path());
                    discovery.unreadable.push(UnreadableEntry {
                        source: relative_source(root, path),
                        error: err.to_string(),
                    });
                }
            }
        }
    }

    info!(
        root = %root.display(),
        logs = discovery.logs.len(),
        unreadable = discovery.unreadable.len(),
        "discovered log files"
    );
    Ok(discovery)
}

/// Ingests every discovered log. Unreadable files and day-folder entries the
/// walker could not access are rejected; only a root that cannot be listed
/// fails the call.
pub fn ingest_tree(
    store: &mut SqliteSplStore,
    root: &Path,
    config: &MonitorConfig,
) -> Result<IngestReport> {
    let discovery = discover_logs(root)?;
    let mut report = IngestReport::default();
    for entry in &discovery.unreadable {
        report.record(
            &entry.source,
            IngestOutcome::Rejected(Rejection::new(
                RejectionKind::Unreadable,
                entry.error.clone(),
            )),
        );
    }

    for log in discovery.logs {
        match std::fs::read(&log.path) {
            Ok(content) => store.ingest_into(&mut report, &log.source, &content, config),
            Err(err) => {
                warn!(source = %log.source, error = %err, "unreadable log");
                report.record(
                    &log.source,
                    IngestOutcome::Rejected(Rejection::new(
                        RejectionKind::Unreadable,
                        err.to_string(),
                    )),
                );
            }
        }
    }

    info!(
        seen = report.files_seen,
        inserted = report.inserted_files,
        duplicates = report.duplicates,
        rejected = report.rejected.len(),
        store_failures = report.store_failures.len(),
        "ingest finished"
    );
    Ok(report)
}

fn relative_source(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use ulid::Ulid;

    fn fixture_root() -> PathBuf {
        let root = std::env::temp_dir().join(format!("splmon-scan-{}", Ulid::new()));
        for dir in ["20250516/deep", "20250517", "notes", "2025051"] {
            if let Err(err) = fs::create_dir_all(root.join(dir)) {
                panic!("failed to create fixture dir {dir}: {err}");
            }
        }
        for file in [
            "20250516/b.txt",
            "20250516/a.TXT",
            "20250516/deep/c.txt",
            "20250516/readme.md",
            "20250517/d.txt",
            "notes/ignored.txt",
            "2025051/ignored.txt",
            "loose.txt",
        ] {
            if let Err(err) = fs::write(root.join(file), "x") {
                panic!("failed to write fixture {file}: {err}");
            }
        }
        root
    }

    #[test]
    fn day_folder_names_are_eight_digits() {
        assert!(is_day_folder("20250516"));
        assert!(!is_day_folder("2025-05-16"));
        assert!(!is_day_folder("2025051"));
        assert!(!is_day_folder("202505160"));
    }

    #[test]
    fn discovery_is_sorted_and_limited_to_day_folders() {
        let root = fixture_root();
        let discovery = match discover_logs(&root) {
            Ok(value) => value,
            Err(err) => panic!("discovery failed: {err:#}"),
        };
        assert!(discovery.unreadable.is_empty());
        let sources: Vec<&str> = discovery
            .logs
            .iter().map(|log| log.source.as_str()).collect();
        assert_eq!(
            sources,
            vec![
                "20250516/a.TXT",
                "20250516/b.txt",
                "20250516/deep/c.txt",
                "20250517/d.txt",
            ]
        );
        let _ = fs::remove_dir_all(root);
    }

    #[cfg(unix)]
    #[test]
    fn locked_subfolder_is_rejected_as_unreadable() {
        use std::os::unix::fs::PermissionsExt;

        let root = fixture_root();
        let locked = root.join("20250516/deep");
        if let Err(err) = fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)) {
            panic!("failed to lock fixture dir: {err}");
        }
        if fs::read_dir(&locked).is_ok() {
            // Privileged users can read the folder regardless of its mode.
            let _ = fs::set_permissions(&locked, fs::Permissions::from_mode(0o755));
            let _ = fs::remove_dir_all(root);
            return;
        }

        let mut store = match SqliteSplStore::open(Path::new(":memory:")) {
            Ok(store) => store,
            Err(err) => panic!("failed to open store: {err:#}"),
        };
        if let Err(err) = store.migrate() {
            panic!("failed to migrate store: {err:#}");
        }
        let report = match ingest_tree(&mut store, &root, &MonitorConfig::v1()) {
            Ok(value) => value,
            Err(err) => panic!("ingest failed: {err:#}"),
        };

        let _ = fs::set_permissions(&locked, fs::Permissions::from_mode(0o755));
        let _ = fs::remove_dir_all(root);

        let unreadable: Vec<&str> = report
            .rejected
            .iter()
            .filter(|file| file.kind == RejectionKind::Unreadable)
            .map(|file| file.source.as_str())
            .collect();
        assert_eq!(unreadable, vec!["20250516/deep"]);
    }

    #[test]
    fn missing_root_is_an_error() {
        let root = std::env::temp_dir().join(format!("splmon-missing-{}", Ulid::new()));
        assert!(discover_logs(&root).is_err());
    }
}
