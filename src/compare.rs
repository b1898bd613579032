//! Version comparator - Remote archive metadata next to local directory state.
//!
//! Purely informational. An archive's timestamp is the time of its last
//! upload while the local side reports the newest file mtime, so the
//! [`Freshness`] hint is shown to the user and never acted upon.

use crate::archive;
use crate::error::{Result, SyncError};
use crate::layout::{GameLayout, SyncUnit};
use crate::sync::{DriveFile, SyncFolder};
use chrono::{DateTime, Local, Utc};
use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

/// Parse a Drive `modifiedTime` (RFC 3339, any fraction length).
pub fn parse_remote_time(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .ok()
}

/// Remote side of a comparison.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRecord {
    pub id: String,
    pub name: String,
    pub modified: Option<DateTime<Utc>>,
    pub size: Option<u64>,
}

impl RemoteRecord {
    pub fn from_drive_file(file: &DriveFile) -> Self {
        Self {
            id: file.id.clone(),
            name: file.name.clone(),
            modified: file.modified_time.as_deref().and_then(parse_remote_time),
            size: file.size,
        }
    }

    pub fn modified_local(&self) -> Option<DateTime<Local>> {
        self.modified.map(|t| t.with_timezone(&Local))
    }
}

/// Local side of a comparison. Computed on demand, never cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalSnapshot {
    pub path: PathBuf,
    /// Newest file mtime; `None` for a directory without files
    pub latest_modified: Option<DateTime<Local>>,
    pub total_size: u64,
    pub file_count: usize,
}

impl LocalSnapshot {
    pub fn capture(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            return Err(SyncError::missing_dir(dir));
        }

        let mut snapshot = LocalSnapshot {
            path: dir.to_path_buf(),
            latest_modified: None,
            total_size: 0,
            file_count: 0,
        };

        for entry in WalkDir::new(dir).min_depth(1) {
            let entry = entry.map_err(|e| {
                let path = e.path().unwrap_or(dir).to_path_buf();
                SyncError::fs(path, e.into())
            })?;
            if !archive::is_file_entry(&entry) {
                continue;
            }

            // Follows a linked file to its target, as the archive does
            let metadata =
                std::fs::metadata(entry.path()).map_err(|e| SyncError::fs(entry.path(), e))?;
            let modified: DateTime<Local> = metadata
                .modified()
                .map_err(|e| SyncError::fs(entry.path(), e))?
                .into();

            snapshot.total_size += metadata.len();
            snapshot.file_count += 1;
            if snapshot.latest_modified.map_or(true, |latest| modified > latest) {
                snapshot.latest_modified = Some(modified);
            }
        }

        debug!(
            "Snapshot of {}: {} files, {} bytes",
            dir.display(),
            snapshot.file_count,
            snapshot.total_size
        );
        Ok(snapshot)
    }
}

/// Which side looks newer by plain timestamp comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    RemoteNewer,
    LocalNewer,
    Same,
    /// One of the timestamps is missing
    Unknown,
}

impl Freshness {
    pub fn between(remote: Option<DateTime<Utc>>, local: Option<DateTime<Local>>) -> Self {
        match (remote, local) {
            (Some(remote), Some(local)) => match remote.cmp(&local.with_timezone(&Utc)) {
                Ordering::Greater => Freshness::RemoteNewer,
                Ordering::Less => Freshness::LocalNewer,
                Ordering::Equal => Freshness::Same,
            },
            _ => Freshness::Unknown,
        }
    }
}

impl fmt::Display for Freshness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Freshness::RemoteNewer => "remote is newer",
            Freshness::LocalNewer => "local is newer",
            Freshness::Same => "same time",
            Freshness::Unknown => "unknown",
        })
    }
}

/// Both sides of one sync unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitComparison {
    pub unit: SyncUnit,
    pub remote: RemoteRecord,
    pub local: LocalSnapshot,
    pub freshness: Freshness,
}

impl UnitComparison {
    fn new(unit: SyncUnit, remote: RemoteRecord, local: LocalSnapshot) -> Self {
        let freshness = Freshness::between(remote.modified, local.latest_modified);
        Self {
            unit,
            remote,
            local,
            freshness,
        }
    }
}

/// Comparison of saves and mods together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionReport {
    pub saves: UnitComparison,
    pub mods: UnitComparison,
}

impl VersionReport {
    pub fn units(&self) -> [&UnitComparison; 2] {
        [&self.saves, &self.mods]
    }
}

fn fetch_remote(folder: &SyncFolder, layout: &GameLayout, unit: SyncUnit) -> Result<RemoteRecord> {
    let name = layout.archive_name(unit);
    let file = folder
        .find_file(&name)?
        .ok_or_else(|| SyncError::NotFound(format!("'{}' is not in the sync folder", name)))?;
    Ok(RemoteRecord::from_drive_file(&file))
}

/// Compare a single unit.
pub fn compare_unit(
    folder: &SyncFolder,
    layout: &GameLayout,
    unit: SyncUnit,
) -> Result<UnitComparison> {
    let remote = fetch_remote(folder, layout, unit)?;
    let local = LocalSnapshot::capture(&layout.local_dir(unit))?;
    Ok(UnitComparison::new(unit, remote, local))
}

/// Compare saves and mods. Remote records are fetched before any local walk.
pub fn compare_all(folder: &SyncFolder, layout: &GameLayout) -> Result<VersionReport> {
    let remote_saves = fetch_remote(folder, layout, SyncUnit::Saves)?;
    let remote_mods = fetch_remote(folder, layout, SyncUnit::Mods)?;
    let local_saves = LocalSnapshot::capture(&layout.local_dir(SyncUnit::Saves))?;
    let local_mods = LocalSnapshot::capture(&layout.local_dir(SyncUnit::Mods))?;

    let report = VersionReport {
        saves: UnitComparison::new(SyncUnit::Saves, remote_saves, local_saves),
        mods: UnitComparison::new(SyncUnit::Mods, remote_mods, local_mods),
    };
    for unit in report.units() {
        info!("Compared {}: {}", unit.unit, unit.freshness);
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::fs::File;
    use std::time::SystemTime;
    use tempfile::TempDir;

    #[test]
    fn test_parse_remote_time_fractions() {
        let micros = parse_remote_time("2024-01-01T00:00:00.000000Z").unwrap();
        let millis = parse_remote_time("2024-01-01T00:00:00.000Z").unwrap();
        let plain = parse_remote_time("2024-01-01T00:00:00Z").unwrap();
        assert_eq!(micros, millis);
        assert_eq!(millis, plain);
        assert_eq!(micros, Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        assert!(parse_remote_time("yesterday").is_none());
    }

    #[test]
    fn test_local_newer_after_timezone_conversion() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("level.dat");
        std::fs::write(&path, "12345")?;

        let local_time = Local
            .with_ymd_and_hms(2024, 1, 2, 8, 0, 0)
            .earliest()
            .expect("valid local time");
        File::options()
            .write(true)
            .open(&path)?
            .set_modified(SystemTime::from(local_time))?;

        let snapshot = LocalSnapshot::capture(temp_dir.path())?;
        assert_eq!(snapshot.file_count, 1);
        assert_eq!(snapshot.total_size, 5);
        assert_eq!(snapshot.latest_modified, Some(local_time));

        let remote = parse_remote_time("2024-01-01T00:00:00.000000Z");
        assert_eq!(
            Freshness::between(remote, snapshot.latest_modified),
            Freshness::LocalNewer
        );
        Ok(())
    }

    #[test]
    fn test_freshness_unknown_without_timestamps() {
        let now = Utc::now();
        assert_eq!(Freshness::between(None, Some(Local::now())), Freshness::Unknown);
        assert_eq!(Freshness::between(Some(now), None), Freshness::Unknown);
        assert_eq!(
            Freshness::between(Some(now), Some(now.with_timezone(&Local))),
            Freshness::Same
        );
    }

    #[test]
    fn test_snapshot_of_missing_dir_fails() {
        let result = LocalSnapshot::capture(Path::new("/definitely/not/here/mods"));
        assert!(matches!(result, Err(SyncError::Filesystem { .. })));
    }

    #[test]
    fn test_empty_dir_has_no_timestamp() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        std::fs::create_dir(temp_dir.path().join("empty"))?;
        let snapshot = LocalSnapshot::capture(temp_dir.path())?;
        assert_eq!(snapshot.file_count, 0);
        assert_eq!(snapshot.latest_modified, None);
        Ok(())
    }
}
