//! Archive transport - Move directory trees to and from the sync folder.

use crate::archive;
use crate::error::{Result, SyncError};
use crate::sync::SyncFolder;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Result of a successful upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReport {
    pub archive_name: String,
    pub file_id: String,
    pub entries: usize,
    pub bytes: u64,
    /// An existing remote file was overwritten in place
    pub replaced: bool,
}

/// Result of a download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    Extracted { entries: usize, bytes: u64 },
    /// Remote file is a native Google document; nothing was written
    NativeDocument { mime_type: String },
}

/// Temporary archive removed on drop.
struct TempArchive {
    path: PathBuf,
}

impl TempArchive {
    fn new(path: PathBuf) -> Self {
        Self { path }
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempArchive {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed temporary archive {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                "Could not remove temporary archive {}: {}",
                self.path.display(),
                e
            ),
        }
    }
}

/// Zip `root_dir` and store it in the sync folder as `archive_name`.
///
/// An existing file with that name is updated in place, keeping its id.
pub fn upload_directory(
    folder: &SyncFolder,
    root_dir: &Path,
    archive_name: &str,
    exclude: &[String],
) -> Result<UploadReport> {
    if !root_dir.is_dir() {
        return Err(SyncError::missing_dir(root_dir));
    }

    let temp = TempArchive::new(
        std::env::temp_dir().join(format!("mcdrive-{}-{}", uuid::Uuid::new_v4(), archive_name)),
    );

    info!("Compressing {}", root_dir.display());
    let stats = archive::compress_dir(root_dir, temp.path(), exclude)?;

    let (file, replaced) = match folder.find_file(archive_name)? {
        Some(existing) => {
            info!("Replacing '{}' ({})", archive_name, existing.id);
            (folder.api().update_file(&existing.id, temp.path())?, true)
        }
        None => {
            info!("Uploading new file '{}'", archive_name);
            (
                folder
                    .api()
                    .create_file(folder.id(), archive_name, temp.path())?,
                false,
            )
        }
    };

    info!(
        "Uploaded '{}' ({} entries, {} bytes)",
        archive_name, stats.entries, stats.bytes
    );
    Ok(UploadReport {
        archive_name: archive_name.to_string(),
        file_id: file.id,
        entries: stats.entries,
        bytes: stats.bytes,
        replaced,
    })
}

/// Fetch `archive_name` from the sync folder and extract it into `dest_dir`.
///
/// The archive is verified before anything is extracted.
pub fn download_archive(
    folder: &SyncFolder,
    archive_name: &str,
    dest_dir: &Path,
) -> Result<DownloadOutcome> {
    let file = folder.find_file(archive_name)?.ok_or_else(|| {
        SyncError::NotFound(format!("'{}' is not in the sync folder", archive_name))
    })?;

    if file.is_native_document() {
        warn!(
            "'{}' is a Google document ({}) and cannot be downloaded as an archive",
            archive_name, file.mime_type
        );
        return Ok(DownloadOutcome::NativeDocument {
            mime_type: file.mime_type,
        });
    }

    std::fs::create_dir_all(dest_dir).map_err(|e| SyncError::fs(dest_dir, e))?;
    let temp = TempArchive::new(dest_dir.join(archive_name));

    info!("Downloading '{}' to {}", archive_name, temp.path().display());
    {
        let out = File::create(temp.path()).map_err(|e| SyncError::fs(temp.path(), e))?;
        let mut writer = BufWriter::new(out);
        folder.api().download(&file.id, &mut writer)?;
        writer.flush().map_err(|e| SyncError::fs(temp.path(), e))?;
    }

    archive::verify(temp.path())?;
    let stats = archive::extract(temp.path(), dest_dir, Some(archive_name))?;

    info!(
        "Extracted '{}' into {} ({} entries)",
        archive_name,
        dest_dir.display(),
        stats.entries
    );
    Ok(DownloadOutcome::Extracted {
        entries: stats.entries,
        bytes: stats.bytes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::drive::FOLDER_MIME_TYPE;
    use crate::sync::memory::MemoryDrive;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn folder(drive: &Arc<MemoryDrive>) -> SyncFolder {
        let created = drive.insert(None, "MC_GoogleDriveSync", FOLDER_MIME_TYPE, vec![]);
        SyncFolder::new(drive.clone(), created.id)
    }

    #[test]
    fn test_missing_root_uploads_nothing() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let drive = MemoryDrive::shared();
        let folder = folder(&drive);

        let result = upload_directory(&folder, &temp_dir.path().join("nope"), "nope.zip", &[]);
        assert!(matches!(result, Err(SyncError::Filesystem { .. })));
        assert_eq!(drive.uploads(), 0);
        Ok(())
    }

    #[test]
    fn test_missing_remote_is_not_found() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let drive = MemoryDrive::shared();
        let result = download_archive(&folder(&drive), "world1.zip", temp_dir.path());
        assert!(matches!(result, Err(SyncError::NotFound(_))));
        Ok(())
    }

    #[test]
    fn test_download_removes_temporary_archive() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let source = temp_dir.path().join("source");
        std::fs::create_dir_all(source.join("data"))?;
        std::fs::write(source.join("data").join("stats.json"), "{}")?;

        let drive = MemoryDrive::shared();
        let folder = folder(&drive);
        upload_directory(&folder, &source, "world1.zip", &[])?;

        let dest = temp_dir.path().join("dest");
        let outcome = download_archive(&folder, "world1.zip", &dest)?;
        assert_eq!(outcome, DownloadOutcome::Extracted { entries: 2, bytes: 2 });
        assert!(dest.join("data").join("stats.json").exists());
        assert!(!dest.join("world1.zip").exists());
        Ok(())
    }
}
