//! Archive codec - zip a directory tree, verify a zip, extract it.

use crate::error::{Result, SyncError};
use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// What went into (or came out of) an archive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchiveStats {
    /// File and directory entries
    pub entries: usize,
    /// Uncompressed bytes of file entries
    pub bytes: u64,
}

/// Zip every file and directory under `root` into `zip_path`.
///
/// Entry names are `/`-separated paths relative to `root`. Files whose name
/// is in `exclude` are skipped at any depth.
pub fn compress_dir(root: &Path, zip_path: &Path, exclude: &[String]) -> Result<ArchiveStats> {
    if !root.is_dir() {
        return Err(SyncError::missing_dir(root));
    }

    let file = File::create(zip_path).map_err(|e| SyncError::fs(zip_path, e))?;
    let mut zip = ZipWriter::new(BufWriter::new(file));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut stats = ArchiveStats::default();

    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| walk_error(root, e))?;
        let path = entry.path();
        let name = entry_name(root, path)?;

        if entry.file_type().is_dir() {
            zip.add_directory(format!("{}/", name), options)?;
            stats.entries += 1;
            continue;
        }

        if !is_file_entry(&entry) {
            debug!("Skipping {}: linked directory or special file", name);
            continue;
        }

        if exclude.iter().any(|x| entry.file_name() == x.as_str()) {
            debug!("Excluding {} from archive", name);
            continue;
        }

        // Never zip the archive into itself
        if path == zip_path {
            continue;
        }

        zip.start_file(name, options)?;
        let mut source = File::open(path).map_err(|e| SyncError::fs(path, e))?;
        stats.bytes += io::copy(&mut source, &mut zip).map_err(|e| SyncError::fs(path, e))?;
        stats.entries += 1;
    }

    zip.finish()?;
    debug!(
        "Compressed {} into {} ({} entries, {} bytes)",
        root.display(),
        zip_path.display(),
        stats.entries,
        stats.bytes
    );
    Ok(stats)
}

/// Regular file, or a symlink resolving to one. Linked directories are
/// neither followed nor archived.
pub(crate) fn is_file_entry(entry: &walkdir::DirEntry) -> bool {
    if entry.file_type().is_file() {
        return true;
    }
    entry.path_is_symlink()
        && std::fs::metadata(entry.path())
            .map(|m| m.is_file())
            .unwrap_or(false)
}

fn entry_name(root: &Path, path: &Path) -> Result<String> {
    let relative = path.strip_prefix(root).map_err(|_| {
        SyncError::fs(
            path,
            io::Error::new(io::ErrorKind::InvalidInput, "path is outside the archive root"),
        )
    })?;
    Ok(relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/"))
}

fn walk_error(root: &Path, err: walkdir::Error) -> SyncError {
    let path = err.path().unwrap_or(root).to_path_buf();
    let source = err
        .into_io_error()
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "filesystem loop detected"));
    SyncError::fs(path, source)
}

/// Read every entry to the end, checking structure and CRC.
pub fn verify(zip_path: &Path) -> Result<ArchiveStats> {
    let corrupt = |e: &dyn std::fmt::Display| {
        SyncError::CorruptArchive(format!("{}: {}", zip_path.display(), e))
    };

    let file = File::open(zip_path).map_err(|e| SyncError::fs(zip_path, e))?;
    let mut archive = ZipArchive::new(BufReader::new(file)).map_err(|e| corrupt(&e))?;
    let mut stats = ArchiveStats::default();

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(|e| corrupt(&e))?;
        let name = entry.name().to_string();
        stats.bytes += io::copy(&mut entry, &mut io::sink())
            .map_err(|e| corrupt(&format!("entry '{}': {}", name, e)))?;
        stats.entries += 1;
    }

    Ok(stats)
}

/// Extract `zip_path` into `dest`, preserving relative paths.
///
/// Entries that would land outside `dest` are skipped, as is a root entry
/// named `skip_name` (the downloaded archive itself).
pub fn extract(zip_path: &Path, dest: &Path, skip_name: Option<&str>) -> Result<ArchiveStats> {
    std::fs::create_dir_all(dest).map_err(|e| SyncError::fs(dest, e))?;

    let file = File::open(zip_path).map_err(|e| SyncError::fs(zip_path, e))?;
    let mut archive = ZipArchive::new(BufReader::new(file))?;
    let mut stats = ArchiveStats::default();

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let relative: PathBuf = match entry.enclosed_name() {
            Some(path) => path.to_path_buf(),
            None => {
                warn!("Skipping archive entry outside destination: {}", entry.name());
                continue;
            }
        };

        if relative.as_os_str().is_empty() {
            continue;
        }
        if skip_name.is_some_and(|skip| relative == Path::new(skip)) {
            warn!("Skipping archive entry that would overwrite the archive: {}", entry.name());
            continue;
        }

        let out_path = dest.join(&relative);
        if entry.is_dir() {
            std::fs::create_dir_all(&out_path).map_err(|e| SyncError::fs(&out_path, e))?;
        } else {
            if let Some(parent) = out_path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| SyncError::fs(parent, e))?;
            }
            let mut out = File::create(&out_path).map_err(|e| SyncError::fs(&out_path, e))?;
            stats.bytes += io::copy(&mut entry, &mut out).map_err(|e| SyncError::fs(&out_path, e))?;
        }
        stats.entries += 1;
    }

    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write(path: &Path, content: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_compress_skips_linked_directory() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path().join("mods");
        write(&root.join("sodium.jar"), "sodium");
        write(&temp_dir.path().join("shared").join("config.json"), "{}");
        std::os::unix::fs::symlink(temp_dir.path().join("shared"), root.join("config"))?;
        std::os::unix::fs::symlink(temp_dir.path().join("missing"), root.join("dangling"))?;

        let zip_path = temp_dir.path().join("mods.zip");
        let stats = compress_dir(&root, &zip_path, &[])?;
        assert_eq!(stats.entries, 1);

        let archive = ZipArchive::new(File::open(&zip_path)?)?;
        let names: Vec<&str> = archive.file_names().collect();
        assert_eq!(names, vec!["sodium.jar"]);
        Ok(())
    }

    #[test]
    fn test_compress_names_and_empty_dirs() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path().join("world1");
        write(&root.join("level.dat"), "level");
        write(&root.join("region").join("r.0.0.mca"), "chunk");
        std::fs::create_dir_all(root.join("empty"))?;
        let zip_path = temp_dir.path().join("world1.zip");

        let stats = compress_dir(&root, &zip_path, &[])?;
        assert_eq!(stats.entries, 4);
        assert_eq!(stats.bytes, 10);

        let mut archive = ZipArchive::new(File::open(&zip_path)?)?;
        let mut names: Vec<String> = archive.file_names().map(str::to_string).collect();
        names.sort();
        assert_eq!(names, vec!["empty/", "level.dat", "region/", "region/r.0.0.mca"]);
        assert!(archive.by_name("empty/")?.is_dir());
        Ok(())
    }

    #[test]
    fn test_exclude_matches_file_names_at_any_depth() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let root = temp_dir.path().join("mods");
        write(&root.join("a.jar"), "a");
        write(&root.join("mods.zip"), "old archive");
        write(&root.join("nested").join("mods.zip"), "older archive");
        let zip_path = temp_dir.path().join("out.zip");

        compress_dir(&root, &zip_path, &["mods.zip".to_string()])?;
        let archive = ZipArchive::new(File::open(&zip_path)?)?;
        let mut names: Vec<&str> = archive.file_names().collect();
        names.sort();
        assert_eq!(names, vec!["a.jar", "nested/"]);
        Ok(())
    }

    #[test]
    fn test_missing_root_is_filesystem_error() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let result = compress_dir(
            &temp_dir.path().join("missing"),
            &temp_dir.path().join("x.zip"),
            &[],
        );
        assert!(matches!(result, Err(SyncError::Filesystem { .. })));
        Ok(())
    }

    #[test]
    fn test_verify_rejects_garbage() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let zip_path = temp_dir.path().join("bad.zip");
        std::fs::write(&zip_path, b"definitely not a zip file")?;
        assert!(matches!(verify(&zip_path), Err(SyncError::CorruptArchive(_))));
        Ok(())
    }

    #[test]
    fn test_verify_detects_crc_mismatch() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let zip_path = temp_dir.path().join("stored.zip");
        {
            let mut zip = ZipWriter::new(File::create(&zip_path)?);
            let stored = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
            zip.start_file("data.txt", stored)?;
            zip.write_all(b"MARKERMARKERMARKER")?;
            zip.finish()?;
        }
        assert_eq!(verify(&zip_path)?.entries, 1);

        // Flip payload bytes in place; the central directory still parses
        let mut bytes = std::fs::read(&zip_path)?;
        let at = bytes
            .windows(6)
            .position(|w| w == b"MARKER")
            .expect("stored payload present");
        bytes[at] = b'X';
        std::fs::write(&zip_path, &bytes)?;

        assert!(matches!(verify(&zip_path), Err(SyncError::CorruptArchive(_))));
        Ok(())
    }

    #[test]
    fn test_extract_skips_escaping_entries_and_self() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let zip_path = temp_dir.path().join("mods.zip");
        {
            let mut zip = ZipWriter::new(File::create(&zip_path)?);
            let options = SimpleFileOptions::default();
            zip.start_file("../evil.txt", options)?;
            zip.write_all(b"evil")?;
            zip.start_file("mods.zip", options)?;
            zip.write_all(b"nested archive")?;
            zip.start_file("sub/ok.txt", options)?;
            zip.write_all(b"ok")?;
            zip.finish()?;
        }

        let dest = temp_dir.path().join("dest");
        let stats = extract(&zip_path, &dest, Some("mods.zip"))?;
        assert_eq!(stats.entries, 1);
        assert_eq!(std::fs::read_to_string(dest.join("sub").join("ok.txt"))?, "ok");
        assert!(!temp_dir.path().join("evil.txt").exists());
        assert!(!dest.join("mods.zip").exists());
        Ok(())
    }
}
