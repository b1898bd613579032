//! Error taxonomy shared by every sync operation.

use std::path::{Path, PathBuf};

/// Errors returned by the library.
///
/// Every user-triggered task catches these at its boundary and reports them
/// as a log line; none of them is fatal to the process.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Authorization or token refresh could not complete
    #[error("Authorization failed: {0}")]
    Auth(String),

    /// An expected remote file or folder is missing
    #[error("Not found: {0}")]
    NotFound(String),

    /// Zip integrity check failed
    #[error("Corrupt archive: {0}")]
    CorruptArchive(String),

    /// Operation attempted before its precondition holds
    #[error("Invalid state: {0}")]
    State(String),

    /// Local path missing or unreadable
    #[error("Filesystem error at {}: {source}", path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Drive API answered with a non-success status
    #[error("Drive API error {status}: {body}")]
    Api { status: u16, body: String },

    /// Network or HTTP transport failure
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Config error: {0}")]
    Config(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SyncError {
    /// Wrap an I/O error with the path it happened on.
    pub fn fs(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        SyncError::Filesystem {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Filesystem error for a directory that should exist but does not.
    pub fn missing_dir(path: impl AsRef<Path>) -> Self {
        Self::fs(
            path,
            std::io::Error::new(std::io::ErrorKind::NotFound, "directory does not exist"),
        )
    }

    /// Short category name used in log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::Auth(_) => "auth",
            SyncError::NotFound(_) => "not_found",
            SyncError::CorruptArchive(_) => "corrupt_archive",
            SyncError::State(_) => "state",
            SyncError::Filesystem { .. } => "filesystem",
            SyncError::Api { .. } | SyncError::Transport(_) => "transport",
            SyncError::Zip(_) => "zip",
            SyncError::Config(_) => "config",
            SyncError::Json(_) => "json",
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filesystem_error_mentions_path() {
        let err = SyncError::missing_dir("/games/mc/mods");
        let text = err.to_string();
        assert!(text.contains("/games/mc/mods"));
        assert_eq!(err.kind(), "filesystem");
    }
}
