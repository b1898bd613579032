//! DriveApi trait - Abstraction over the vendor file-storage API.
//!
//! Only the four operations the sync workflow needs are exposed: list,
//! create, update content and download content.

use crate::error::Result;
use serde::{Deserialize, Deserializer, Serialize};
use std::io::Write;
use std::path::Path;

/// Mime type of Drive folders
pub const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";

/// Prefix of native Google documents (Docs, Sheets, ...), which have no raw bytes
pub const NATIVE_MIME_PREFIX: &str = "application/vnd.google-apps";

/// Mime type used for uploaded archives
pub const ZIP_MIME_TYPE: &str = "application/zip";

/// Google Drive file metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub mime_type: String,
    /// RFC 3339 timestamp, e.g. `2024-01-01T00:00:00.000Z`
    #[serde(default)]
    pub modified_time: Option<String>,
    /// Drive reports sizes as decimal strings
    #[serde(default, deserialize_with = "size_from_string")]
    pub size: Option<u64>,
}

impl DriveFile {
    pub fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME_TYPE
    }

    /// Native documents cannot be downloaded as raw bytes.
    pub fn is_native_document(&self) -> bool {
        self.mime_type.starts_with(NATIVE_MIME_PREFIX)
    }
}

fn size_from_string<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawSize {
        Text(String),
        Number(u64),
    }

    match Option::<RawSize>::deserialize(deserializer)? {
        None => Ok(None),
        Some(RawSize::Number(n)) => Ok(Some(n)),
        Some(RawSize::Text(s)) => s.parse().map(Some).map_err(serde::de::Error::custom),
    }
}

/// Structured `files.list` filter. Trashed files are always excluded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileQuery {
    pub name: Option<String>,
    pub parent: Option<String>,
    pub mime_type: Option<String>,
}

impl FileQuery {
    /// Folders with an exact name, anywhere in the drive.
    pub fn folder_named(name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            parent: None,
            mime_type: Some(FOLDER_MIME_TYPE.to_string()),
        }
    }

    /// Every direct child of `parent`.
    pub fn children_of(parent: &str) -> Self {
        Self {
            name: None,
            parent: Some(parent.to_string()),
            mime_type: None,
        }
    }

    /// Direct child of `parent` with an exact (case-sensitive) name.
    pub fn child_named(parent: &str, name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            ..Self::children_of(parent)
        }
    }

    /// Render as a Drive query string.
    pub fn to_drive_query(&self) -> String {
        let mut clauses = Vec::new();
        if let Some(name) = &self.name {
            clauses.push(format!("name = '{}'", escape_query_value(name)));
        }
        if let Some(parent) = &self.parent {
            clauses.push(format!("'{}' in parents", escape_query_value(parent)));
        }
        if let Some(mime_type) = &self.mime_type {
            clauses.push(format!("mimeType = '{}'", escape_query_value(mime_type)));
        }
        clauses.push("trashed = false".to_string());
        clauses.join(" and ")
    }

    /// Evaluate the filter locally against a file and its parent id.
    pub fn matches(&self, file: &DriveFile, parent: Option<&str>) -> bool {
        self.name.as_deref().map_or(true, |n| n == file.name)
            && self.mime_type.as_deref().map_or(true, |m| m == file.mime_type)
            && self
                .parent
                .as_deref()
                .map_or(true, |p| parent == Some(p))
    }
}

fn escape_query_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

/// The vendor file-storage API.
pub trait DriveApi: Send + Sync {
    /// List non-trashed files matching `query`, in the order the API returns them.
    fn list(&self, query: &FileQuery) -> Result<Vec<DriveFile>>;

    /// Create a folder at the drive root.
    fn create_folder(&self, name: &str) -> Result<DriveFile>;

    /// Create a file under `parent` with the content of `content_path`.
    fn create_file(&self, parent: &str, name: &str, content_path: &Path) -> Result<DriveFile>;

    /// Replace the content of an existing file, keeping its id.
    fn update_file(&self, id: &str, content_path: &Path) -> Result<DriveFile>;

    /// Stream the raw content of a file into `dest`. Returns the byte count.
    fn download(&self, id: &str, dest: &mut dyn Write) -> Result<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_folder_query() {
        let query = FileQuery::folder_named("MC_GoogleDriveSync");
        assert_eq!(
            query.to_drive_query(),
            "name = 'MC_GoogleDriveSync' and mimeType = 'application/vnd.google-apps.folder' and trashed = false"
        );
    }

    #[test]
    fn test_query_escapes_quotes() {
        let query = FileQuery::child_named("abc", "Steve's world.zip");
        assert_eq!(
            query.to_drive_query(),
            r"name = 'Steve\'s world.zip' and 'abc' in parents and trashed = false"
        );
    }

    #[test]
    fn test_local_matching() {
        let file = DriveFile {
            id: "1".into(),
            name: "mods.zip".into(),
            mime_type: ZIP_MIME_TYPE.into(),
            modified_time: None,
            size: None,
        };
        assert!(FileQuery::child_named("root", "mods.zip").matches(&file, Some("root")));
        assert!(!FileQuery::child_named("root", "Mods.zip").matches(&file, Some("root")));
        assert!(!FileQuery::children_of("other").matches(&file, Some("root")));
        assert!(!FileQuery::folder_named("mods.zip").matches(&file, None));
    }

    #[test]
    fn test_size_parses_from_string() -> anyhow::Result<()> {
        let file: DriveFile = serde_json::from_str(
            r#"{"id":"x","name":"world1.zip","mimeType":"application/zip","modifiedTime":"2024-01-01T00:00:00.000Z","size":"2048"}"#,
        )?;
        assert_eq!(file.size, Some(2048));
        assert!(!file.is_native_document());

        let doc: DriveFile = serde_json::from_str(
            r#"{"id":"y","name":"notes","mimeType":"application/vnd.google-apps.document"}"#,
        )?;
        assert_eq!(doc.size, None);
        assert!(doc.is_native_document());
        Ok(())
    }
}
