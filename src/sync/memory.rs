//! In-memory Drive - `DriveApi` kept in process memory.
//!
//! Used for `--offline` runs and by the test suite. Files keep insertion
//! order, so "first match" lookups are deterministic here. A drive opened
//! with [`MemoryDrive::persistent`] mirrors every change to a directory, so
//! separate `--offline` invocations see the same files.

use super::binder::DriveConnector;
use super::drive::{DriveApi, DriveFile, FileQuery, FOLDER_MIME_TYPE, ZIP_MIME_TYPE};
use super::oauth::{Authorizer, Credential, SessionCredential};
use crate::error::{Result, SyncError};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, warn};

const INDEX_FILE: &str = "index.json";

#[derive(Serialize, Deserialize)]
struct Entry {
    file: DriveFile,
    parent: Option<String>,
    trashed: bool,
    /// Stored next to the index as `<id>.bin`
    #[serde(skip)]
    content: Vec<u8>,
}

#[derive(Default, Serialize, Deserialize)]
struct State {
    entries: Vec<Entry>,
    next_id: u64,
    #[serde(skip)]
    folders_created: usize,
    #[serde(skip)]
    uploads: usize,
}

impl State {
    fn allocate_id(&mut self) -> String {
        self.next_id += 1;
        format!("mem-{}", self.next_id)
    }

    fn push(
        &mut self,
        parent: Option<&str>,
        name: &str,
        mime_type: &str,
        content: Vec<u8>,
    ) -> DriveFile {
        let id = self.allocate_id();
        let file = DriveFile {
            id,
            name: name.to_string(),
            mime_type: mime_type.to_string(),
            modified_time: Some(now_rfc3339()),
            size: (mime_type != FOLDER_MIME_TYPE).then_some(content.len() as u64),
        };
        self.entries.push(Entry {
            file: file.clone(),
            parent: parent.map(str::to_string),
            trashed: false,
            content,
        });
        file
    }
}

/// Drive held in memory.
#[derive(Default)]
pub struct MemoryDrive {
    state: Mutex<State>,
    mirror: Option<PathBuf>,
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn blob_path(dir: &Path, id: &str) -> PathBuf {
    dir.join(format!("{}.bin", id))
}

impl MemoryDrive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Drive mirrored to `dir`, loading whatever an earlier run left there.
    pub fn persistent(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let index = dir.join(INDEX_FILE);
        let mut state = State::default();

        if index.exists() {
            let bytes = fs::read(&index).map_err(|e| SyncError::fs(&index, e))?;
            state = serde_json::from_slice(&bytes)?;
            for entry in &mut state.entries {
                let blob = blob_path(&dir, &entry.file.id);
                if blob.exists() {
                    entry.content = fs::read(&blob).map_err(|e| SyncError::fs(&blob, e))?;
                }
            }
            debug!(
                "Loaded {} offline Drive entries from {}",
                state.entries.len(),
                dir.display()
            );
        }

        Ok(Self {
            state: Mutex::new(state),
            mirror: Some(dir),
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // A panic while holding the lock leaves consistent data behind
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Write the index, and the content of `changed`, to the mirror directory.
    fn persist(&self, state: &State, changed: Option<&str>) -> Result<()> {
        let Some(dir) = &self.mirror else {
            return Ok(());
        };
        fs::create_dir_all(dir).map_err(|e| SyncError::fs(dir, e))?;

        let entry = changed.and_then(|id| state.entries.iter().find(|e| e.file.id == id));
        if let Some(entry) = entry {
            let blob = blob_path(dir, &entry.file.id);
            fs::write(&blob, &entry.content).map_err(|e| SyncError::fs(&blob, e))?;
        }

        let index = dir.join(INDEX_FILE);
        fs::write(&index, serde_json::to_vec_pretty(state)?)
            .map_err(|e| SyncError::fs(&index, e))?;
        Ok(())
    }

    fn persist_or_warn(&self, state: &State, changed: Option<&str>) {
        if let Err(e) = self.persist(state, changed) {
            warn!("Offline Drive not saved: {}", e);
        }
    }

    /// Store a file directly, bypassing the upload path.
    pub fn insert(
        &self,
        parent: Option<&str>,
        name: &str,
        mime_type: &str,
        content: Vec<u8>,
    ) -> DriveFile {
        let mut state = self.lock();
        let file = state.push(parent, name, mime_type, content);
        self.persist_or_warn(&state, Some(&file.id));
        file
    }

    /// Override the modified time of a file.
    pub fn set_modified_time(&self, id: &str, modified_time: &str) -> Result<()> {
        let mut state = self.lock();
        let entry = state
            .entries
            .iter_mut()
            .find(|e| e.file.id == id)
            .ok_or_else(|| SyncError::NotFound(format!("file {}", id)))?;
        entry.file.modified_time = Some(modified_time.to_string());
        self.persist(&state, None)
    }

    pub fn trash(&self, id: &str) {
        let mut state = self.lock();
        let found = state
            .entries
            .iter_mut()
            .find(|e| e.file.id == id)
            .map(|entry| entry.trashed = true)
            .is_some();
        if found {
            self.persist_or_warn(&state, None);
        }
    }

    pub fn content(&self, id: &str) -> Option<Vec<u8>> {
        self.lock()
            .entries
            .iter()
            .find(|e| e.file.id == id)
            .map(|e| e.content.clone())
    }

    /// Non-trashed files named `name` directly under `parent` (`None` = root).
    pub fn count_named(&self, parent: Option<&str>, name: &str) -> usize {
        self.lock()
            .entries
            .iter()
            .filter(|e| !e.trashed && e.file.name == name && e.parent.as_deref() == parent)
            .count()
    }

    /// Folders created through `DriveApi` by this instance
    pub fn folders_created(&self) -> usize {
        self.lock().folders_created
    }

    /// Number of create/update content uploads by this instance
    pub fn uploads(&self) -> usize {
        self.lock().uploads
    }
}

impl DriveApi for MemoryDrive {
    fn list(&self, query: &FileQuery) -> Result<Vec<DriveFile>> {
        Ok(self
            .lock()
            .entries
            .iter()
            .filter(|e| !e.trashed && query.matches(&e.file, e.parent.as_deref()))
            .map(|e| e.file.clone())
            .collect())
    }

    fn create_folder(&self, name: &str) -> Result<DriveFile> {
        let mut state = self.lock();
        let folder = state.push(None, name, FOLDER_MIME_TYPE, Vec::new());
        state.folders_created += 1;
        self.persist(&state, None)?;
        Ok(folder)
    }

    fn create_file(&self, parent: &str, name: &str, content_path: &Path) -> Result<DriveFile> {
        let content = fs::read(content_path).map_err(|e| SyncError::fs(content_path, e))?;
        let mut state = self.lock();
        let file = state.push(Some(parent), name, ZIP_MIME_TYPE, content);
        state.uploads += 1;
        self.persist(&state, Some(&file.id))?;
        Ok(file)
    }

    fn update_file(&self, id: &str, content_path: &Path) -> Result<DriveFile> {
        let content = fs::read(content_path).map_err(|e| SyncError::fs(content_path, e))?;
        let mut state = self.lock();
        state.uploads += 1;
        let entry = state
            .entries
            .iter_mut()
            .find(|e| e.file.id == id && !e.trashed)
            .ok_or_else(|| SyncError::NotFound(format!("file {}", id)))?;
        entry.file.size = Some(content.len() as u64);
        entry.file.modified_time = Some(now_rfc3339());
        entry.content = content;
        let file = entry.file.clone();
        self.persist(&state, Some(id))?;
        Ok(file)
    }

    fn download(&self, id: &str, dest: &mut dyn Write) -> Result<u64> {
        let content = self
            .content(id)
            .ok_or_else(|| SyncError::NotFound(format!("file {}", id)))?;
        dest.write_all(&content)
            .map_err(|e| SyncError::fs("<download target>", e))?;
        Ok(content.len() as u64)
    }
}

impl DriveConnector for Arc<MemoryDrive> {
    fn connect(&self, session: &Arc<SessionCredential>) -> Result<Arc<dyn DriveApi>> {
        session.access_token()?;
        Ok(self.clone())
    }
}

/// Authorizer issuing non-expiring local credentials; pairs with [`MemoryDrive`].
#[derive(Debug, Default)]
pub struct OfflineAuthorizer;

impl Authorizer for OfflineAuthorizer {
    fn authorize(&self) -> Result<Credential> {
        Ok(Credential {
            access_token: format!("offline-{}", uuid::Uuid::new_v4()),
            refresh_token: None,
            token_type: "Bearer".to_string(),
            scope: "offline".to_string(),
            expires_at: None,
        })
    }

    fn refresh(&self, credential: &Credential) -> Result<Credential> {
        Ok(credential.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_filters_trashed_and_parent() {
        let drive = MemoryDrive::new();
        let folder = drive.create_folder("MC_GoogleDriveSync").unwrap();
        let kept = drive.insert(Some(&folder.id), "mods.zip", ZIP_MIME_TYPE, vec![1, 2, 3]);
        let gone = drive.insert(Some(&folder.id), "old.zip", ZIP_MIME_TYPE, vec![]);
        drive.insert(None, "mods.zip", ZIP_MIME_TYPE, vec![]);
        drive.trash(&gone.id);

        let children = drive.list(&FileQuery::children_of(&folder.id)).unwrap();
        assert_eq!(children, vec![kept.clone()]);
        assert_eq!(kept.size, Some(3));
        assert_eq!(drive.count_named(Some(&folder.id), "mods.zip"), 1);
        assert_eq!(drive.folders_created(), 1);
    }

    #[test]
    fn test_update_keeps_id() -> anyhow::Result<()> {
        let temp_dir = tempfile::TempDir::new()?;
        let path = temp_dir.path().join("a.zip");
        std::fs::write(&path, b"first")?;

        let drive = MemoryDrive::new();
        let created = drive.create_file("parent", "a.zip", &path)?;
        std::fs::write(&path, b"second!")?;
        let updated = drive.update_file(&created.id, &path)?;

        assert_eq!(updated.id, created.id);
        assert_eq!(updated.size, Some(7));
        let mut out = Vec::new();
        drive.download(&created.id, &mut out)?;
        assert_eq!(out, b"second!");
        assert_eq!(drive.uploads(), 2);
        Ok(())
    }

    #[test]
    fn test_persistent_drive_survives_reopen() -> anyhow::Result<()> {
        let temp_dir = tempfile::TempDir::new()?;
        let mirror = temp_dir.path().join("offline-drive");
        let archive = temp_dir.path().join("mods.zip");
        std::fs::write(&archive, b"zipped mods")?;

        let (folder, file) = {
            let drive = MemoryDrive::persistent(&mirror)?;
            let folder = drive.create_folder("MC_GoogleDriveSync")?;
            let file = drive.create_file(&folder.id, "mods.zip", &archive)?;
            let trashed = drive.create_file(&folder.id, "old.zip", &archive)?;
            drive.trash(&trashed.id);
            (folder, file)
        };

        let reopened = MemoryDrive::persistent(&mirror)?;
        let children = reopened.list(&FileQuery::children_of(&folder.id))?;
        assert_eq!(children, vec![file.clone()]);
        assert_eq!(reopened.content(&file.id).as_deref(), Some(&b"zipped mods"[..]));

        // New ids never collide with the ones already on disk
        let next = reopened.create_folder("other")?;
        assert_eq!(next.id, "mem-4");
        Ok(())
    }
}
