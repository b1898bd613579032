//! Drive binder - Ties a cached credential to the dedicated sync folder.

use super::drive::{DriveApi, DriveFile, FileQuery};
use super::google_drive::GoogleDriveClient;
use super::oauth::{
    Authorizer, Credential, CredentialStore, RefreshOutcome, SessionCredential, TokenState,
};
use crate::error::{Result, SyncError};
use chrono::Utc;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Name of the Drive folder holding every archive
pub const SYNC_FOLDER_NAME: &str = "MC_GoogleDriveSync";

/// Builds an API client on top of a session credential.
pub trait DriveConnector: Send + Sync {
    fn connect(&self, session: &Arc<SessionCredential>) -> Result<Arc<dyn DriveApi>>;
}

/// Connects to the real Google Drive.
#[derive(Debug, Default)]
pub struct GoogleConnector;

impl DriveConnector for GoogleConnector {
    fn connect(&self, session: &Arc<SessionCredential>) -> Result<Arc<dyn DriveApi>> {
        Ok(Arc::new(GoogleDriveClient::new(session.clone())?))
    }
}

/// Handle to the resolved sync folder. Cheap to clone into worker threads.
#[derive(Clone)]
pub struct SyncFolder {
    api: Arc<dyn DriveApi>,
    folder_id: String,
}

impl fmt::Debug for SyncFolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncFolder")
            .field("folder_id", &self.folder_id)
            .finish_non_exhaustive()
    }
}

impl SyncFolder {
    pub fn new(api: Arc<dyn DriveApi>, folder_id: impl Into<String>) -> Self {
        Self {
            api,
            folder_id: folder_id.into(),
        }
    }

    pub fn id(&self) -> &str {
        &self.folder_id
    }

    pub fn api(&self) -> &dyn DriveApi {
        self.api.as_ref()
    }

    /// First non-trashed child with exactly this name.
    pub fn find_file(&self, name: &str) -> Result<Option<DriveFile>> {
        let mut matches = self
            .api
            .list(&FileQuery::child_named(&self.folder_id, name))?;
        if matches.len() > 1 {
            debug!("{} files named '{}', using the first", matches.len(), name);
        }
        Ok(if matches.is_empty() {
            None
        } else {
            Some(matches.swap_remove(0))
        })
    }

    /// Every non-trashed child of the folder.
    pub fn list_files(&self) -> Result<Vec<DriveFile>> {
        self.api.list(&FileQuery::children_of(&self.folder_id))
    }
}

/// Owns the credential lifecycle and the session's sync folder.
pub struct DriveBinder {
    store: CredentialStore,
    authorizer: Arc<dyn Authorizer>,
    connector: Box<dyn DriveConnector>,
    folder_name: String,
    session: Option<SyncFolder>,
}

impl DriveBinder {
    pub fn new(
        store: CredentialStore,
        authorizer: Box<dyn Authorizer>,
        connector: Box<dyn DriveConnector>,
    ) -> Self {
        Self {
            store,
            authorizer: Arc::from(authorizer),
            connector,
            folder_name: SYNC_FOLDER_NAME.to_string(),
            session: None,
        }
    }

    pub fn with_folder_name(mut self, name: impl Into<String>) -> Self {
        self.folder_name = name.into();
        self
    }

    pub fn store(&self) -> &CredentialStore {
        &self.store
    }

    pub fn has_cached_credential(&self) -> bool {
        self.store.exists()
    }

    pub fn is_bound(&self) -> bool {
        self.session.is_some()
    }

    pub fn folder_id(&self) -> Option<&str> {
        self.session.as_ref().map(SyncFolder::id)
    }

    /// Handle to the bound folder, or `State` if not bound yet.
    pub fn folder(&self) -> Result<SyncFolder> {
        self.session
            .clone()
            .ok_or_else(|| SyncError::State("Google Drive is not bound yet".to_string()))
    }

    /// Obtain a valid credential, connect and resolve the sync folder.
    pub fn bind(&mut self) -> Result<SyncFolder> {
        self.session = None;

        let credential = self.obtain_credential()?;
        let session = Arc::new(SessionCredential::new(
            credential,
            self.store.clone(),
            self.authorizer.clone(),
        ));
        let api = self.connector.connect(&session)?;
        let folder_id = self.resolve_folder(api.as_ref())?;

        info!("Bound to Drive folder '{}' ({})", self.folder_name, folder_id);
        let folder = SyncFolder::new(api, folder_id);
        self.session = Some(folder.clone());
        Ok(folder)
    }

    /// Forget the cached credential and bind again from scratch.
    pub fn rebind(&mut self) -> Result<SyncFolder> {
        info!("Rebinding Google Drive account");
        self.store.delete()?;
        self.session = None;
        self.bind()
    }

    /// Every file in the bound folder.
    pub fn list_files(&self) -> Result<Vec<DriveFile>> {
        self.folder()?.list_files()
    }

    fn obtain_credential(&self) -> Result<Credential> {
        let cached = self.store.load()?;
        let credential = match TokenState::classify(cached, Utc::now()) {
            TokenState::Valid(credential) => {
                debug!("Using cached credential");
                return Ok(credential);
            }
            TokenState::Refreshable(stale) => match self.authorizer.try_refresh(&stale) {
                RefreshOutcome::Refreshed(credential) => credential,
                RefreshOutcome::NeedsReauth(reason) => {
                    warn!("Token refresh failed ({}), authorizing again", reason);
                    self.store.delete()?;
                    self.authorizer.authorize()?
                }
            },
            TokenState::NeedsReauth => {
                info!("Cached credential expired without refresh token");
                self.store.delete()?;
                self.authorizer.authorize()?
            }
            TokenState::Missing => {
                info!("No cached credential, starting authorization");
                self.authorizer.authorize()?
            }
        };

        self.store.save(&credential)?;
        Ok(credential)
    }

    fn resolve_folder(&self, api: &dyn DriveApi) -> Result<String> {
        let existing = api.list(&FileQuery::folder_named(&self.folder_name))?;
        if let Some(folder) = existing.first() {
            if existing.len() > 1 {
                debug!(
                    "{} folders named '{}', using the first",
                    existing.len(),
                    self.folder_name
                );
            }
            return Ok(folder.id.clone());
        }

        info!("Creating Drive folder '{}'", self.folder_name);
        Ok(api.create_folder(&self.folder_name)?.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::memory::{MemoryDrive, OfflineAuthorizer};
    use tempfile::TempDir;

    fn binder(temp_dir: &TempDir, drive: &Arc<MemoryDrive>) -> DriveBinder {
        DriveBinder::new(
            CredentialStore::new(temp_dir.path().join("token.json")),
            Box::new(OfflineAuthorizer),
            Box::new(drive.clone()),
        )
    }

    #[test]
    fn test_bind_creates_folder_once() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let drive = MemoryDrive::shared();
        let mut binder = binder(&temp_dir, &drive);

        assert!(matches!(binder.list_files(), Err(SyncError::State(_))));

        let first = binder.bind()?;
        let second = binder.bind()?;
        assert_eq!(first.id(), second.id());
        assert_eq!(drive.folders_created(), 1);
        assert_eq!(drive.count_named(None, SYNC_FOLDER_NAME), 1);
        assert!(binder.store().exists());
        Ok(())
    }

    #[test]
    fn test_duplicate_folders_resolve_to_first() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let drive = MemoryDrive::shared();
        let first = drive.create_folder(SYNC_FOLDER_NAME)?;
        drive.create_folder(SYNC_FOLDER_NAME)?;

        let mut binder = binder(&temp_dir, &drive);
        assert_eq!(binder.bind()?.id(), first.id);
        assert_eq!(binder.folder_id(), Some(first.id.as_str()));
        Ok(())
    }

    #[test]
    fn test_find_file_is_exact() -> anyhow::Result<()> {
        let temp_dir = TempDir::new()?;
        let drive = MemoryDrive::shared();
        let folder = binder(&temp_dir, &drive).bind()?;
        drive.insert(Some(folder.id()), "World1.zip", "application/zip", vec![]);

        assert!(folder.find_file("world1.zip")?.is_none());
        let found = folder.find_file("World1.zip")?.map(|f| f.name);
        assert_eq!(found.as_deref(), Some("World1.zip"));
        Ok(())
    }
}
