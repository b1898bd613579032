//! Sync module - Google Drive access for the archive workflow.
//!
//! Contents:
//! - OAuth installed-app flow and the on-disk credential cache
//! - `DriveApi` seam with the Google and in-memory backends
//! - `DriveBinder`, which resolves the dedicated sync folder

pub mod binder;
pub mod callback;
pub mod drive;
pub mod google_drive;
pub mod memory;
pub mod oauth;

pub use binder::{DriveBinder, DriveConnector, GoogleConnector, SyncFolder, SYNC_FOLDER_NAME};
pub use drive::{DriveApi, DriveFile, FileQuery};
pub use google_drive::GoogleDriveClient;
pub use memory::{MemoryDrive, OfflineAuthorizer};
pub use oauth::{
    Authorizer, Credential, CredentialStore, InstalledAppFlow, SessionCredential, TokenState,
};
