//! mcdrive-sync - Keep Minecraft saves and mods in a Google Drive folder.
//!
//! Library layout:
//! - `sync`: OAuth, the `DriveApi` seam and the folder binder
//! - `archive` / `transport`: zip codec and upload/download of directory trees
//! - `compare`: remote archive metadata next to local directory state
//! - `controller`: gated background tasks for a front-end
//! - `logging`: log bus feeding independent sinks

pub mod archive;
pub mod compare;
pub mod config;
pub mod controller;
pub mod error;
pub mod layout;
pub mod logging;
pub mod sync;
pub mod transport;
pub mod utils;

pub use config::{AppConfig, AppPaths};
pub use controller::{Action, BindState, Completion, SyncController, TaskHandle, TaskOutcome};
pub use error::{Result, SyncError};
pub use layout::{GameLayout, SyncUnit};
