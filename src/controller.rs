//! Sync controller - Gates user actions and runs them as background tasks.
//!
//! Each dispatched action runs on its own thread and reports back exactly
//! one [`Completion`] over a channel. The caller drains completions with
//! [`SyncController::pump`] or blocks on one with [`SyncController::wait`];
//! display state is only ever updated on the caller's thread.

use crate::compare::{self, VersionReport};
use crate::config::AppConfig;
use crate::error::{Result, SyncError};
use crate::layout::SyncUnit;
use crate::sync::{DriveBinder, DriveFile, SyncFolder};
use crate::transport::{self, DownloadOutcome, UploadReport};
use std::collections::HashSet;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use tracing::{error, info, warn};

/// Binding lifecycle as seen by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindState {
    Unbound,
    Binding,
    Rebinding,
    Bound,
}

impl BindState {
    fn in_flight(self) -> bool {
        matches!(self, BindState::Binding | BindState::Rebinding)
    }
}

/// A user-triggered action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Bind,
    Rebind,
    /// List the sync folder to prove the binding works
    TestBind,
    Upload(SyncUnit),
    Download(SyncUnit),
    Compare,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Bind => f.write_str("bind"),
            Action::Rebind => f.write_str("rebind"),
            Action::TestBind => f.write_str("test binding"),
            Action::Upload(unit) => write!(f, "upload {}", unit),
            Action::Download(unit) => write!(f, "download {}", unit),
            Action::Compare => f.write_str("compare"),
        }
    }
}

/// Identifies one dispatched task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle(u64);

impl TaskHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

#[derive(Debug)]
pub enum TaskOutcome {
    Bound(SyncFolder),
    Listed(Vec<DriveFile>),
    Uploaded(UploadReport),
    Downloaded(DownloadOutcome),
    Compared(VersionReport),
    Failed(SyncError),
}

/// The single message a task sends when it finishes.
#[derive(Debug)]
pub struct Completion {
    pub task: TaskHandle,
    pub action: Action,
    pub outcome: TaskOutcome,
}

impl Completion {
    pub fn is_success(&self) -> bool {
        !matches!(self.outcome, TaskOutcome::Failed(_))
    }

    /// One-line, user-facing description.
    pub fn summary(&self) -> String {
        match &self.outcome {
            TaskOutcome::Bound(folder) => format!("Bound to sync folder {}", folder.id()),
            TaskOutcome::Listed(files) => {
                format!("Binding OK, {} file(s) in the sync folder", files.len())
            }
            TaskOutcome::Uploaded(report) => format!(
                "{} '{}' ({} entries, {} bytes)",
                if report.replaced { "Replaced" } else { "Uploaded" },
                report.archive_name,
                report.entries,
                report.bytes
            ),
            TaskOutcome::Downloaded(DownloadOutcome::Extracted { entries, .. }) => {
                format!("{} finished, {} entries extracted", self.action, entries)
            }
            TaskOutcome::Downloaded(DownloadOutcome::NativeDocument { mime_type }) => {
                format!("{} skipped, remote file is a {} document", self.action, mime_type)
            }
            TaskOutcome::Compared(report) => format!(
                "Compared: saves {}, mods {}",
                report.saves.freshness, report.mods.freshness
            ),
            TaskOutcome::Failed(e) => format!("{} failed: {}", self.action, e),
        }
    }
}

/// What a front-end shows.
#[derive(Debug, Default)]
pub struct DisplayState {
    pub files: Option<Vec<DriveFile>>,
    pub versions: Option<VersionReport>,
    pub last_message: Option<String>,
}

type Job = Box<dyn FnOnce() -> Result<TaskOutcome> + Send + 'static>;

pub struct SyncController {
    binder: Arc<Mutex<DriveBinder>>,
    config: AppConfig,
    config_path: PathBuf,
    state: BindState,
    folder: Option<SyncFolder>,
    next_task: u64,
    in_flight: HashSet<TaskHandle>,
    /// Completions received by `wait` for other tasks, returned by the next `pump`
    backlog: Vec<Completion>,
    compare_after: Option<TaskHandle>,
    tx: Sender<Completion>,
    rx: Receiver<Completion>,
    display: DisplayState,
}

impl SyncController {
    pub fn new(binder: DriveBinder, config: AppConfig, config_path: impl Into<PathBuf>) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            binder: Arc::new(Mutex::new(binder)),
            config,
            config_path: config_path.into(),
            state: BindState::Unbound,
            folder: None,
            next_task: 0,
            in_flight: HashSet::new(),
            backlog: Vec::new(),
            compare_after: None,
            tx,
            rx,
            display: DisplayState::default(),
        }
    }

    pub fn state(&self) -> BindState {
        self.state
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn display(&self) -> &DisplayState {
        &self.display
    }

    pub fn pending(&self) -> usize {
        self.in_flight.len()
    }

    /// Persist new settings. Gating follows the new values immediately.
    pub fn save_config(&mut self, save_path: &str, save_folder: &str) -> Result<()> {
        let config = AppConfig::new(save_path.trim(), save_folder.trim());
        config.save(&self.config_path)?;
        self.config = config;
        Ok(())
    }

    /// Whether `action` may start now.
    pub fn check(&self, action: Action) -> Result<()> {
        let reject = |reason: &str| -> Result<()> {
            Err(SyncError::State(format!("Cannot {}: {}", action, reason)))
        };

        match action {
            Action::Bind => match self.state {
                BindState::Unbound => Ok(()),
                BindState::Bound => reject("already bound, use rebind"),
                _ => reject("a bind is already in progress"),
            },
            Action::Rebind if self.state.in_flight() => reject("a bind is already in progress"),
            Action::Rebind => Ok(()),
            Action::TestBind if self.state != BindState::Bound => {
                reject("Google Drive is not bound")
            }
            Action::TestBind => Ok(()),
            Action::Upload(_) | Action::Download(_) | Action::Compare => {
                if !self.config.is_complete() {
                    reject("save path and save folder must be configured")
                } else if self.state != BindState::Bound {
                    reject("Google Drive is not bound")
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Start `action` on a worker thread.
    pub fn dispatch(&mut self, action: Action) -> Result<TaskHandle> {
        self.check(action)?;
        let job = self.job_for(action)?;

        self.next_task += 1;
        let task = TaskHandle(self.next_task);
        match action {
            Action::Bind => self.state = BindState::Binding,
            Action::Rebind => {
                self.state = BindState::Rebinding;
                self.folder = None;
            }
            _ => {}
        }

        info!("Starting {}", action);
        let tx = self.tx.clone();
        thread::spawn(move || {
            let outcome = match panic::catch_unwind(AssertUnwindSafe(job)) {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(e)) => {
                    error!("{} failed ({}): {}", action, e.kind(), e);
                    TaskOutcome::Failed(e)
                }
                Err(_) => {
                    error!("{} panicked", action);
                    TaskOutcome::Failed(SyncError::State(format!("{} task panicked", action)))
                }
            };
            // The receiver lives as long as the controller
            let _ = tx.send(Completion {
                task,
                action,
                outcome,
            });
        });

        self.in_flight.insert(task);
        Ok(task)
    }

    fn job_for(&self, action: Action) -> Result<Job> {
        let binder = Arc::clone(&self.binder);
        match action {
            Action::Bind => Ok(Box::new(move || {
                let mut binder = binder.lock().unwrap_or_else(|p| p.into_inner());
                binder.bind().map(TaskOutcome::Bound)
            })),
            Action::Rebind => Ok(Box::new(move || {
                let mut binder = binder.lock().unwrap_or_else(|p| p.into_inner());
                binder.rebind().map(TaskOutcome::Bound)
            })),
            Action::TestBind => {
                let folder = self.bound_folder()?;
                Ok(Box::new(move || folder.list_files().map(TaskOutcome::Listed)))
            }
            Action::Upload(unit) => {
                let folder = self.bound_folder()?;
                let layout = self.config.layout()?;
                Ok(Box::new(move || {
                    transport::upload_directory(
                        &folder,
                        &layout.local_dir(unit),
                        &layout.archive_name(unit),
                        &layout.excludes(unit),
                    )
                    .map(TaskOutcome::Uploaded)
                }))
            }
            Action::Download(unit) => {
                let folder = self.bound_folder()?;
                let layout = self.config.layout()?;
                Ok(Box::new(move || {
                    transport::download_archive(
                        &folder,
                        &layout.archive_name(unit),
                        &layout.extract_dir(unit),
                    )
                    .map(TaskOutcome::Downloaded)
                }))
            }
            Action::Compare => {
                let folder = self.bound_folder()?;
                let layout = self.config.layout()?;
                Ok(Box::new(move || {
                    compare::compare_all(&folder, &layout).map(TaskOutcome::Compared)
                }))
            }
        }
    }

    fn bound_folder(&self) -> Result<SyncFolder> {
        self.folder
            .clone()
            .ok_or_else(|| SyncError::State("Google Drive is not bound".to_string()))
    }

    /// Startup binding: only when a cached credential exists, followed by a
    /// comparison when the configuration is complete.
    pub fn auto_bind(&mut self) -> Option<TaskHandle> {
        let task = self.bind_cached()?;
        self.compare_after = Some(task);
        Some(task)
    }

    /// Bind with the cached credential only, never starting a consent flow
    /// and never queueing a follow-up.
    pub fn bind_cached(&mut self) -> Option<TaskHandle> {
        let has_token = self
            .binder
            .lock()
            .map(|b| b.has_cached_credential())
            .unwrap_or(false);
        if !has_token {
            info!("No cached token, waiting for an explicit bind");
            return None;
        }

        match self.dispatch(Action::Bind) {
            Ok(task) => Some(task),
            Err(e) => {
                warn!("Automatic bind skipped: {}", e);
                None
            }
        }
    }

    /// Apply every completion that has arrived, without blocking.
    pub fn pump(&mut self) -> Vec<Completion> {
        let mut done = std::mem::take(&mut self.backlog);
        while let Ok(completion) = self.rx.try_recv() {
            self.apply(&completion);
            done.push(completion);
        }
        done
    }

    /// Block until `task` completes.
    pub fn wait(&mut self, task: TaskHandle) -> Result<Completion> {
        if let Some(pos) = self.backlog.iter().position(|c| c.task == task) {
            return Ok(self.backlog.remove(pos));
        }
        if !self.in_flight.contains(&task) {
            return Err(SyncError::State(format!(
                "Task {} is unknown or already collected",
                task.id()
            )));
        }

        loop {
            let completion = self
                .rx
                .recv()
                .map_err(|_| SyncError::State("Task channel closed".to_string()))?;
            self.apply(&completion);
            if completion.task == task {
                return Ok(completion);
            }
            self.backlog.push(completion);
        }
    }

    /// Block until no task is running.
    pub fn wait_idle(&mut self) -> Vec<Completion> {
        let mut done = std::mem::take(&mut self.backlog);
        while !self.in_flight.is_empty() {
            match self.rx.recv() {
                Ok(completion) => {
                    self.apply(&completion);
                    done.push(completion);
                }
                Err(_) => break,
            }
        }
        done
    }

    fn apply(&mut self, completion: &Completion) {
        self.in_flight.remove(&completion.task);
        let follow_up = self.compare_after == Some(completion.task);
        if follow_up {
            self.compare_after = None;
        }

        match &completion.outcome {
            TaskOutcome::Bound(folder) => {
                self.state = BindState::Bound;
                self.folder = Some(folder.clone());
            }
            TaskOutcome::Listed(files) => self.display.files = Some(files.clone()),
            TaskOutcome::Compared(report) => self.display.versions = Some(report.clone()),
            TaskOutcome::Failed(_)
                if matches!(completion.action, Action::Bind | Action::Rebind) =>
            {
                self.state = BindState::Unbound;
                self.folder = None;
            }
            _ => {}
        }

        let message = completion.summary();
        if completion.is_success() {
            info!("{}", message);
        }
        self.display.last_message = Some(message);

        if follow_up && completion.is_success() && self.config.is_complete() {
            if let Err(e) = self.dispatch(Action::Compare) {
                warn!("Automatic comparison skipped: {}", e);
            }
        }
    }
}
