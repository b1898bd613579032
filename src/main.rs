//! mcdrive - Sync Minecraft saves and mods with Google Drive
//!
//! Usage:
//!   mcdrive bind                 - Authorize and bind the Drive folder
//!   mcdrive upload <saves|mods|all>
//!   mcdrive download <saves|mods|all>
//!   mcdrive compare              - Remote archive vs local directory times
//!   mcdrive interactive          - Menu driven session

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use dialoguer::theme::ColorfulTheme;
use dialoguer::{Input, Select};
use indicatif::{ProgressBar, ProgressStyle};
use mcdrive_sync::compare::{UnitComparison, VersionReport};
use mcdrive_sync::logging::{FileSink, LogBus, RecentLog};
use mcdrive_sync::sync::{
    CredentialStore, DriveBinder, DriveFile, GoogleConnector, InstalledAppFlow, MemoryDrive,
    OfflineAuthorizer, SYNC_FOLDER_NAME,
};
use mcdrive_sync::transport::DownloadOutcome;
use mcdrive_sync::{
    Action, AppConfig, AppPaths, BindState, Completion, SyncController, SyncUnit, TaskHandle,
    TaskOutcome,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Lines kept for the interactive log panel
const RECENT_LOG_LINES: usize = 200;

/// mcdrive - Keep Minecraft saves and mods in a Google Drive folder
#[derive(Parser)]
#[command(name = "mcdrive")]
#[command(about = "Sync Minecraft saves and mods with Google Drive", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Directory holding config.json, token.json and credentials.json
    #[arg(long, global = true, value_name = "DIR")]
    config_dir: Option<PathBuf>,

    /// Use a local stand-in for Google Drive, stored in the config directory (no network)
    #[arg(long, global = true)]
    offline: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show configuration and binding status
    Status,

    /// Authorize with Google and bind the sync folder
    Bind,

    /// Forget the cached token and bind again
    Rebind,

    /// List the files in the sync folder
    Test,

    /// Show or change settings
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Zip and upload local directories
    Upload {
        #[arg(value_enum)]
        target: Target,
    },

    /// Download and extract archives
    Download {
        #[arg(value_enum)]
        target: Target,
    },

    /// Compare remote archives with local directories
    Compare,

    /// Menu driven session
    Interactive,
}

#[derive(Subcommand)]
enum ConfigCommands {
    Show,
    Set {
        /// Game directory (contains saves/ and mods/)
        #[arg(long)]
        save_path: Option<String>,

        /// Save directory name under saves/
        #[arg(long)]
        save_folder: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Target {
    Saves,
    Mods,
    All,
}

impl Target {
    fn units(self) -> Vec<SyncUnit> {
        match self {
            Target::Saves => vec![SyncUnit::Saves],
            Target::Mods => vec![SyncUnit::Mods],
            Target::All => SyncUnit::ALL.to_vec(),
        }
    }
}

/// Everything a command needs.
struct App {
    paths: AppPaths,
    offline: bool,
    recent: Arc<RecentLog>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let paths = AppPaths::resolve(cli.config_dir.clone());
    let bus = LogBus::new();
    init_logging(cli.verbose, &bus)?;

    match FileSink::open(&paths.log_file()) {
        Ok(sink) => {
            bus.subscribe(Arc::new(sink));
        }
        Err(e) => tracing::warn!("Log file disabled: {}", e),
    }
    let recent = Arc::new(RecentLog::new(RECENT_LOG_LINES));
    bus.subscribe(recent.clone());

    let app = App {
        paths,
        offline: cli.offline,
        recent,
    };

    match cli.command {
        Commands::Status => cmd_status(&app),
        Commands::Bind => cmd_bind(&app, Action::Bind),
        Commands::Rebind => cmd_bind(&app, Action::Rebind),
        Commands::Test => cmd_test(&app),
        Commands::Config { command } => cmd_config(&app, command),
        Commands::Upload { target } => cmd_transfer(&app, target, Action::Upload),
        Commands::Download { target } => cmd_transfer(&app, target, Action::Download),
        Commands::Compare => cmd_compare(&app),
        Commands::Interactive => cmd_interactive(&app),
    }
}

fn init_logging(verbose: bool, bus: &LogBus) -> Result<()> {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::from_default_env()
        .add_directive(format!("mcdrive={}", level).parse()?)
        .add_directive(format!("mcdrive_sync={}", level).parse()?);

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(bus.layer())
        .init();
    Ok(())
}

fn build_controller(app: &App) -> Result<SyncController> {
    let config = AppConfig::load(&app.paths.config_file())?;

    let binder = if app.offline {
        DriveBinder::new(
            CredentialStore::new(app.paths.offline_token_file()),
            Box::new(OfflineAuthorizer),
            Box::new(Arc::new(MemoryDrive::persistent(app.paths.offline_drive_dir())?)),
        )
    } else {
        DriveBinder::new(
            CredentialStore::new(app.paths.token_file()),
            Box::new(InstalledAppFlow::new(app.paths.client_secret_file())),
            Box::new(GoogleConnector),
        )
    };

    Ok(SyncController::new(binder, config, app.paths.config_file()))
}

/// Block on `task` behind a spinner, printing every completion that arrives.
fn run_task(controller: &mut SyncController, task: TaskHandle, message: &str) -> Result<bool> {
    let spinner = ProgressBar::new_spinner();
    spinner.set_style(ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}")?);
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner.set_message(message.to_string());

    let mut success = None;
    while success.is_none() {
        for completion in controller.pump() {
            if completion.task == task {
                success = Some(completion.is_success());
            }
            spinner.suspend(|| print_completion(&completion));
        }
        if success.is_none() {
            std::thread::sleep(Duration::from_millis(100));
        }
    }

    spinner.finish_and_clear();
    Ok(success.unwrap_or(false))
}

/// Wait for tasks still running (the automatic comparison after a bind).
fn drain(controller: &mut SyncController) {
    for completion in controller.wait_idle() {
        print_completion(&completion);
    }
}

/// Bind using the cached token; one-shot commands never start a browser flow.
fn ensure_bound(controller: &mut SyncController) -> Result<bool> {
    if controller.state() == BindState::Bound {
        return Ok(true);
    }
    match controller.bind_cached() {
        Some(task) => run_task(controller, task, "Connecting to Google Drive..."),
        None => {
            println!("{}", "✗ Not bound. Please run 'mcdrive bind' first.".red());
            Ok(false)
        }
    }
}

fn dispatch_and_wait(controller: &mut SyncController, action: Action) -> Result<bool> {
    match controller.dispatch(action) {
        Ok(task) => run_task(controller, task, &format!("Running {}...", action)),
        Err(e) => {
            println!("{}", format!("✗ {}", e).red());
            Ok(false)
        }
    }
}

// ============ STATUS COMMAND ============

fn cmd_status(app: &App) -> Result<()> {
    println!("{}", "mcdrive status".bold().cyan());
    println!();

    let config = AppConfig::load(&app.paths.config_file())?;
    println!("Config dir:   {}", app.paths.config_dir().display().to_string().dimmed());
    print_config(&config);

    let token = if app.offline {
        app.paths.offline_token_file()
    } else {
        app.paths.token_file()
    };
    if token.exists() {
        println!("Token:        {}", "cached".green());
    } else {
        println!("Token:        {}", "none (run 'mcdrive bind')".yellow());
    }

    if !app.offline && !app.paths.client_secret_file().exists() {
        println!(
            "Client secret: {} {}",
            "missing".red(),
            app.paths.client_secret_file().display().to_string().dimmed()
        );
    }
    if app.offline {
        println!(
            "Mode:         {} {}",
            "offline".yellow(),
            app.paths.offline_drive_dir().display().to_string().dimmed()
        );
    }

    Ok(())
}

// ============ BIND COMMAND ============

fn cmd_bind(app: &App, action: Action) -> Result<()> {
    println!("{}", "🔐 Google Drive binding".bold().cyan());
    println!();

    let mut controller = build_controller(app)?;
    if dispatch_and_wait(&mut controller, action)? {
        println!();
        println!(
            "{}",
            format!("✓ Bound to '{}'", SYNC_FOLDER_NAME).green().bold()
        );
    }
    Ok(())
}

// ============ TEST COMMAND ============

fn cmd_test(app: &App) -> Result<()> {
    let mut controller = build_controller(app)?;
    if !ensure_bound(&mut controller)? {
        return Ok(());
    }
    if dispatch_and_wait(&mut controller, Action::TestBind)? {
        if let Some(files) = &controller.display().files {
            print_files(files);
        }
    }
    Ok(())
}

// ============ CONFIG COMMAND ============

fn cmd_config(app: &App, command: ConfigCommands) -> Result<()> {
    let path = app.paths.config_file();
    let config = AppConfig::load(&path)?;

    match command {
        ConfigCommands::Show => {
            println!("{}", path.display().to_string().dimmed());
            print_config(&config);
        }
        ConfigCommands::Set {
            save_path,
            save_folder,
        } => {
            let updated = AppConfig::new(
                save_path.unwrap_or(config.save_path).trim(),
                save_folder.unwrap_or(config.save_folder).trim(),
            );
            updated
                .save(&path)
                .with_context(|| format!("Cannot write {}", path.display()))?;
            println!("{}", "✓ Settings saved".green());
            print_config(&updated);
        }
    }
    Ok(())
}

// ============ UPLOAD / DOWNLOAD COMMANDS ============

fn cmd_transfer(app: &App, target: Target, action: fn(SyncUnit) -> Action) -> Result<()> {
    let mut controller = build_controller(app)?;
    if !controller.config().is_complete() {
        println!(
            "{}",
            "✗ Settings incomplete. Run 'mcdrive config set --save-path <DIR> --save-folder <NAME>'."
                .red()
        );
        return Ok(());
    }
    if !ensure_bound(&mut controller)? {
        return Ok(());
    }

    let units = target.units();
    let total = units.len();
    let mut failed = 0;
    for (i, unit) in units.into_iter().enumerate() {
        let action = action(unit);
        println!("{}", format!("Step {}/{}: {}", i + 1, total, action).bold());
        if !dispatch_and_wait(&mut controller, action)? {
            failed += 1;
        }
    }

    println!();
    if failed == 0 {
        println!("{}", "✓ Done!".green().bold());
    } else {
        println!("{}", format!("✗ {} of {} step(s) failed", failed, total).red().bold());
    }
    Ok(())
}

// ============ COMPARE COMMAND ============

fn cmd_compare(app: &App) -> Result<()> {
    let mut controller = build_controller(app)?;
    if !ensure_bound(&mut controller)? {
        return Ok(());
    }
    if dispatch_and_wait(&mut controller, Action::Compare)? {
        if let Some(report) = &controller.display().versions {
            print_report(report);
        }
    }
    Ok(())
}

// ============ INTERACTIVE COMMAND ============

const MENU: [&str; 11] = [
    "Bind Google Drive",
    "Rebind account",
    "Test binding",
    "Upload saves",
    "Upload mods",
    "Download saves",
    "Download mods",
    "Compare versions",
    "Settings",
    "Show log",
    "Quit",
];

fn cmd_interactive(app: &App) -> Result<()> {
    println!("{}", "⛏  mcdrive".bold().cyan());
    println!();

    let mut controller = build_controller(app)?;
    if let Some(task) = controller.auto_bind() {
        run_task(&mut controller, task, "Connecting to Google Drive...")?;
    }

    let theme = ColorfulTheme::default();
    loop {
        for completion in controller.pump() {
            print_completion(&completion);
        }
        print_header(&controller);

        let choice = Select::with_theme(&theme)
            .with_prompt("Action")
            .items(&MENU)
            .default(0)
            .interact()?;

        let action = match choice {
            0 => Action::Bind,
            1 => Action::Rebind,
            2 => Action::TestBind,
            3 => Action::Upload(SyncUnit::Saves),
            4 => Action::Upload(SyncUnit::Mods),
            5 => Action::Download(SyncUnit::Saves),
            6 => Action::Download(SyncUnit::Mods),
            7 => Action::Compare,
            8 => {
                edit_settings(&mut controller, &theme)?;
                continue;
            }
            9 => {
                for event in app.recent.snapshot() {
                    println!("{}", event.to_string().dimmed());
                }
                continue;
            }
            _ => break,
        };

        if dispatch_and_wait(&mut controller, action)? {
            match action {
                Action::TestBind => {
                    if let Some(files) = &controller.display().files {
                        print_files(files);
                    }
                }
                Action::Compare => {
                    if let Some(report) = &controller.display().versions {
                        print_report(report);
                    }
                }
                _ => {}
            }
        }
    }

    drain(&mut controller);
    Ok(())
}

fn edit_settings(controller: &mut SyncController, theme: &ColorfulTheme) -> Result<()> {
    let current = controller.config().clone();
    let save_path: String = Input::with_theme(theme)
        .with_prompt("Game directory")
        .with_initial_text(current.save_path)
        .allow_empty(true)
        .interact_text()?;
    let save_folder: String = Input::with_theme(theme)
        .with_prompt("Save folder name")
        .with_initial_text(current.save_folder)
        .allow_empty(true)
        .interact_text()?;

    match controller.save_config(&save_path, &save_folder) {
        Ok(()) => println!("{}", "✓ Settings saved".green()),
        Err(e) => println!("{}", format!("✗ {}", e).red()),
    }
    Ok(())
}

// ============ OUTPUT ============

fn print_header(controller: &SyncController) {
    let state = match controller.state() {
        BindState::Bound => "bound".green(),
        BindState::Unbound => "not bound".yellow(),
        BindState::Binding | BindState::Rebinding => "binding...".cyan(),
    };
    println!();
    println!("Drive: {}", state);
    print_config(controller.config());
    if let Some(message) = &controller.display().last_message {
        println!("Last:  {}", message.dimmed());
    }
}

fn print_config(config: &AppConfig) {
    let show = |value: &str| {
        if value.trim().is_empty() {
            "(not set)".yellow()
        } else {
            value.normal()
        }
    };
    println!("Game directory: {}", show(&config.save_path));
    println!("Save folder:    {}", show(&config.save_folder));
}

fn print_completion(completion: &Completion) {
    let line = completion.summary();
    match &completion.outcome {
        TaskOutcome::Failed(_) => println!("{}", format!("✗ {}", line).red()),
        TaskOutcome::Downloaded(DownloadOutcome::NativeDocument { .. }) => {
            println!("{}", format!("! {}", line).yellow())
        }
        _ => println!("{}", format!("✓ {}", line).green()),
    }
}

fn print_files(files: &[DriveFile]) {
    if files.is_empty() {
        println!("  {}", "Sync folder is empty".dimmed());
        return;
    }
    for file in files {
        let size = file.size.map(format_bytes).unwrap_or_else(|| "-".to_string());
        println!(
            "  {:<32} {:>10}  {}",
            file.name,
            size,
            file.modified_time.as_deref().unwrap_or("").dimmed()
        );
    }
}

fn print_report(report: &VersionReport) {
    for unit in report.units() {
        print_unit(unit);
    }
}

fn print_unit(cmp: &UnitComparison) {
    let time = |t: Option<chrono::DateTime<chrono::Local>>| {
        t.map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string())
    };

    println!();
    println!("{} ({})", cmp.unit.to_string().bold(), cmp.remote.name);
    println!(
        "  Remote: {}  {}",
        time(cmp.remote.modified_local()),
        cmp.remote.size.map(format_bytes).unwrap_or_else(|| "-".to_string())
    );
    println!(
        "  Local:  {}  {} in {} file(s)",
        time(cmp.local.latest_modified),
        format_bytes(cmp.local.total_size),
        cmp.local.file_count
    );
    println!("  => {}", cmp.freshness.to_string().cyan());
}

fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}
