//! # Snapvault CLI - nightly database backups to an object store
//!
//! Runs the database's own backup command into a local directory, then
//! synchronises that directory with a remote container, or pulls a persisted
//! snapshot back down.
//!
//! ## Usage
//! ```bash
//! # Back up this node (monitoring-compatible exit code)
//! snapvault backup --config /etc/snapvault.toml
//!
//! # Restore a given day of node 1 onto this host
//! snapvault restore-download --config /etc/snapvault.toml \
//!     --node v_db_node0001 --domain db --day 2024_03_01
//!
//! # Show persisted snapshots
//! snapvault list --config /etc/snapvault.toml --remote
//! ```

use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use colored::*;
use snapvault::{
    utils, BackupCommand, BackupDriver, Config, EpochLayout, FsStore, ObjectStore, RemoteStore,
    RestoreDriver, RunStatus, Selection, SwiftClient, VaultError,
};
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Instant;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Snapvault CLI - incremental snapshot backups to an object store
#[derive(Parser)]
#[command(name = "snapvault")]
#[command(about = "Incremental snapshot backup and restore against an object store", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file
    #[arg(short, long, global = true, default_value = "/etc/snapvault.toml")]
    config: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the database backup and synchronise it to the remote store
    Backup,

    /// Download a persisted snapshot into the local backup directory
    #[command(alias = "restore")]
    RestoreDownload {
        /// Database node whose backups to restore (e.g. v_db_node0001)
        #[arg(short, long)]
        node: String,

        /// Domain used to look up the container holding the node's backups
        #[arg(short, long)]
        domain: Option<String>,

        /// Container to restore from, overriding discovery
        #[arg(long)]
        container: Option<String>,

        /// Restore the newest snapshot of this day (YYYY_MM_DD)
        #[arg(long)]
        day: Option<String>,
    },

    /// List persisted snapshots, newest first
    #[command(alias = "ls")]
    List {
        /// List the remote store instead of the local one
        #[arg(short, long)]
        remote: bool,
    },
}

impl Commands {
    fn log_name(&self) -> &'static str {
        match self {
            Commands::Backup => "backup",
            Commands::RestoreDownload { .. } => "restore_download",
            Commands::List { .. } => "list",
        }
    }
}

fn main() {
    let cli = Cli::parse();

    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    let config = match Config::from_file(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!(
                "{}: {} ({})",
                "Error".red().bold(),
                e.user_message(),
                cli.config.display()
            );
            std::process::exit(1);
        }
    };

    if let Err(e) = init_logging(&config, cli.command.log_name(), cli.verbose) {
        eprintln!("{}: {:#}", "Error".red().bold(), e);
        std::process::exit(1);
    }

    let code = match cli.command {
        Commands::Backup => cmd_backup(&config),
        Commands::RestoreDownload { node, domain, container, day } => {
            report(cmd_restore(&config, &node, domain, container, day))
        }
        Commands::List { remote } => report(cmd_list(&config, remote)),
    };
    std::process::exit(code);
}

/// Print a command error and turn the outcome into an exit code
fn report(result: Result<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("{}: {:#}", "Error".red().bold(), e);
            1
        }
    }
}

/// Set up the tracing subscriber
///
/// `RUST_LOG` overrides the configured level and `--verbose` overrides both.
/// With a `log_dir`, output is appended to `<log_dir>/<command>_<Weekday>.log`
/// so a week of runs is kept.
fn init_logging(config: &Config, command: &str, verbose: bool) -> Result<()> {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level))
    };

    match &config.log_dir {
        Some(dir) => {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create log directory {}", dir.display()))?;
            let path = dir.join(format!("{}_{}.log", command, Local::now().format("%A")));
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
    Ok(())
}

/// Connect to the remote store for `prefix`
fn connect_remote(config: &Config, container: String, prefix: &str) -> Result<RemoteStore<SwiftClient>> {
    let client = SwiftClient::connect(&config.remote, container)
        .context("failed to connect to the remote store")?;
    Ok(RemoteStore::new(client, prefix)?.with_page_size(config.remote.page_size))
}

fn epoch_layout(config: &Config, node: &str) -> EpochLayout {
    EpochLayout::new(
        config.tree_dir_for(node),
        config.snapshot_name.clone(),
        config.epoch.files.clone(),
    )
}

/// Full backup run, returning the monitoring exit code
///
/// Every outcome, including errors, ends in one status line on stdout.
fn cmd_backup(config: &Config) -> i32 {
    let start = Instant::now();
    let failure = match run_backup(config) {
        Ok(integrity_ok) => (!integrity_ok).then_some(1),
        Err(e) => {
            error!("Backup failed: {:#}", e);
            eprintln!("{}: {:#}", "Error".red().bold(), e);
            let status = e
                .downcast_ref::<VaultError>()
                .and_then(|e| match e {
                    VaultError::CommandFailed { status: Some(code), .. } => Some(*code),
                    _ => None,
                })
                .unwrap_or(1);
            Some(status)
        }
    };

    let elapsed = start.elapsed();
    let minutes = elapsed.as_secs() / 60;
    let message = format!(
        "Backup completed in {} minutes total. Thresholds, warn {}.|{}",
        minutes, config.warning_minutes, minutes
    );
    let status = RunStatus::classify(failure, elapsed, config.warning_threshold());
    let line = status.status_line(&message);
    info!("{}", line);
    match status {
        RunStatus::Ok => println!("{}", line.green()),
        RunStatus::Warning => println!("{}", line.yellow()),
        RunStatus::Failed(_) => println!("{}", line.red().bold()),
    }
    status.exit_code()
}

/// Returns `false` when the run completed with integrity errors
fn run_backup(config: &Config) -> Result<bool> {
    if let Some(command) = config.backup_command.as_ref().filter(|c| c.enabled) {
        info!("Running database backup {}", command.program.display());
        let output = BackupCommand::from_config(command).run()?;
        info!("Database backup finished ({} bytes of output)", output.len());
    }

    let node = config.resolve_node_name()?;
    let prefix = config.prefix_for(&node);
    let container = match &config.remote.container {
        Some(container) => container.clone(),
        None => SwiftClient::default_container(config.remote.domain.as_deref())?,
    };
    info!("Backing up {} to container {}", prefix, container);

    let local = FsStore::new(&config.backup_dir, &prefix)?;
    let remote = connect_remote(config, container, &prefix)?;
    let report = BackupDriver::new(&local, &remote)
        .retain(config.retain)
        .epoch(epoch_layout(config, &node))
        .run()?;

    println!(
        "{} Snapshot {} uploaded: {} files ({}), {} deleted, {} pruned",
        "✓".green().bold(),
        report.snapshot_name.bold(),
        report.files_uploaded,
        utils::format_bytes(report.bytes_uploaded),
        report.files_deleted,
        report.snapshots_pruned
    );
    for problem in &report.integrity_errors {
        println!("  {} {}", "!".red().bold(), problem);
    }
    for path in &report.epoch_files_missing {
        println!("  {} epoch file not found: {}", "!".yellow().bold(), path.display());
    }
    Ok(!report.has_integrity_errors())
}

fn cmd_restore(
    config: &Config,
    node: &str,
    domain: Option<String>,
    container: Option<String>,
    day: Option<String>,
) -> Result<()> {
    let prefix = config.prefix_for(node);
    let domain = domain.or_else(|| config.remote.domain.clone());
    let container = match (container, &config.remote.container, &domain) {
        (Some(container), _, _) => container,
        (None, Some(container), _) => container.clone(),
        (None, None, Some(domain)) => SwiftClient::discover_container(&config.remote, domain, node)?,
        (None, None, None) => SwiftClient::default_container(None)?,
    };
    info!("Restoring {} from container {}", prefix, container);

    let local = FsStore::new(&config.backup_dir, &prefix)?;
    let remote = connect_remote(config, container, &prefix)?;
    let driver = RestoreDriver::new(&local, &remote).epoch(epoch_layout(config, node));

    let chooser = prompt_for_snapshot;
    let selection = match &day {
        Some(day) => Selection::Day(day.as_str()),
        None => Selection::Choose(&chooser),
    };
    let report = driver.run(selection)?;

    println!(
        "{} Restored {}: {} files downloaded ({}), {} deleted in {}",
        "✓".green().bold(),
        report.snapshot_name.bold(),
        report.files_downloaded,
        utils::format_bytes(report.bytes_downloaded),
        report.files_deleted,
        utils::format_elapsed(report.duration)
    );
    for path in &report.epoch_files_missing {
        println!("  {} epoch file not restored: {}", "!".yellow().bold(), path.display());
    }
    Ok(())
}

/// Ask the operator which snapshot to restore
///
/// A single candidate is taken without asking.
fn prompt_for_snapshot(candidates: &[String]) -> Option<String> {
    if let [only] = candidates {
        println!("Only one snapshot available, using {}", only.bold());
        return Some(only.clone());
    }

    println!("{}", "Available snapshots:".blue().bold());
    for (i, name) in candidates.iter().enumerate() {
        println!("  {:>3}  {}", (i + 1).to_string().yellow(), name);
    }

    let stdin = io::stdin();
    loop {
        print!("Snapshot to restore [1-{}]: ", candidates.len());
        io::stdout().flush().ok()?;

        let mut line = String::new();
        if stdin.lock().read_line(&mut line).ok()? == 0 {
            return None;
        }
        match line.trim().parse::<usize>() {
            Ok(n) if (1..=candidates.len()).contains(&n) => return Some(candidates[n - 1].clone()),
            _ => println!("{}", "Please enter one of the listed numbers".red()),
        }
    }
}

fn cmd_list(config: &Config, remote: bool) -> Result<()> {
    let node = config.resolve_node_name()?;
    let prefix = config.prefix_for(&node);

    let names = if remote {
        let container = match &config.remote.container {
            Some(container) => container.clone(),
            None => SwiftClient::default_container(config.remote.domain.as_deref())?,
        };
        println!("{} {} in {}", "Remote snapshots of".blue().bold(), prefix, container);
        connect_remote(config, container, &prefix)?.list_snapshot_files()?
    } else {
        println!("{} {}", "Local snapshots of".blue().bold(), config.tree_dir_for(&node).display());
        FsStore::new(&config.backup_dir, &prefix)?.list_snapshot_files()?
    };

    if names.is_empty() {
        println!("{}", "No snapshots found".yellow());
    }
    for name in names {
        println!("  {}", name);
    }
    Ok(())
}
