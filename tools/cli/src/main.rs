//! meldanya backup CLI.
//!
//! Backs up the configured files and directories to every configured
//! storage provider, then prunes each provider to its newest backups.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, ValueEnum};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use meldanya_backup::{connect_all, resolve_path, Backup, BackupConfig, Pipeline, ProviderContext};
use meldanya_storage::TerminalPrompt;

#[derive(Parser, Debug)]
#[command(name = "meldanya-backup")]
#[command(about = "Compress, encrypt and upload backups to cloud storage")]
#[command(version)]
struct Cli {
    /// Log level.
    #[arg(long, value_enum, ignore_case = true, default_value_t = LogLevel::Error)]
    loglevel: LogLevel,

    /// Log file. Relative paths are taken from the program's directory.
    #[arg(long, default_value = "~/.meldanya_backup.log")]
    logfile: PathBuf,

    /// Configuration file. Relative paths are taken from the program's directory.
    #[arg(long, default_value = "~/.meldanya_backup.conf")]
    config: PathBuf,

    /// Do not open authorization URLs in a browser.
    #[arg(long)]
    no_browser: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "UPPER")]
enum LogLevel {
    /// No log file is written.
    None,
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    /// Filter directive, `None` when logging is off.
    fn directive(self) -> Option<&'static str> {
        match self {
            LogLevel::None => None,
            LogLevel::Debug => Some("debug"),
            LogLevel::Info => Some("info"),
            LogLevel::Warning => Some("warn"),
            LogLevel::Error => Some("error"),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let base = program_dir();

    let logfile = resolve_path(&cli.logfile, &base);
    if let Err(e) = init_logging(cli.loglevel, &logfile) {
        eprintln!("Failed to set up logging: {:#}", e);
    }

    match run(&cli, &base).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("A fatal error occurred, see log file for details");
            ExitCode::FAILURE
        }
    }
}

/// Directory containing the running executable.
fn program_dir() -> PathBuf {
    std::env::current_exe()
        .and_then(|exe| exe.canonicalize())
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Open the log file for appending.
fn open_log_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create log directory {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file {}", path.display()))
}

/// Install the file logger. `RUST_LOG` overrides the level when set.
fn init_logging(level: LogLevel, logfile: &Path) -> Result<()> {
    let Some(directive) = level.directive() else {
        return Ok(());
    };

    let file = open_log_file(logfile)?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(Mutex::new(file))
        .with_ansi(false)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow!("Failed to install logger: {}", e))
}

async fn run(cli: &Cli, base: &Path) -> Result<()> {
    let config_path = resolve_path(&cli.config, base);
    let config = BackupConfig::load(&config_path)
        .await
        .context("Failed to load configuration")?;

    let prompt = TerminalPrompt::new(!cli.no_browser);
    let ctx = ProviderContext {
        token_dir: config.token_dir_or(base),
        prompt: &prompt,
    };
    let providers = connect_all(&config, &ctx)
        .await
        .context("Failed to set up storage providers")?;

    if providers.is_empty() {
        warn!("No providers configured in {}", config_path.display());
    }

    let mut backup = Backup::new(Pipeline::from_config(&config));

    for configured in providers {
        info!("Backing up to {}...", configured.provider.name());
        let report = backup.run(&configured.files, configured.provider).await;
        info!(
            provider = %report.provider,
            folder = report.folder.as_deref().unwrap_or("-"),
            uploaded = report.uploaded,
            failed = report.failed,
            skipped = report.skipped,
            "Backup run finished"
        );
    }

    for report in backup.cleanup_all(config.keep_backups).await {
        info!(
            provider = %report.provider,
            deleted = report.deleted,
            failed = report.failed,
            "Cleanup finished"
        );
    }

    Ok(())
}
