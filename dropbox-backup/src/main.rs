//! Dropbox Backup - Main entry point
//!
//! Runs one incremental backup of a local directory to Dropbox.

use anyhow::Result;
use clap::Parser;
use dropbox_backup::{
    config::Config, daemon::shutdown::ShutdownCoordinator, remote::DropboxStore, utils,
    BackupError, BackupExecutor,
};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Show what would be uploaded or deleted without contacting Dropbox
    #[arg(long)]
    dry_run: bool,

    /// Print the run summary as JSON
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() {
    let code = match run(Args::parse()).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            e.downcast_ref::<BackupError>()
                .map(BackupError::exit_code)
                .unwrap_or(3)
        }
    };
    std::process::exit(code);
}

async fn run(args: Args) -> Result<i32> {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();

    let config = Config::from_file(&args.config)?;
    config.validate(!args.dry_run)?;

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::info!(
        "Starting dropbox-backup v{} (config: {})",
        env!("CARGO_PKG_VERSION"),
        args.config.display()
    );

    let store = Arc::new(DropboxStore::from_config(&config.remote)?);
    let cancel = ShutdownCoordinator::new().spawn_listener();
    let executor = BackupExecutor::with_cancel(config, store, cancel);

    if args.dry_run {
        let plan = executor.plan().await?;
        print!("{}", plan);
        return Ok(0);
    }

    let summary = executor.run().await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print!("{}", summary);
    }

    Ok(summary.exit_code())
}
