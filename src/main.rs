//! Hashtree CLI entry point.

use anyhow::Context;
use clap::{Parser, Subcommand};
use hashtree::config::Config;
use hashtree::ops::Engine;
use hashtree::store::{ObjectStore, OpendalStore};
use hashtree::transfer::progress::LogSink;
use hashtree::utils::logger;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "hashtree")]
#[command(about = "Content-addressed, deduplicating, encrypted backup and sync")]
#[command(version)]
struct Args {
    /// Configuration file (defaults to ~/.htcfg)
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level override (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Scan the directory, upload missing content and commit a snapshot
    Snapshot,
    /// Restore every file in the remote database into the directory
    Restore {
        /// Overwrite local files whose content differs from the remote
        #[arg(long)]
        nuke: bool,
    },
    /// List the snapshots available in the bucket
    List,
    /// Create the bucket (fs backend) and seed an empty database
    Init,
}

fn build_store(config: &Config) -> anyhow::Result<Arc<dyn ObjectStore>> {
    let store = match config.backend.as_str() {
        "fs" => OpendalStore::fs(Path::new(&config.url), &config.bucket)?,
        _ => OpendalStore::s3(
            &config.endpoint(),
            &config.region,
            &config.bucket,
            &config.access_key,
            &config.secret_key,
        )?,
    };
    Ok(Arc::new(store))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config_path = match args.config {
        Some(path) => path,
        None => Config::default_path().context("cannot determine home directory; pass --config")?,
    };
    let config = Config::from_file(&config_path)?;

    let level = args.log_level.as_deref().unwrap_or(&config.log_level);
    logger::init(level)?;

    let store = build_store(&config)?;
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupt received, finishing in-flight transfers");
                cancel.cancel();
            }
        });
    }

    let engine = Engine::new(config, store, Arc::new(LogSink), cancel);

    match args.command {
        Command::Snapshot => {
            let summary = engine.snapshot().await?;
            info!(
                "Snapshot {} committed: {} scanned, {} uploaded, {} verified, {} failed, {} skipped",
                summary.snapshot_key,
                summary.scanned,
                summary.uploaded,
                summary.verified,
                summary.failed,
                summary.skipped
            );
            if summary.failed > 0 {
                error!(
                    "{} objects failed to upload; they will be retried on the next snapshot",
                    summary.failed
                );
                std::process::exit(1);
            }
        }
        Command::Restore { nuke } => {
            let summary = engine.restore(nuke).await?;
            info!("Restored {} files", summary.restored);
            if !summary.failed.is_empty() {
                error!("{} objects failed to restore", summary.failed.len());
                std::process::exit(1);
            }
        }
        Command::List => {
            for snapshot in engine.list().await? {
                println!("{snapshot}");
            }
        }
        Command::Init => {
            engine.init().await?;
        }
    }

    Ok(())
}
