// src/main.rs

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use gamedl::prelude::*;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "gamedl", version, about = "Download games through torrent, cloud or direct links")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "gamedl.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start a download and follow it until it stops.
    Start {
        #[arg(long, default_value = "custom")]
        shop: String,
        #[arg(long)]
        object_id: String,
        /// torrent, real_debrid, torbox, generic_http or pixeldrain
        #[arg(long)]
        downloader: DownloaderKind,
        uri: String,
        /// Defaults to the configured downloads directory.
        #[arg(long)]
        path: Option<PathBuf>,
    },
    /// Resume a paused download and follow it.
    Resume { game_id: String },
    Cancel { game_id: String },
    PauseSeeding { game_id: String },
    ResumeSeeding { game_id: String },
    /// Print every known job as JSON.
    List,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let state_manager = StateManager::new(&config.database_path).await?;
    let downloads_path = config.downloads_path.clone();
    let manager = Arc::new(DownloadManager::new(config, state_manager).await?);

    match cli.command {
        Command::Start { shop, object_id, downloader, uri, path } => {
            let job = Job::new(shop, object_id, downloader, uri, path.unwrap_or(downloads_path));
            let id = job.game_id();
            follow(manager, id, |m| async move { m.start_download(job).await }).await?;
        }
        Command::Resume { game_id } => {
            let id = game_id.clone();
            follow(manager, id, |m| async move { m.resume_download(&game_id).await }).await?;
        }
        Command::Cancel { game_id } => manager.cancel_download(&game_id).await?,
        Command::PauseSeeding { game_id } => manager.pause_seeding(&game_id).await?,
        Command::ResumeSeeding { game_id } => manager.resume_seeding(&game_id).await?,
        Command::List => {
            for job in manager.list_jobs().await? {
                println!("{}", serde_json::to_string(&job)?);
            }
        }
    }
    Ok(())
}

/// Runs the engine, issues `action`, then prints status lines until `game_id`
/// leaves the active statuses or Ctrl-C pauses it.
async fn follow<F, Fut>(manager: Arc<DownloadManager>, game_id: String, action: F) -> Result<()>
where
    F: FnOnce(Arc<DownloadManager>) -> Fut,
    Fut: std::future::Future<Output = Result<(), ManagerError>>,
{
    let mut updates = manager.subscribe();
    let engine = tokio::spawn(manager.clone().run());
    action(manager.clone()).await?;

    if manager.active_job().await.map(|job| job.game_id()) != Some(game_id.clone()) {
        info!(%game_id, "job is waiting for the active slot");
    }

    let outcome = loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(status) if status.game_id == game_id => {
                    println!("{}", serde_json::to_string(&status)?);
                    if !status.status.is_active() && status.status != JobStatus::Paused {
                        break status.status;
                    }
                    if status.status == JobStatus::Paused && manager.active_job().await.is_none() {
                        break status.status;
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "status updates dropped"),
                Err(RecvError::Closed) => bail!("engine stopped"),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted; pausing");
                manager.pause_download().await?;
                break JobStatus::Paused;
            }
        }
    };

    engine.abort();
    info!(%game_id, status = %outcome, "done");
    Ok(())
}
