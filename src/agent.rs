// src/agent.rs

//! Supervision of the external peer-to-peer transfer agent.
//!
//! One long-lived agent process serves every torrent job. It is started on
//! first use, told which job to work on through commands, and respawned when
//! a later job finds it dead.

use crate::adapter::{AdapterError, Backend, EventKind, Telemetry, Transfer, TransferContext};
use crate::config::AgentConfig;
use crate::models::Job;
use crate::status::TransferState;
use crate::transport::{
    decode_frame, encode_frame, Channel, FrameReader, FrameWriter, PipeEndpoints, TransportError,
};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How long one read attempt waits before yielding back to the loop.
pub const READ_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("transfer agent binary not found at {0}")]
    BinaryMissing(PathBuf),
    #[error("failed to spawn transfer agent: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("transfer agent exited before connecting ({0})")]
    ExitedEarly(String),
    #[error("transfer agent is not running")]
    NotRunning,
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Commands sent down the request pipe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum AgentCommand {
    Start { game_id: String, magnet: String, save_path: String },
    Pause { game_id: String },
    Cancel { game_id: String },
    ResumeSeeding { game_id: String, magnet: String, save_path: String },
    PauseSeeding { game_id: String },
}

impl AgentCommand {
    pub fn start(job: &Job) -> Self {
        AgentCommand::Start {
            game_id: job.game_id(),
            magnet: job.uri.clone(),
            save_path: job.download_path.to_string_lossy().into_owned(),
        }
    }

    pub fn resume_seeding(job: &Job) -> Self {
        AgentCommand::ResumeSeeding {
            game_id: job.game_id(),
            magnet: job.uri.clone(),
            save_path: job.download_path.to_string_lossy().into_owned(),
        }
    }
}

/// Status frames read from the response pipe.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentStatusFrame {
    pub game_id: String,
    #[serde(default)]
    pub progress: f64,
    /// Bytes per second.
    #[serde(default)]
    pub download_speed: f64,
    /// Not trusted; time remaining is recomputed from size and speed.
    #[serde(default)]
    pub time_remaining: Option<f64>,
    #[serde(default)]
    pub num_peers: u32,
    #[serde(default)]
    pub num_seeds: u32,
    pub status: TransferState,
    #[serde(default)]
    pub folder_name: Option<String>,
    #[serde(default)]
    pub file_size: Option<u64>,
    #[serde(default)]
    pub bytes_downloaded: u64,
}

impl AgentStatusFrame {
    pub fn into_telemetry(self, save_path: &Path) -> Telemetry {
        let artifact = if self.status.is_complete() {
            self.folder_name
                .as_deref()
                .filter(|name| !name.is_empty())
                .map(|name| save_path.join(name))
        } else {
            None
        };
        Telemetry {
            state: self.status,
            progress: self.progress.clamp(0.0, 1.0),
            bytes_downloaded: self.bytes_downloaded,
            file_size: self.file_size,
            download_speed: self.download_speed.max(0.0) as u64,
            num_peers: self.num_peers,
            num_seeds: self.num_seeds,
            folder_name: self.folder_name,
            artifact,
        }
    }
}

/// A connected agent: the framed channel plus the child process, if any.
pub struct AgentConnection {
    pub channel: Channel,
    pub child: Option<Child>,
}

/// Starts an agent and waits until it is connected.
#[async_trait]
pub trait AgentLauncher: Send + Sync {
    fn preflight(&self) -> Result<(), AgentError> {
        Ok(())
    }

    async fn launch(&self) -> Result<AgentConnection, AgentError>;
}

/// Spawns the agent binary with `(listen_port, request_pipe, response_pipe)`.
pub struct ProcessLauncher {
    binary: PathBuf,
    listen_port: u16,
    pipe_dir: PathBuf,
    connect_timeout: Duration,
}

impl ProcessLauncher {
    pub fn new(config: &AgentConfig) -> Self {
        Self {
            binary: config.binary_path.clone(),
            listen_port: config.listen_port,
            pipe_dir: config.pipe_dir.clone(),
            connect_timeout: config.connect_timeout(),
        }
    }
}

#[async_trait]
impl AgentLauncher for ProcessLauncher {
    fn preflight(&self) -> Result<(), AgentError> {
        if self.binary.is_file() {
            Ok(())
        } else {
            Err(AgentError::BinaryMissing(self.binary.clone()))
        }
    }

    async fn launch(&self) -> Result<AgentConnection, AgentError> {
        self.preflight()?;
        // Both endpoints must exist before the agent tries to open them.
        let endpoints = PipeEndpoints::create(&self.pipe_dir, "agent")?;
        info!(binary = %self.binary.display(), port = self.listen_port, "spawning transfer agent");

        let mut child = Command::new(&self.binary)
            .arg(self.listen_port.to_string())
            .arg(endpoints.request_path())
            .arg(endpoints.response_path())
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(AgentError::Spawn)?;

        let channel = tokio::select! {
            accepted = endpoints.accept(self.connect_timeout) => accepted?,
            status = child.wait() => {
                let status = status.map_err(AgentError::Spawn)?;
                return Err(AgentError::ExitedEarly(status.to_string()));
            }
        };
        info!("transfer agent connected");
        Ok(AgentConnection { channel, child: Some(child) })
    }
}

struct Route {
    ctx: TransferContext,
    save_path: PathBuf,
}

type Routes = Arc<Mutex<HashMap<String, Route>>>;

/// A running agent shared by every torrent transfer.
pub struct AgentProcess {
    writer: Mutex<FrameWriter>,
    routes: Routes,
    alive: Arc<AtomicBool>,
    shutdown: CancellationToken,
    _child: Mutex<Option<Child>>,
}

impl AgentProcess {
    fn spawn(connection: AgentConnection) -> Arc<Self> {
        let Channel { reader, writer } = connection.channel;
        let process = Arc::new(Self {
            writer: Mutex::new(writer),
            routes: Arc::new(Mutex::new(HashMap::new())),
            alive: Arc::new(AtomicBool::new(true)),
            shutdown: CancellationToken::new(),
            _child: Mutex::new(connection.child),
        });
        tokio::spawn(read_loop(
            reader,
            process.routes.clone(),
            process.alive.clone(),
            process.shutdown.clone(),
        ));
        process
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn send(&self, command: &AgentCommand) -> Result<(), AgentError> {
        if !self.is_alive() {
            return Err(AgentError::NotRunning);
        }
        let frame = encode_frame(command)?;
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.send(frame).await {
            self.alive.store(false, Ordering::SeqCst);
            return Err(e.into());
        }
        debug!(?command, "sent agent command");
        Ok(())
    }

    async fn register(&self, ctx: TransferContext, save_path: PathBuf) {
        let mut routes = self.routes.lock().await;
        routes.insert(ctx.game_id.clone(), Route { ctx, save_path });
    }

    async fn unregister(&self, ctx: &TransferContext) {
        let mut routes = self.routes.lock().await;
        if routes.get(&ctx.game_id).is_some_and(|r| r.ctx.generation == ctx.generation) {
            routes.remove(&ctx.game_id);
        }
    }
}

impl Drop for AgentProcess {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Reads status frames until the agent goes away. A quiet pipe is normal;
/// EOF or a broken channel means the agent exited.
async fn read_loop(
    mut reader: FrameReader,
    routes: Routes,
    alive: Arc<AtomicBool>,
    shutdown: CancellationToken,
) {
    loop {
        let polled = tokio::select! {
            _ = shutdown.cancelled() => break,
            polled = tokio::time::timeout(READ_POLL_INTERVAL, reader.next()) => polled,
        };
        let frame = match polled {
            Err(_) => continue,
            Ok(None) => {
                warn!("transfer agent closed its response pipe");
                break;
            }
            Ok(Some(Err(e))) => {
                warn!(error = %e, "transfer agent channel failed");
                break;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        let status: AgentStatusFrame = match decode_frame(&frame) {
            Ok(status) => status,
            Err(e) => {
                warn!(error = %e, "skipping malformed status frame");
                continue;
            }
        };
        let routes = routes.lock().await;
        match routes.get(&status.game_id) {
            Some(route) => {
                let sample = status.into_telemetry(&route.save_path);
                route.ctx.telemetry(sample);
            }
            None => debug!(game_id = %status.game_id, "status frame for a job with no transfer"),
        }
    }

    alive.store(false, Ordering::SeqCst);
    let orphaned: Vec<Route> = routes.lock().await.drain().map(|(_, route)| route).collect();
    if shutdown.is_cancelled() {
        return;
    }
    for route in orphaned {
        warn!(game_id = %route.ctx.game_id, "transfer agent exited mid-transfer");
        route.ctx.emit(EventKind::Exited);
    }
}

/// Backend for `DownloaderKind::Torrent`.
pub struct TorrentBackend {
    launcher: Arc<dyn AgentLauncher>,
    process: Mutex<Option<Arc<AgentProcess>>>,
}

impl TorrentBackend {
    pub fn new(launcher: Arc<dyn AgentLauncher>) -> Self {
        Self { launcher, process: Mutex::new(None) }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        Self::new(Arc::new(ProcessLauncher::new(config)))
    }

    /// The live agent, spawning a new one if needed.
    async fn process(&self) -> Result<Arc<AgentProcess>, AgentError> {
        let mut current = self.process.lock().await;
        if let Some(process) = current.as_ref() {
            if process.is_alive() {
                return Ok(process.clone());
            }
            info!("transfer agent is gone; respawning");
        }
        let process = AgentProcess::spawn(self.launcher.launch().await?);
        *current = Some(process.clone());
        Ok(process)
    }

    async fn live_process(&self) -> Option<Arc<AgentProcess>> {
        self.process.lock().await.as_ref().filter(|p| p.is_alive()).cloned()
    }
}

#[async_trait]
impl Backend for TorrentBackend {
    fn preflight(&self) -> Result<(), AdapterError> {
        self.launcher.preflight().map_err(|e| AdapterError::Fatal(e.to_string()))
    }

    async fn open(&self, job: &Job, ctx: TransferContext) -> Result<Arc<dyn Transfer>, AdapterError> {
        let process = self.process().await?;
        Ok(Arc::new(AgentTransfer {
            process,
            ctx,
            start: AgentCommand::start(job),
            save_path: job.download_path.clone(),
        }))
    }

    async fn pause_seeding(&self, job: &Job) -> Result<(), AdapterError> {
        // Nothing seeds without a running agent.
        if let Some(process) = self.live_process().await {
            process.send(&AgentCommand::PauseSeeding { game_id: job.game_id() }).await?;
        }
        Ok(())
    }

    async fn resume_seeding(&self, job: &Job) -> Result<(), AdapterError> {
        let process = self.process().await?;
        process.send(&AgentCommand::resume_seeding(job)).await?;
        Ok(())
    }
}

/// One torrent job on the shared agent.
pub struct AgentTransfer {
    process: Arc<AgentProcess>,
    ctx: TransferContext,
    start: AgentCommand,
    save_path: PathBuf,
}

#[async_trait]
impl Transfer for AgentTransfer {
    async fn start(&self) -> Result<(), AdapterError> {
        if !self.process.is_alive() {
            return Err(AgentError::NotRunning.into());
        }
        self.process.register(self.ctx.clone(), self.save_path.clone()).await;
        self.process.send(&self.start).await?;
        Ok(())
    }

    async fn pause(&self) -> Result<(), AdapterError> {
        let sent = self
            .process
            .send(&AgentCommand::Pause { game_id: self.ctx.game_id.clone() })
            .await;
        self.process.unregister(&self.ctx).await;
        Ok(sent?)
    }

    /// Resuming re-sends the same `start` command.
    async fn resume(&self) -> Result<(), AdapterError> {
        self.start().await
    }

    async fn cancel(&self) -> Result<(), AdapterError> {
        self.process.unregister(&self.ctx).await;
        if !self.process.is_alive() {
            return Ok(());
        }
        self.process
            .send(&AgentCommand::Cancel { game_id: self.ctx.game_id.clone() })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DownloaderKind;
    use serde_json::json;

    #[test]
    fn commands_use_action_tag() {
        let job = Job::new("steam", "9", DownloaderKind::Torrent, "magnet:?xt=urn:btih:aa", "/games");
        let start = serde_json::to_value(AgentCommand::start(&job)).unwrap();
        assert_eq!(
            start,
            json!({"action": "start", "game_id": "steam-9", "magnet": "magnet:?xt=urn:btih:aa", "save_path": "/games"})
        );
        let pause = serde_json::to_value(AgentCommand::Pause { game_id: "steam-9".into() }).unwrap();
        assert_eq!(pause, json!({"action": "pause", "game_id": "steam-9"}));
        let seeding = serde_json::to_value(AgentCommand::PauseSeeding { game_id: "steam-9".into() }).unwrap();
        assert_eq!(seeding["action"], "pause_seeding");
    }

    #[test]
    fn status_frame_parses_agent_output() {
        let raw = br#"{"gameId":"steam-9","progress":0.25,"downloadSpeed":1048576.0,"timeRemaining":12.5,
            "numPeers":4,"numSeeds":2,"status":3,"folderName":"Game","fileSize":4096,"bytesDownloaded":1024}"#;
        let frame: AgentStatusFrame = decode_frame(raw).unwrap();
        assert_eq!(frame.status, TransferState::Downloading);
        let sample = frame.into_telemetry(Path::new("/games"));
        assert_eq!(sample.download_speed, 1_048_576);
        assert_eq!(sample.file_size, Some(4096));
        assert_eq!(sample.artifact, None);
    }

    #[test]
    fn sparse_status_frame_is_accepted() {
        let frame: AgentStatusFrame =
            decode_frame(br#"{"gameId":"steam-9","status":2,"folderName":null,"fileSize":null}"#).unwrap();
        assert_eq!(frame.status, TransferState::DownloadingMetadata);
        assert_eq!(frame.bytes_downloaded, 0);
    }

    #[test]
    fn finished_frame_points_at_downloaded_folder() {
        let frame: AgentStatusFrame =
            decode_frame(br#"{"gameId":"steam-9","status":4,"progress":1,"folderName":"Game.rar"}"#).unwrap();
        let sample = frame.into_telemetry(Path::new("/games"));
        assert_eq!(sample.artifact, Some(PathBuf::from("/games/Game.rar")));
    }

    #[test]
    fn missing_binary_fails_preflight() {
        let config = AgentConfig {
            binary_path: PathBuf::from("/definitely/not/here/transfer-agent"),
            ..AgentConfig::default()
        };
        let backend = TorrentBackend::from_config(&config);
        assert!(matches!(backend.preflight(), Err(AdapterError::Fatal(_))));
    }
}
