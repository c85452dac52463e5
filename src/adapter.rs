// src/adapter.rs

use crate::agent::AgentError;
use crate::cloud::CloudError;
use crate::downloader::DownloadError;
use crate::models::Job;
use crate::status::TransferState;
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
pub enum AdapterError {
    /// The backend cannot serve any job (e.g. the agent binary is missing).
    #[error("fatal: {0}")]
    Fatal(String),
    #[error("transfer agent error: {0}")]
    Agent(#[from] AgentError),
    #[error("cloud provider error: {0}")]
    Cloud(#[from] CloudError),
    #[error("download error: {0}")]
    Download(#[from] DownloadError),
    #[error("unsupported locator: {0}")]
    Locator(String),
}

/// One transport-agnostic progress sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Telemetry {
    pub state: TransferState,
    pub progress: f64,
    pub bytes_downloaded: u64,
    pub file_size: Option<u64>,
    /// Bytes per second.
    pub download_speed: u64,
    pub num_peers: u32,
    pub num_seeds: u32,
    pub folder_name: Option<String>,
    /// The file written by an HTTP transfer, once complete.
    pub artifact: Option<PathBuf>,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self {
            state: TransferState::Downloading,
            progress: 0.0,
            bytes_downloaded: 0,
            file_size: None,
            download_speed: 0,
            num_peers: 0,
            num_seeds: 0,
            folder_name: None,
            artifact: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    Transfer(Telemetry),
    Extraction { progress: f64 },
    ExtractionDone,
    /// The adapter gave up on this job; it must be left resumable.
    Failed { reason: String, retryable: bool },
    /// The adapter's process or channel went away without a terminal event.
    Exited,
}

/// The single message shape every adapter reports through.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusEvent {
    pub game_id: String,
    /// Identifies the adapter instance that produced the event.
    pub generation: u64,
    pub kind: EventKind,
}

impl StatusEvent {
    /// Progress-only ticks may be dropped when a newer tick supersedes them.
    pub fn is_progress_tick(&self) -> bool {
        match &self.kind {
            EventKind::Transfer(t) => !t.state.is_complete(),
            EventKind::Extraction { .. } => true,
            _ => false,
        }
    }

    /// Whether `self` makes `older` redundant.
    pub fn supersedes(&self, older: &StatusEvent) -> bool {
        if self.game_id != older.game_id || self.generation != older.generation {
            return false;
        }
        if !self.is_progress_tick() || !older.is_progress_tick() {
            return false;
        }
        match (&self.kind, &older.kind) {
            (EventKind::Transfer(new), EventKind::Transfer(old)) => {
                new.state == old.state
                    && (old.folder_name.is_none() || new.folder_name.is_some())
                    && (old.file_size.is_none() || new.file_size.is_some())
            }
            (EventKind::Extraction { .. }, EventKind::Extraction { .. }) => true,
            _ => false,
        }
    }
}

/// Drops progress ticks that a later tick in the same burst supersedes.
/// Distinct states, failures and completions always survive, in order.
pub fn coalesce(batch: Vec<StatusEvent>) -> Vec<StatusEvent> {
    let mut out: Vec<StatusEvent> = Vec::with_capacity(batch.len());
    for event in batch {
        if let Some(last) = out.last() {
            if event.supersedes(last) {
                out.pop();
            }
        }
        out.push(event);
    }
    out
}

pub type EventSink = mpsc::UnboundedSender<StatusEvent>;

/// Identity and outlet handed to an adapter instance.
#[derive(Debug, Clone)]
pub struct TransferContext {
    pub game_id: String,
    pub generation: u64,
    sink: EventSink,
}

impl TransferContext {
    pub fn new(game_id: impl Into<String>, generation: u64, sink: EventSink) -> Self {
        Self { game_id: game_id.into(), generation, sink }
    }

    /// Sends an event. Returns false once the orchestrator is gone.
    pub fn emit(&self, kind: EventKind) -> bool {
        self.sink
            .send(StatusEvent {
                game_id: self.game_id.clone(),
                generation: self.generation,
                kind,
            })
            .is_ok()
    }

    pub fn telemetry(&self, sample: Telemetry) -> bool {
        self.emit(EventKind::Transfer(sample))
    }

    pub fn failed(&self, reason: impl Into<String>, retryable: bool) -> bool {
        self.emit(EventKind::Failed { reason: reason.into(), retryable })
    }
}

/// A running (or parked) transfer for one job.
#[async_trait]
pub trait Transfer: Send + Sync {
    async fn start(&self) -> Result<(), AdapterError>;
    async fn pause(&self) -> Result<(), AdapterError>;
    async fn resume(&self) -> Result<(), AdapterError>;
    async fn cancel(&self) -> Result<(), AdapterError>;
}

/// Creates transfers for one downloader kind.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Fails fast when the backend cannot serve jobs at all.
    fn preflight(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn open(&self, job: &Job, ctx: TransferContext) -> Result<Arc<dyn Transfer>, AdapterError>;

    /// Stops uploading a finished job. Only the torrent backend seeds.
    async fn pause_seeding(&self, _job: &Job) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn resume_seeding(&self, _job: &Job) -> Result<(), AdapterError> {
        Ok(())
    }
}
