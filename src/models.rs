// src/models.rs

use crate::adapter::Telemetry;
use crate::status::{eta, JobStatus, TransferState};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Which transport acquires a job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DownloaderKind {
    Torrent,
    RealDebrid,
    TorBox,
    GenericHttp,
    PixelDrain,
}

impl DownloaderKind {
    pub fn is_torrent(self) -> bool {
        matches!(self, DownloaderKind::Torrent)
    }
}

impl fmt::Display for DownloaderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DownloaderKind::Torrent => "torrent",
            DownloaderKind::RealDebrid => "real_debrid",
            DownloaderKind::TorBox => "torbox",
            DownloaderKind::GenericHttp => "generic_http",
            DownloaderKind::PixelDrain => "pixeldrain",
        };
        f.write_str(name)
    }
}

impl FromStr for DownloaderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "torrent" => Ok(DownloaderKind::Torrent),
            "real_debrid" | "realdebrid" => Ok(DownloaderKind::RealDebrid),
            "torbox" => Ok(DownloaderKind::TorBox),
            "generic_http" | "http" => Ok(DownloaderKind::GenericHttp),
            "pixeldrain" => Ok(DownloaderKind::PixelDrain),
            other => Err(format!("unknown downloader `{other}`")),
        }
    }
}

/// Archive extensions that require extraction once the transfer completes.
const ARCHIVE_EXTENSIONS: &[&str] = &["rar", "zip", "7z"];

pub fn is_archive(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ARCHIVE_EXTENSIONS.iter().any(|a| a.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}

/// The persistent record of one acquisition, 1:1 with a library entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub shop: String,
    pub object_id: String,
    pub downloader: DownloaderKind,
    /// Magnet link, provider locator or direct URL.
    pub uri: String,
    pub download_path: PathBuf,
    pub folder_name: Option<String>,
    pub status: JobStatus,
    pub progress: f64,
    pub file_verification_progress: f64,
    pub bytes_downloaded: u64,
    /// Unknown until metadata is resolved.
    pub file_size: Option<u64>,
    pub rar_path: Option<PathBuf>,
    pub decompression_progress: f64,
    pub should_seed: bool,
    pub is_deleted: bool,
}

/// What applying one telemetry sample did to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// Counters moved; the transfer is still running.
    Progress,
    /// The adapter proved that every byte is on disk.
    TransferComplete,
    /// The sample would break the state machine and was ignored.
    Rejected,
}

impl Job {
    pub fn new(
        shop: impl Into<String>,
        object_id: impl Into<String>,
        downloader: DownloaderKind,
        uri: impl Into<String>,
        download_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            shop: shop.into(),
            object_id: object_id.into(),
            downloader,
            uri: uri.into(),
            download_path: download_path.into(),
            folder_name: None,
            status: JobStatus::Paused,
            progress: 0.0,
            file_verification_progress: 0.0,
            bytes_downloaded: 0,
            file_size: None,
            rar_path: None,
            decompression_progress: 0.0,
            should_seed: false,
            is_deleted: false,
        }
    }

    /// Opaque stable identity used on the wire and in broadcasts.
    pub fn game_id(&self) -> String {
        game_id(&self.shop, &self.object_id)
    }

    /// Whether a new start request describes the same transfer as this record.
    pub fn same_intent(&self, other: &Job) -> bool {
        self.downloader == other.downloader
            && self.uri == other.uri
            && self.download_path == other.download_path
    }

    /// The status a job enters when its adapter is (re)started.
    pub fn initial_status(&self) -> JobStatus {
        match self.downloader {
            DownloaderKind::Torrent => JobStatus::DownloadingMetadata,
            DownloaderKind::GenericHttp | DownloaderKind::PixelDrain => JobStatus::Downloading,
            // Cloud jobs only become Downloading once a URL has been resolved.
            DownloaderKind::RealDebrid | DownloaderKind::TorBox => self.status,
        }
    }

    /// Cancellation always zeroes the transfer counters.
    pub fn reset_counters(&mut self) {
        self.status = JobStatus::Cancelled;
        self.progress = 0.0;
        self.file_verification_progress = 0.0;
        self.bytes_downloaded = 0;
        self.decompression_progress = 0.0;
    }

    /// Folds one adapter sample into the record.
    ///
    /// `progress` never decreases while the status stays the same, and folder
    /// name / size / archive path are only recorded the first time they are known.
    pub fn apply_telemetry(&mut self, sample: &Telemetry) -> Applied {
        let next = match sample.state {
            TransferState::CheckingFiles => JobStatus::CheckingFiles,
            TransferState::DownloadingMetadata => JobStatus::DownloadingMetadata,
            TransferState::Downloading => JobStatus::Downloading,
            // Completion is decided by the orchestrator; the record stays in
            // its transfer status until then.
            TransferState::Finished | TransferState::Seeding => JobStatus::Downloading,
        };
        if !self.status.can_transition(next) {
            return Applied::Rejected;
        }

        if self.folder_name.as_deref().map_or(true, str::is_empty) {
            if let Some(name) = sample.folder_name.as_ref().filter(|n| !n.is_empty()) {
                self.folder_name = Some(name.clone());
            }
        }
        if self.file_size.map_or(true, |size| size == 0) {
            if let Some(size) = sample.file_size.filter(|s| *s > 0) {
                self.file_size = Some(size);
            }
        }
        if self.rar_path.is_none() {
            if let Some(artifact) = sample.artifact.as_ref().filter(|p| is_archive(p)) {
                self.rar_path = Some(artifact.clone());
            }
        }

        let same_status = self.status == next;
        match sample.state {
            TransferState::CheckingFiles => {
                self.file_verification_progress = if same_status {
                    self.file_verification_progress.max(sample.progress)
                } else {
                    sample.progress
                };
            }
            TransferState::DownloadingMetadata => {}
            TransferState::Downloading => {
                let progress = sample.progress.clamp(0.0, 1.0);
                self.progress = if same_status { self.progress.max(progress) } else { progress };
            }
            TransferState::Finished | TransferState::Seeding => {
                self.progress = 1.0;
            }
        }

        self.bytes_downloaded = match self.file_size {
            Some(size) => sample.bytes_downloaded.min(size),
            None => sample.bytes_downloaded,
        };
        self.status = next;

        if sample.state.is_complete() {
            if let Some(size) = self.file_size {
                self.bytes_downloaded = size;
            }
            Applied::TransferComplete
        } else {
            Applied::Progress
        }
    }

    /// The progress a user should see for the current status.
    pub fn visible_progress(&self) -> f64 {
        match self.status {
            JobStatus::CheckingFiles => self.file_verification_progress,
            JobStatus::Decompressing => self.decompression_progress,
            _ => self.progress,
        }
    }
}

pub fn game_id(shop: &str, object_id: &str) -> String {
    format!("{shop}-{object_id}")
}

/// Sanitized status payload pushed to the presentation layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StatusBroadcast {
    pub game_id: String,
    pub status: JobStatus,
    pub progress: f64,
    pub bytes_downloaded: u64,
    pub file_size: Option<u64>,
    pub download_speed: u64,
    /// Milliseconds; `None` means unknown / infinite.
    pub time_remaining: Option<u64>,
    pub num_peers: u32,
    pub num_seeds: u32,
}

impl StatusBroadcast {
    pub fn from_job(job: &Job, sample: Option<&Telemetry>) -> Self {
        let (speed, peers, seeds) = sample
            .map(|s| (s.download_speed, s.num_peers, s.num_seeds))
            .unwrap_or_default();
        let time_remaining = if job.status.is_active() && !job.status.is_pre_stage() {
            eta(job.file_size, job.bytes_downloaded, speed).map(|d| d.as_millis() as u64)
        } else {
            None
        };
        Self {
            game_id: job.game_id(),
            status: job.status,
            progress: job.visible_progress(),
            bytes_downloaded: job.bytes_downloaded,
            file_size: job.file_size,
            download_speed: speed,
            time_remaining,
            num_peers: peers,
            num_seeds: seeds,
        }
    }
}
