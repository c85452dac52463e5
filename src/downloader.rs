// src/downloader.rs

use crate::adapter::{AdapterError, Backend, Telemetry, Transfer, TransferContext};
use crate::config::HttpConfig;
use crate::models::{DownloaderKind, Job};
use crate::status::TransferState;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{CONTENT_DISPOSITION, RANGE};
use reqwest::{Client, Response, StatusCode};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Custom errors for download operations.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("server responded with HTTP {0}")]
    Status(u16),
    #[error("no data received for {0:?}")]
    Stalled(Duration),
    #[error("stream ended after {received} of {expected} bytes")]
    Truncated { received: u64, expected: u64 },
    #[error("server rejected resume from byte {0}")]
    RangeRejected(u64),
    #[error("download paused")]
    Paused,
}

impl DownloadError {
    /// Errors worth another attempt from the current offset.
    pub fn is_transient(&self) -> bool {
        match self {
            DownloadError::Network(_) | DownloadError::Stalled(_) => true,
            DownloadError::Truncated { .. } | DownloadError::RangeRejected(_) => true,
            DownloadError::Status(code) => *code == 429 || *code >= 500,
            _ => false,
        }
    }
}

/// Tunables shared by every HTTP transfer.
#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub retries: usize,
    pub timeout: Duration,
    pub progress_interval: Duration,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self::from(&HttpConfig::default())
    }
}

impl From<&HttpConfig> for HttpSettings {
    fn from(config: &HttpConfig) -> Self {
        Self {
            retries: config.retries,
            timeout: Duration::from_secs(config.timeout_secs),
            progress_interval: Duration::from_millis(config.progress_interval_ms),
        }
    }
}

pub fn build_client(settings: &HttpSettings) -> Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(concat!("gamedl/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(settings.timeout)
        .build()
}

/// Picks the file name from the URL path, falling back to `download`.
pub fn file_name_from_url(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_owned))
        })
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            urlencoding::decode(&segment)
                .map(|s| s.into_owned())
                .unwrap_or(segment)
        })
        .and_then(|name| sanitize(&name))
        .unwrap_or_else(|| "download".to_string())
}

fn file_name_from_disposition(response: &Response) -> Option<String> {
    let value = response.headers().get(CONTENT_DISPOSITION)?.to_str().ok()?;
    disposition_file_name(value)
}

fn disposition_file_name(value: &str) -> Option<String> {
    let raw = value
        .split(';')
        .map(str::trim)
        .find_map(|part| part.strip_prefix("filename="))?
        .trim_matches('"');
    let decoded = urlencoding::decode(raw).map(|s| s.into_owned()).unwrap_or_else(|_| raw.to_string());
    sanitize(&decoded)
}

/// Replaces path separators and reserved characters. Names that would
/// resolve to the directory itself or its parent are refused.
fn sanitize(name: &str) -> Option<String> {
    let name: String = name
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|') { '_' } else { c })
        .collect();
    let name = name.trim();
    if name.is_empty() || name.chars().all(|c| c == '.') {
        return None;
    }
    Some(name.to_string())
}

/// Maps `https://pixeldrain.com/u/<id>` to its direct download endpoint.
pub fn pixeldrain_url(locator: &str) -> Result<String, AdapterError> {
    let url = url::Url::parse(locator).map_err(|e| AdapterError::Locator(format!("{locator}: {e}")))?;
    let id = url
        .path_segments()
        .and_then(|segments| segments.filter(|s| !s.is_empty()).last())
        .ok_or_else(|| AdapterError::Locator(locator.to_string()))?;
    Ok(format!("https://pixeldrain.com/api/file/{id}?download"))
}

/// A resumable single-stream download into a directory.
///
/// Bytes go to a hidden part file keyed by the job, which is renamed once
/// every expected byte has arrived. Pausing keeps the part file so a later
/// resume continues with a `Range` request.
pub struct HttpTransfer {
    client: Client,
    url: String,
    directory: PathBuf,
    ctx: TransferContext,
    settings: HttpSettings,
    worker: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl HttpTransfer {
    pub fn new(
        client: Client,
        url: impl Into<String>,
        directory: impl Into<PathBuf>,
        ctx: TransferContext,
        settings: HttpSettings,
    ) -> Self {
        Self {
            client,
            url: url.into(),
            directory: directory.into(),
            ctx,
            settings,
            worker: Mutex::new(None),
        }
    }

    pub fn temporary_path(&self) -> PathBuf {
        part_path(&self.directory, &self.ctx.game_id)
    }

    /// Stops the worker and waits for it to flush.
    async fn stop(&self) {
        let running = self.worker.lock().await.take();
        if let Some((token, handle)) = running {
            token.cancel();
            let _ = handle.await;
        }
    }
}

pub fn part_path(directory: &Path, game_id: &str) -> PathBuf {
    directory.join(format!(".{game_id}.gamedl-part"))
}

#[async_trait]
impl Transfer for HttpTransfer {
    async fn start(&self) -> Result<(), AdapterError> {
        let mut worker = self.worker.lock().await;
        if worker.as_ref().is_some_and(|(_, handle)| !handle.is_finished()) {
            return Ok(());
        }
        let token = CancellationToken::new();
        let job = DownloadJob {
            client: self.client.clone(),
            url: self.url.clone(),
            directory: self.directory.clone(),
            ctx: self.ctx.clone(),
            settings: self.settings.clone(),
            token: token.clone(),
        };
        let handle = tokio::spawn(job.run());
        *worker = Some((token, handle));
        Ok(())
    }

    async fn pause(&self) -> Result<(), AdapterError> {
        self.stop().await;
        Ok(())
    }

    async fn resume(&self) -> Result<(), AdapterError> {
        self.start().await
    }

    async fn cancel(&self) -> Result<(), AdapterError> {
        self.stop().await;
        match tokio::fs::remove_file(self.temporary_path()).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DownloadError::Io(e).into()),
        }
    }
}

/// Everything one worker task needs.
struct DownloadJob {
    client: Client,
    url: String,
    directory: PathBuf,
    ctx: TransferContext,
    settings: HttpSettings,
    token: CancellationToken,
}

impl DownloadJob {
    async fn run(self) {
        let mut attempts = 0;
        loop {
            match self.download_once().await {
                Ok(path) => {
                    info!(game_id = %self.ctx.game_id, path = %path.display(), "download complete");
                    return;
                }
                Err(DownloadError::Paused) => {
                    debug!(game_id = %self.ctx.game_id, "download paused");
                    return;
                }
                Err(e) if e.is_transient() && attempts < self.settings.retries => {
                    attempts += 1;
                    warn!(game_id = %self.ctx.game_id, error = %e, attempt = attempts, "retrying download");
                    let delay = Duration::from_millis(500 * (1 << attempts.min(6)) as u64);
                    tokio::select! {
                        _ = self.token.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    warn!(game_id = %self.ctx.game_id, error = %e, "download failed");
                    self.ctx.failed(e.to_string(), e.is_transient());
                    return;
                }
            }
        }
    }

    /// One attempt from whatever is already in the part file.
    async fn download_once(&self) -> Result<PathBuf, DownloadError> {
        tokio::fs::create_dir_all(&self.directory).await?;
        let part = part_path(&self.directory, &self.ctx.game_id);
        let existing = match tokio::fs::metadata(&part).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };

        let mut request = self.client.get(&self.url);
        if existing > 0 {
            request = request.header(RANGE, format!("bytes={existing}-"));
        }
        let response = tokio::select! {
            _ = self.token.cancelled() => return Err(DownloadError::Paused),
            response = request.send() => response?,
        };

        let status = response.status();
        if status == StatusCode::RANGE_NOT_SATISFIABLE && existing > 0 {
            // The part file no longer matches the remote; start over.
            tokio::fs::remove_file(&part).await?;
            return Err(DownloadError::RangeRejected(existing));
        }
        if !status.is_success() {
            return Err(DownloadError::Status(status.as_u16()));
        }

        let resumed = status == StatusCode::PARTIAL_CONTENT;
        let mut received = if resumed { existing } else { 0 };
        let expected = response
            .content_length()
            .filter(|len| *len > 0)
            .map(|len| len + received);
        let name = file_name_from_disposition(&response).unwrap_or_else(|| file_name_from_url(&self.url));

        let mut file = if resumed {
            OpenOptions::new().append(true).open(&part).await?
        } else {
            File::create(&part).await?
        };

        let mut meter = SpeedMeter::new();
        self.report(&name, received, expected, 0);
        let mut last_report = Instant::now();

        let mut stream = response.bytes_stream();
        loop {
            let next = tokio::select! {
                _ = self.token.cancelled() => {
                    file.flush().await?;
                    return Err(DownloadError::Paused);
                }
                next = tokio::time::timeout(self.settings.timeout, stream.next()) => {
                    next.map_err(|_| DownloadError::Stalled(self.settings.timeout))?
                }
            };
            let Some(chunk) = next else { break };
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    file.flush().await?;
                    return Err(match expected {
                        Some(expected) if received < expected => {
                            debug!(error = %e, "body ended early");
                            DownloadError::Truncated { received, expected }
                        }
                        _ => e.into(),
                    });
                }
            };
            file.write_all(&chunk).await?;
            received += chunk.len() as u64;
            meter.add(chunk.len() as u64);

            if last_report.elapsed() >= self.settings.progress_interval {
                self.report(&name, received, expected, meter.rate());
                last_report = Instant::now();
            }
        }
        file.flush().await?;
        drop(file);

        if let Some(expected) = expected {
            if received < expected {
                return Err(DownloadError::Truncated { received, expected });
            }
        }

        let destination = self.directory.join(&name);
        if tokio::fs::metadata(&destination).await.is_ok() {
            tokio::fs::remove_file(&destination).await?;
        }
        tokio::fs::rename(&part, &destination).await?;

        self.ctx.telemetry(Telemetry {
            state: TransferState::Finished,
            progress: 1.0,
            bytes_downloaded: received,
            file_size: Some(received).filter(|n| *n > 0),
            folder_name: Some(name),
            artifact: Some(destination.clone()),
            ..Telemetry::default()
        });
        Ok(destination)
    }

    fn report(&self, name: &str, received: u64, expected: Option<u64>, speed: u64) {
        // An unknown total reports zero progress rather than dividing by it.
        let progress = expected.map(|total| received as f64 / total as f64).unwrap_or(0.0);
        self.ctx.telemetry(Telemetry {
            state: TransferState::Downloading,
            progress,
            bytes_downloaded: received,
            file_size: expected,
            download_speed: speed,
            folder_name: Some(name.to_string()),
            ..Telemetry::default()
        });
    }
}

/// Bytes per second over a sliding window.
struct SpeedMeter {
    window_start: Instant,
    window_bytes: u64,
    rate: u64,
}

impl SpeedMeter {
    const WINDOW: Duration = Duration::from_secs(1);

    fn new() -> Self {
        Self { window_start: Instant::now(), window_bytes: 0, rate: 0 }
    }

    fn add(&mut self, bytes: u64) {
        self.window_bytes += bytes;
        let elapsed = self.window_start.elapsed();
        if elapsed >= Self::WINDOW {
            self.rate = (self.window_bytes as f64 / elapsed.as_secs_f64()) as u64;
            self.window_start = Instant::now();
            self.window_bytes = 0;
        }
    }

    fn rate(&self) -> u64 {
        self.rate
    }
}

/// Backend for direct URLs (`GenericHttp`) and PixelDrain links.
pub struct HttpBackend {
    client: Client,
    settings: HttpSettings,
    kind: DownloaderKind,
}

impl HttpBackend {
    pub fn new(client: Client, settings: HttpSettings, kind: DownloaderKind) -> Self {
        Self { client, settings, kind }
    }

    fn resolve(&self, uri: &str) -> Result<String, AdapterError> {
        match self.kind {
            DownloaderKind::PixelDrain => pixeldrain_url(uri),
            _ => url::Url::parse(uri)
                .map(|_| uri.to_string())
                .map_err(|_| DownloadError::InvalidUrl(uri.to_string()).into()),
        }
    }
}

#[async_trait]
impl Backend for HttpBackend {
    async fn open(&self, job: &Job, ctx: TransferContext) -> Result<Arc<dyn Transfer>, AdapterError> {
        let url = self.resolve(&job.uri)?;
        Ok(Arc::new(HttpTransfer::new(
            self.client.clone(),
            url,
            job.download_path.clone(),
            ctx,
            self.settings.clone(),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_name_is_decoded_from_url() {
        assert_eq!(file_name_from_url("https://host/files/My%20Game.rar?x=1"), "My Game.rar");
        assert_eq!(file_name_from_url("https://host/"), "download");
        assert_eq!(file_name_from_url("not a url"), "download");
        assert_eq!(file_name_from_url("https://host/files/%2E%2E"), "download");
    }

    #[test]
    fn disposition_names_cannot_escape_the_directory() {
        assert_eq!(disposition_file_name(r#"attachment; filename="Game.rar""#).as_deref(), Some("Game.rar"));
        assert_eq!(disposition_file_name(r#"attachment; filename="../x.rar""#).as_deref(), Some(".._x.rar"));
        assert_eq!(disposition_file_name(r#"attachment; filename="..""#), None);
        assert_eq!(disposition_file_name("attachment; filename=."), None);
        assert_eq!(disposition_file_name("attachment"), None);
    }

    #[test]
    fn pixeldrain_links_map_to_api() {
        assert_eq!(
            pixeldrain_url("https://pixeldrain.com/u/abc123").unwrap(),
            "https://pixeldrain.com/api/file/abc123?download"
        );
        assert!(pixeldrain_url("pixeldrain").is_err());
    }

    #[test]
    fn truncation_is_retried_but_client_errors_are_not() {
        assert!(DownloadError::Truncated { received: 1, expected: 2 }.is_transient());
        assert!(DownloadError::Status(503).is_transient());
        assert!(!DownloadError::Status(404).is_transient());
        assert!(!DownloadError::Paused.is_transient());
    }

    #[test]
    fn part_file_is_hidden_and_per_job() {
        let path = part_path(Path::new("/games"), "steam-1");
        assert_eq!(path, PathBuf::from("/games/.steam-1.gamedl-part"));
    }
}
