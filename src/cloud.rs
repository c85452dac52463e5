// src/cloud.rs

//! Cloud unrestriction: turns a magnet or hoster link into a direct URL
//! through a third-party provider, then hands the bytes to [`HttpTransfer`].

use crate::adapter::{AdapterError, Backend, Transfer, TransferContext};
use crate::config::CloudConfig;
use crate::downloader::{HttpSettings, HttpTransfer};
use crate::models::Job;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum CloudError {
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("provider responded with HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("rate limited by provider")]
    RateLimited,
    #[error("content is not cached by the provider")]
    NotCached,
    #[error("provider reported the transfer as {0}")]
    Terminal(String),
    #[error("invalid locator: {0}")]
    InvalidLocator(String),
    #[error("unexpected provider response: {0}")]
    Protocol(String),
    #[error("resolution cancelled")]
    Cancelled,
}

impl CloudError {
    /// Failures a single request may be retried for.
    pub fn is_transient(&self) -> bool {
        match self {
            CloudError::Network(_) | CloudError::RateLimited => true,
            CloudError::Http { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Failures that leave the job worth trying again later.
    pub fn is_retryable(&self) -> bool {
        self.is_transient() || matches!(self, CloudError::NotCached)
    }
}

/// Capped exponential backoff for provider requests.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &CloudConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
        }
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Runs `op` until it succeeds or fails for good. Cancellation interrupts
    /// both the request in flight and the backoff.
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> Result<T, CloudError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CloudError>>,
    {
        let mut attempt = 0;
        loop {
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(CloudError::Cancelled),
                result = op() => result,
            };
            match result {
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    let delay = self.delay(attempt);
                    attempt += 1;
                    warn!(error = %e, attempt, ?delay, "provider request failed; backing off");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(CloudError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                result => return result,
            }
        }
    }
}

/// Provider-side state of a remote transfer.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteState {
    AwaitingSelection,
    InProgress,
    Ready,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteJob {
    pub id: String,
    /// Lowercase hex info hash.
    pub hash: String,
    pub name: Option<String>,
    pub state: RemoteState,
    pub progress: f64,
    pub links: Vec<String>,
}

/// The REST surface every unrestriction provider offers.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    fn name(&self) -> &'static str;

    async fn list_jobs(&self) -> Result<Vec<RemoteJob>, CloudError>;

    /// Submits a magnet and returns the provider-side id.
    async fn add_locator(&self, magnet: &str) -> Result<String, CloudError>;

    async fn get_info(&self, id: &str) -> Result<RemoteJob, CloudError>;

    async fn select_all_files(&self, id: &str) -> Result<(), CloudError>;

    /// Direct URL for a ready remote job.
    async fn unrestrict(&self, job: &RemoteJob) -> Result<String, CloudError>;

    /// Direct URL for a hoster link.
    async fn unrestrict_link(&self, link: &str) -> Result<String, CloudError>;
}

pub fn is_magnet(locator: &str) -> bool {
    locator.trim_start().to_ascii_lowercase().starts_with("magnet:")
}

/// Extracts the BitTorrent info hash of a magnet as lowercase hex.
pub fn magnet_info_hash(magnet: &str) -> Result<String, CloudError> {
    let url = url::Url::parse(magnet).map_err(|e| CloudError::InvalidLocator(e.to_string()))?;
    if url.scheme() != "magnet" {
        return Err(CloudError::InvalidLocator(format!("not a magnet link: {magnet}")));
    }
    let topic = url
        .query_pairs()
        .filter(|(key, _)| key == "xt")
        .find_map(|(_, value)| {
            let value = value.to_string();
            value
                .strip_prefix("urn:btih:")
                .or_else(|| value.strip_prefix("urn:BTIH:"))
                .map(str::to_owned)
        })
        .ok_or_else(|| CloudError::InvalidLocator("magnet has no btih topic".into()))?;

    match topic.len() {
        40 if topic.chars().all(|c| c.is_ascii_hexdigit()) => Ok(topic.to_ascii_lowercase()),
        32 => base32_decode(&topic)
            .map(hex::encode)
            .ok_or_else(|| CloudError::InvalidLocator(format!("bad base32 info hash {topic}"))),
        _ => Err(CloudError::InvalidLocator(format!("bad info hash {topic}"))),
    }
}

/// RFC 4648 base32 without padding.
fn base32_decode(input: &str) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(input.len() * 5 / 8);
    let mut buffer: u64 = 0;
    let mut bits = 0;
    for c in input.chars() {
        let value = match c.to_ascii_uppercase() {
            c @ 'A'..='Z' => c as u64 - 'A' as u64,
            c @ '2'..='7' => c as u64 - '2' as u64 + 26,
            _ => return None,
        };
        buffer = (buffer << 5) | value;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push((buffer >> bits) as u8);
            buffer &= (1 << bits) - 1;
        }
    }
    Some(out)
}

async fn send_json<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, CloudError> {
    let response = checked(request).await?;
    Ok(response.json().await?)
}

async fn checked(request: RequestBuilder) -> Result<reqwest::Response, CloudError> {
    let response = request.send().await?;
    let status = response.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(CloudError::RateLimited);
    }
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(CloudError::Http { status: status.as_u16(), body });
    }
    Ok(response)
}

/// Real-Debrid REST client.
pub struct RealDebridClient {
    http: Client,
    base_url: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct RdAddMagnet {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RdTorrent {
    id: String,
    #[serde(default)]
    filename: Option<String>,
    #[serde(default)]
    hash: String,
    status: String,
    #[serde(default)]
    progress: f64,
    #[serde(default)]
    links: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RdUnrestrictLink {
    download: String,
}

impl RdTorrent {
    fn into_remote(self) -> RemoteJob {
        let state = match self.status.as_str() {
            "waiting_files_selection" => RemoteState::AwaitingSelection,
            "downloaded" => RemoteState::Ready,
            "error" | "dead" | "virus" | "magnet_error" => RemoteState::Failed(self.status.clone()),
            _ => RemoteState::InProgress,
        };
        RemoteJob {
            id: self.id,
            hash: self.hash.to_ascii_lowercase(),
            name: self.filename,
            state,
            progress: self.progress / 100.0,
            links: self.links,
        }
    }
}

impl RealDebridClient {
    pub fn new(http: Client, base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.http.get(format!("{}{}", self.base_url, path)).bearer_auth(&self.token)
    }

    fn post(&self, path: &str) -> RequestBuilder {
        self.http.post(format!("{}{}", self.base_url, path)).bearer_auth(&self.token)
    }
}

#[async_trait]
impl CloudProvider for RealDebridClient {
    fn name(&self) -> &'static str {
        "real-debrid"
    }

    async fn list_jobs(&self) -> Result<Vec<RemoteJob>, CloudError> {
        let torrents: Vec<RdTorrent> = send_json(self.get("/torrents")).await?;
        Ok(torrents.into_iter().map(RdTorrent::into_remote).collect())
    }

    async fn add_locator(&self, magnet: &str) -> Result<String, CloudError> {
        let added: RdAddMagnet =
            send_json(self.post("/torrents/addMagnet").form(&[("magnet", magnet)])).await?;
        Ok(added.id)
    }

    async fn get_info(&self, id: &str) -> Result<RemoteJob, CloudError> {
        let torrent: RdTorrent = send_json(self.get(&format!("/torrents/info/{id}"))).await?;
        Ok(torrent.into_remote())
    }

    async fn select_all_files(&self, id: &str) -> Result<(), CloudError> {
        checked(self.post(&format!("/torrents/selectFiles/{id}")).form(&[("files", "all")])).await?;
        Ok(())
    }

    async fn unrestrict(&self, job: &RemoteJob) -> Result<String, CloudError> {
        let link = job
            .links
            .first()
            .ok_or_else(|| CloudError::Protocol(format!("torrent {} has no links", job.id)))?;
        self.unrestrict_link(link).await
    }

    async fn unrestrict_link(&self, link: &str) -> Result<String, CloudError> {
        let unrestricted: RdUnrestrictLink =
            send_json(self.post("/unrestrict/link").form(&[("link", link)])).await?;
        Ok(urlencoding::decode(&unrestricted.download)
            .map(|url| url.into_owned())
            .unwrap_or(unrestricted.download))
    }
}

/// TorBox REST client.
pub struct TorBoxClient {
    http: Client,
    base_url: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct TbEnvelope<T> {
    success: bool,
    #[serde(default)]
    detail: Option<String>,
    data: Option<T>,
}

impl<T> TbEnvelope<T> {
    fn into_data(self) -> Result<T, CloudError> {
        if !self.success {
            return Err(CloudError::Protocol(self.detail.unwrap_or_else(|| "request failed".into())));
        }
        self.data.ok_or_else(|| CloudError::Protocol("response has no data".into()))
    }
}

#[derive(Debug, Deserialize)]
struct TbCreated {
    torrent_id: u64,
}

#[derive(Debug, Deserialize)]
struct TbTorrent {
    id: u64,
    #[serde(default)]
    hash: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    download_state: String,
    #[serde(default)]
    download_finished: bool,
    #[serde(default)]
    progress: f64,
}

impl TbTorrent {
    fn into_remote(self) -> RemoteJob {
        let state = match self.download_state.as_str() {
            "completed" | "cached" => RemoteState::Ready,
            _ if self.download_finished => RemoteState::Ready,
            s if s.starts_with("error") || matches!(s, "dead" | "virus" | "magnet_error") => {
                RemoteState::Failed(self.download_state.clone())
            }
            _ => RemoteState::InProgress,
        };
        RemoteJob {
            id: self.id.to_string(),
            hash: self.hash.to_ascii_lowercase(),
            name: self.name,
            state,
            progress: self.progress,
            links: Vec::new(),
        }
    }
}

impl TorBoxClient {
    pub fn new(http: Client, base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.http.get(format!("{}{}", self.base_url, path)).bearer_auth(&self.token)
    }
}

#[async_trait]
impl CloudProvider for TorBoxClient {
    fn name(&self) -> &'static str {
        "torbox"
    }

    async fn list_jobs(&self) -> Result<Vec<RemoteJob>, CloudError> {
        let envelope: TbEnvelope<Vec<TbTorrent>> = send_json(self.get("/torrents/mylist")).await?;
        Ok(envelope.into_data()?.into_iter().map(TbTorrent::into_remote).collect())
    }

    async fn add_locator(&self, magnet: &str) -> Result<String, CloudError> {
        let form = reqwest::multipart::Form::new().text("magnet", magnet.to_string());
        let request = self
            .http
            .post(format!("{}/torrents/createtorrent", self.base_url))
            .bearer_auth(&self.token)
            .multipart(form);
        let envelope: TbEnvelope<TbCreated> = send_json(request).await?;
        Ok(envelope.into_data()?.torrent_id.to_string())
    }

    async fn get_info(&self, id: &str) -> Result<RemoteJob, CloudError> {
        self.list_jobs()
            .await?
            .into_iter()
            .find(|job| job.id == id)
            .ok_or_else(|| CloudError::Protocol(format!("torrent {id} is not in the account")))
    }

    async fn select_all_files(&self, _id: &str) -> Result<(), CloudError> {
        // TorBox always fetches every file.
        Ok(())
    }

    async fn unrestrict(&self, job: &RemoteJob) -> Result<String, CloudError> {
        let request = self.get("/torrents/requestdl").query(&[
            ("token", self.token.as_str()),
            ("torrent_id", job.id.as_str()),
            ("zip_link", "true"),
        ]);
        let envelope: TbEnvelope<String> = send_json(request).await?;
        envelope.into_data()
    }

    async fn unrestrict_link(&self, link: &str) -> Result<String, CloudError> {
        Err(CloudError::InvalidLocator(format!("torbox cannot unrestrict {link}")))
    }
}

/// Drives one provider through the add/select/poll/unrestrict sequence.
pub struct Resolver {
    provider: Arc<dyn CloudProvider>,
    retry: RetryPolicy,
    poll_interval: Duration,
    poll_attempts: u32,
    /// Provider-side ids already known for a locator.
    handles: Mutex<HashMap<String, String>>,
}

impl Resolver {
    pub fn new(provider: Arc<dyn CloudProvider>, config: &CloudConfig) -> Self {
        Self {
            provider,
            retry: RetryPolicy::from_config(config),
            poll_interval: config.poll_interval(),
            poll_attempts: config.poll_attempts.max(1),
            handles: Mutex::new(HashMap::new()),
        }
    }

    pub async fn resolve(&self, locator: &str, cancel: &CancellationToken) -> Result<String, CloudError> {
        let provider = &self.provider;
        if !is_magnet(locator) {
            return self.retry.run(cancel, move || provider.unrestrict_link(locator)).await;
        }

        let id = self.remote_id(locator, cancel).await?;
        let id = id.as_str();
        for attempt in 0..self.poll_attempts {
            let info = self.retry.run(cancel, move || provider.get_info(id)).await?;
            debug!(provider = provider.name(), id, state = ?info.state, attempt, "polled remote job");
            match &info.state {
                RemoteState::AwaitingSelection => {
                    self.retry.run(cancel, move || provider.select_all_files(id)).await?;
                    continue;
                }
                RemoteState::Ready => {
                    let info = &info;
                    let url = self.retry.run(cancel, move || provider.unrestrict(info)).await?;
                    info!(provider = provider.name(), id, "locator resolved");
                    return Ok(url);
                }
                RemoteState::Failed(reason) => {
                    self.handles.lock().await.remove(locator);
                    return Err(CloudError::Terminal(reason.clone()));
                }
                RemoteState::InProgress => {
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(CloudError::Cancelled),
                        _ = tokio::time::sleep(self.poll_interval) => {}
                    }
                }
            }
        }
        Err(CloudError::NotCached)
    }

    async fn remote_id(&self, magnet: &str, cancel: &CancellationToken) -> Result<String, CloudError> {
        if let Some(id) = self.handles.lock().await.get(magnet) {
            return Ok(id.clone());
        }
        let hash = magnet_info_hash(magnet)?;
        let provider = &self.provider;
        let existing = self.retry.run(cancel, move || provider.list_jobs()).await?;
        let id = match existing.into_iter().find(|job| job.hash == hash) {
            Some(job) => job.id,
            None => self.retry.run(cancel, move || provider.add_locator(magnet)).await?,
        };
        self.handles.lock().await.insert(magnet.to_string(), id.clone());
        Ok(id)
    }
}

/// Backend for `RealDebrid` and `TorBox` jobs.
pub struct CloudBackend {
    resolver: Arc<Resolver>,
    client: Client,
    settings: HttpSettings,
}

impl CloudBackend {
    pub fn new(resolver: Arc<Resolver>, client: Client, settings: HttpSettings) -> Self {
        Self { resolver, client, settings }
    }
}

#[async_trait]
impl Backend for CloudBackend {
    async fn open(&self, job: &Job, ctx: TransferContext) -> Result<Arc<dyn Transfer>, AdapterError> {
        Ok(Arc::new(CloudTransfer {
            resolver: self.resolver.clone(),
            client: self.client.clone(),
            settings: self.settings.clone(),
            locator: job.uri.clone(),
            directory: job.download_path.clone(),
            ctx,
            state: Arc::new(Mutex::new(CloudState::default())),
        }))
    }
}

#[derive(Default)]
struct CloudState {
    resolving: Option<CancellationToken>,
    http: Option<Arc<HttpTransfer>>,
}

/// Resolves the locator, then delegates to an [`HttpTransfer`] that reports
/// under the same job and generation.
pub struct CloudTransfer {
    resolver: Arc<Resolver>,
    client: Client,
    settings: HttpSettings,
    locator: String,
    directory: PathBuf,
    ctx: TransferContext,
    state: Arc<Mutex<CloudState>>,
}

#[async_trait]
impl Transfer for CloudTransfer {
    async fn start(&self) -> Result<(), AdapterError> {
        let mut state = self.state.lock().await;
        if let Some(http) = state.http.clone() {
            drop(state);
            return http.start().await;
        }
        if state.resolving.is_some() {
            return Ok(());
        }
        let token = CancellationToken::new();
        state.resolving = Some(token.clone());
        drop(state);

        let resolver = self.resolver.clone();
        let locator = self.locator.clone();
        let ctx = self.ctx.clone();
        let shared = self.state.clone();
        let client = self.client.clone();
        let settings = self.settings.clone();
        let directory = self.directory.clone();
        tokio::spawn(async move {
            let resolved = resolver.resolve(&locator, &token).await;
            let mut state = shared.lock().await;
            // Paused or cancelled while the provider was answering.
            if token.is_cancelled() {
                debug!(game_id = %ctx.game_id, "dropping resolution of a stopped transfer");
                return;
            }
            state.resolving = None;
            match resolved {
                Ok(url) => {
                    let http = Arc::new(HttpTransfer::new(client, url, directory, ctx.clone(), settings));
                    state.http = Some(http.clone());
                    drop(state);
                    if let Err(e) = http.start().await {
                        ctx.failed(e.to_string(), true);
                    }
                }
                Err(CloudError::Cancelled) => {}
                Err(e) => {
                    warn!(game_id = %ctx.game_id, error = %e, "cloud resolution failed");
                    ctx.failed(e.to_string(), e.is_retryable());
                }
            }
        });
        Ok(())
    }

    async fn pause(&self) -> Result<(), AdapterError> {
        let mut state = self.state.lock().await;
        if let Some(token) = state.resolving.take() {
            token.cancel();
        }
        let http = state.http.clone();
        drop(state);
        if let Some(http) = http {
            http.pause().await?;
        }
        Ok(())
    }

    async fn resume(&self) -> Result<(), AdapterError> {
        self.start().await
    }

    async fn cancel(&self) -> Result<(), AdapterError> {
        let mut state = self.state.lock().await;
        if let Some(token) = state.resolving.take() {
            token.cancel();
        }
        let http = state.http.take();
        drop(state);
        if let Some(http) = http {
            http.cancel().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_info_hash_is_lowercased() {
        let magnet = "magnet:?xt=urn:btih:C12FE1C06BBA254A9DC9F519B335AA7C1367A88A&dn=Game";
        assert_eq!(magnet_info_hash(magnet).unwrap(), "c12fe1c06bba254a9dc9f519b335aa7c1367a88a");
    }

    #[test]
    fn base32_info_hash_is_converted_to_hex() {
        // 20 zero bytes in base32.
        let magnet = "magnet:?xt=urn:btih:AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";
        assert_eq!(magnet_info_hash(magnet).unwrap(), "0".repeat(40));
    }

    #[test]
    fn non_magnets_are_rejected() {
        assert!(magnet_info_hash("https://example.com/file.rar").is_err());
        assert!(magnet_info_hash("magnet:?dn=nothing").is_err());
        assert!(is_magnet("magnet:?xt=urn:btih:abc"));
        assert!(!is_magnet("https://example.com"));
    }

    #[test]
    fn backoff_is_capped() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
        };
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(3), Duration::from_millis(800));
        assert_eq!(policy.delay(4), Duration::from_millis(1000));
        assert_eq!(policy.delay(40), Duration::from_millis(1000));
    }

    #[test]
    fn error_classification() {
        assert!(CloudError::RateLimited.is_retryable());
        assert!(CloudError::NotCached.is_retryable());
        assert!(!CloudError::NotCached.is_transient());
        assert!(CloudError::Http { status: 503, body: String::new() }.is_transient());
        assert!(!CloudError::Http { status: 401, body: String::new() }.is_retryable());
        assert!(!CloudError::Terminal("dead".into()).is_retryable());
    }

    #[test]
    fn real_debrid_statuses_map_to_remote_states() {
        let torrent = |status: &str| RdTorrent {
            id: "X".into(),
            filename: None,
            hash: "ABC".into(),
            status: status.into(),
            progress: 50.0,
            links: vec![],
        };
        assert_eq!(torrent("waiting_files_selection").into_remote().state, RemoteState::AwaitingSelection);
        assert_eq!(torrent("downloaded").into_remote().state, RemoteState::Ready);
        assert_eq!(torrent("magnet_conversion").into_remote().state, RemoteState::InProgress);
        assert_eq!(torrent("virus").into_remote().state, RemoteState::Failed("virus".into()));
        let remote = torrent("queued").into_remote();
        assert_eq!(remote.hash, "abc");
        assert_eq!(remote.progress, 0.5);
    }

    #[tokio::test]
    async fn retry_policy_gives_up_after_max_retries() {
        let policy = RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        };
        let calls = std::sync::atomic::AtomicU32::new(0);
        let token = CancellationToken::new();
        let result: Result<(), CloudError> = policy
            .run(&token, || {
                calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                async { Err(CloudError::RateLimited) }
            })
            .await;
        assert!(matches!(result, Err(CloudError::RateLimited)));
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 3);
    }
}
