// src/manager.rs

use crate::adapter::{
    coalesce, AdapterError, Backend, EventKind, EventSink, StatusEvent, Telemetry, Transfer, TransferContext,
};
use crate::agent::TorrentBackend;
use crate::cloud::{CloudBackend, CloudProvider, RealDebridClient, Resolver, TorBoxClient};
use crate::config::EngineConfig;
use crate::downloader::{build_client, HttpBackend, HttpSettings};
use crate::extract::{extraction_dir, Extractor, SevenZipExtractor};
use crate::models::{Applied, DownloaderKind, Job, StatusBroadcast};
use crate::queue::DownloadQueue;
use crate::state_manager::{StateError, StateManager};
use crate::status::JobStatus;
use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("state manager error: {0}")]
    State(#[from] StateError),
    #[error("job {0} not found")]
    JobNotFound(String),
    #[error("no backend configured for {0}")]
    NoBackend(DownloaderKind),
    #[error("adapter error: {0}")]
    Adapter(#[from] AdapterError),
    #[error("http client error: {0}")]
    Client(#[from] reqwest::Error),
    #[error("job {game_id} cannot {action} while {status}")]
    InvalidState { game_id: String, action: &'static str, status: JobStatus },
}

pub type Backends = HashMap<DownloaderKind, Arc<dyn Backend>>;

/// The one job allowed to transfer.
struct ActiveSlot {
    game_id: String,
    job: Job,
    /// Events from any other generation are stale.
    generation: u64,
    transfer: Option<Arc<dyn Transfer>>,
    extraction: Option<JoinHandle<()>>,
}

/// A paused adapter instance kept for a later resume.
struct Parked {
    generation: u64,
    transfer: Arc<dyn Transfer>,
    job: Job,
}

/// Owns the active slot, applies adapter events and broadcasts job status.
///
/// All adapter telemetry enters through [`DownloadManager::on_status`], which
/// [`DownloadManager::run`] feeds in arrival order.
pub struct DownloadManager {
    config: EngineConfig,
    store: Arc<StateManager>,
    queue: DownloadQueue,
    backends: Backends,
    extractor: Option<Arc<dyn Extractor>>,
    slot: Mutex<Option<ActiveSlot>>,
    parked: Mutex<HashMap<String, Parked>>,
    generation: AtomicU64,
    events: EventSink,
    inbox: Mutex<Option<mpsc::UnboundedReceiver<StatusEvent>>>,
    broadcast: broadcast::Sender<StatusBroadcast>,
}

impl DownloadManager {
    /// Builds the engine with the backends the configuration enables.
    pub async fn new(config: EngineConfig, state_manager: StateManager) -> Result<Self, ManagerError> {
        let settings = HttpSettings::from(&config.http);
        let client = build_client(&settings)?;

        let mut backends: Backends = HashMap::new();
        backends.insert(DownloaderKind::Torrent, Arc::new(TorrentBackend::from_config(&config.agent)));
        for kind in [DownloaderKind::GenericHttp, DownloaderKind::PixelDrain] {
            backends.insert(kind, Arc::new(HttpBackend::new(client.clone(), settings.clone(), kind)));
        }

        let cloud = &config.cloud;
        let providers: [(DownloaderKind, Option<Arc<dyn CloudProvider>>); 2] = [
            (
                DownloaderKind::RealDebrid,
                cloud.real_debrid_token.as_ref().map(|token| {
                    Arc::new(RealDebridClient::new(client.clone(), cloud.real_debrid_base_url.clone(), token.clone()))
                        as Arc<dyn CloudProvider>
                }),
            ),
            (
                DownloaderKind::TorBox,
                cloud.torbox_token.as_ref().map(|token| {
                    Arc::new(TorBoxClient::new(client.clone(), cloud.torbox_base_url.clone(), token.clone()))
                        as Arc<dyn CloudProvider>
                }),
            ),
        ];
        for (kind, provider) in providers {
            if let Some(provider) = provider {
                let resolver = Arc::new(Resolver::new(provider, cloud));
                backends.insert(kind, Arc::new(CloudBackend::new(resolver, client.clone(), settings.clone())));
            }
        }

        let extractor = config.extraction.enabled.then(|| {
            Arc::new(SevenZipExtractor::new(config.extraction.seven_zip_path.clone())) as Arc<dyn Extractor>
        });
        Self::with_backends(config, state_manager, backends, extractor).await
    }

    /// Builds the engine around caller-supplied backends.
    ///
    /// Jobs left in an active status by a previous run are moved to `Paused`.
    pub async fn with_backends(
        config: EngineConfig,
        state_manager: StateManager,
        backends: Backends,
        extractor: Option<Arc<dyn Extractor>>,
    ) -> Result<Self, ManagerError> {
        let store = Arc::new(state_manager);
        for mut job in store.load_all_jobs().await? {
            if job.status.is_active() {
                info!(game_id = %job.game_id(), status = %job.status, "recovering interrupted job as paused");
                job.status = JobStatus::Paused;
                store.save_job(&job).await?;
            }
        }
        let queue = DownloadQueue::load(store.clone()).await?;
        let (events, inbox) = mpsc::unbounded_channel();
        let (broadcast, _) = broadcast::channel(config.broadcast_capacity.max(1));

        Ok(Self {
            config,
            store,
            queue,
            backends,
            extractor,
            slot: Mutex::new(None),
            parked: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(0),
            events,
            inbox: Mutex::new(Some(inbox)),
            broadcast,
        })
    }

    /// Status payloads for the presentation layer.
    pub fn subscribe(&self) -> broadcast::Receiver<StatusBroadcast> {
        self.broadcast.subscribe()
    }

    pub async fn list_jobs(&self) -> Result<Vec<Job>, ManagerError> {
        let jobs = self.store.load_all_jobs().await?;
        Ok(jobs.into_iter().filter(|job| !job.is_deleted).collect())
    }

    pub async fn get_job(&self, game_id: &str) -> Result<Option<Job>, ManagerError> {
        Ok(self.store.get_job_by_game_id(game_id).await?)
    }

    /// The job holding the active slot, if any.
    pub async fn active_job(&self) -> Option<Job> {
        self.slot.lock().await.as_ref().map(|active| active.job.clone())
    }

    pub async fn queued(&self) -> Vec<String> {
        self.queue.snapshot().await
    }

    /// Applies adapter events until the engine is dropped. Bursts that pile up
    /// while a write is in flight are coalesced first.
    pub async fn run(self: Arc<Self>) {
        let Some(mut inbox) = self.inbox.lock().await.take() else {
            warn!("event loop is already running");
            return;
        };
        self.promote_next().await;

        while let Some(first) = inbox.recv().await {
            let mut burst = vec![first];
            while let Ok(event) = inbox.try_recv() {
                burst.push(event);
            }
            for event in coalesce(burst) {
                self.on_status(event).await;
            }
        }
    }

    /// Single ingress for adapter telemetry.
    pub async fn on_status(&self, event: StatusEvent) {
        let released = {
            let mut slot = self.slot.lock().await;
            self.apply(&mut slot, event).await
        };
        if released {
            self.promote_next().await;
        }
    }

    /// Returns true when the event released the active slot.
    async fn apply(&self, slot: &mut Option<ActiveSlot>, event: StatusEvent) -> bool {
        let Some(active) = slot.as_mut() else {
            debug!(game_id = %event.game_id, "dropping event: no active job");
            return false;
        };
        if active.game_id != event.game_id || active.generation != event.generation {
            debug!(game_id = %event.game_id, generation = event.generation, "dropping stale event");
            return false;
        }

        match event.kind {
            EventKind::Transfer(sample) => match active.job.apply_telemetry(&sample) {
                Applied::Rejected => {
                    debug!(game_id = %event.game_id, status = %active.job.status, state = ?sample.state, "rejected telemetry");
                    false
                }
                Applied::Progress => {
                    self.persist(&active.job).await;
                    self.publish(&active.job, Some(&sample));
                    false
                }
                Applied::TransferComplete => {
                    self.persist(&active.job).await;
                    self.publish(&active.job, None);
                    self.complete_transfer(slot).await
                }
            },
            EventKind::Extraction { progress } => {
                if active.job.status != JobStatus::Decompressing {
                    return false;
                }
                let progress = progress.clamp(0.0, 1.0);
                active.job.decompression_progress = active.job.decompression_progress.max(progress);
                self.persist(&active.job).await;
                self.publish(&active.job, None);
                false
            }
            EventKind::ExtractionDone => {
                if active.job.status != JobStatus::Decompressing {
                    return false;
                }
                active.job.decompression_progress = 1.0;
                let extracted = active.job.rar_path.as_deref().map(extraction_dir);
                if let Some(name) = extracted.as_deref().and_then(|dir| dir.file_name()) {
                    active.job.folder_name = Some(name.to_string_lossy().into_owned());
                }
                self.finish(slot).await;
                true
            }
            EventKind::Failed { reason, retryable } => {
                warn!(game_id = %event.game_id, %reason, retryable, "transfer failed; pausing job");
                self.interrupt(slot, true).await;
                true
            }
            EventKind::Exited => {
                warn!(game_id = %event.game_id, "adapter exited without a terminal status; pausing job");
                self.interrupt(slot, false).await;
                true
            }
        }
    }

    /// Every byte is on disk: extract if needed, otherwise finish.
    async fn complete_transfer(&self, slot: &mut Option<ActiveSlot>) -> bool {
        let Some(active) = slot.as_mut() else {
            return false;
        };
        if let (Some(archive), Some(extractor)) = (active.job.rar_path.clone(), self.extractor.clone()) {
            active.job.status = JobStatus::Decompressing;
            active.job.decompression_progress = 0.0;
            self.persist(&active.job).await;
            self.publish(&active.job, None);
            let ctx = TransferContext::new(active.game_id.clone(), active.generation, self.events.clone());
            active.extraction = Some(spawn_extraction(extractor, archive, ctx));
            return false;
        }
        self.finish(slot).await;
        true
    }

    async fn finish(&self, slot: &mut Option<ActiveSlot>) {
        let Some(mut active) = slot.take() else {
            return;
        };
        let job = &mut active.job;
        job.status = JobStatus::Finished;
        job.progress = 1.0;
        self.persist(job).await;
        self.publish(job, None);
        info!(game_id = %active.game_id, "download finished");

        if !job.downloader.is_torrent() {
            return;
        }
        if job.should_seed {
            job.status = JobStatus::Seeding;
            self.persist(job).await;
            self.publish(job, None);
            info!(game_id = %active.game_id, "seeding");
        } else if let Some(transfer) = active.transfer {
            // The agent keeps seeding a finished torrent until told otherwise.
            let game_id = active.game_id;
            tokio::spawn(async move {
                if let Err(e) = transfer.pause().await {
                    debug!(%game_id, error = %e, "could not stop seeding");
                }
            });
        }
    }

    /// The adapter gave up or vanished: leave the job resumable.
    async fn interrupt(&self, slot: &mut Option<ActiveSlot>, keep_transfer: bool) {
        let Some(mut active) = slot.take() else {
            return;
        };
        if let Some(handle) = active.extraction.take() {
            handle.abort();
        }
        if active.job.status.can_transition(JobStatus::Paused) {
            active.job.status = JobStatus::Paused;
        }
        self.persist(&active.job).await;
        self.publish(&active.job, None);
        if let (true, Some(transfer)) = (keep_transfer, active.transfer) {
            self.parked.lock().await.insert(
                active.game_id,
                Parked { generation: active.generation, transfer, job: active.job },
            );
        }
    }

    /// Starts `job`, pausing whatever holds the active slot unless it is
    /// already finishing, in which case `job` waits in the queue.
    pub async fn start_download(&self, job: Job) -> Result<(), ManagerError> {
        let backend = self.backend(job.downloader)?;
        backend.preflight()?;

        let mut record = match self.store.get_job(&job.shop, &job.object_id).await? {
            Some(stored)
                if stored.same_intent(&job)
                    && !stored.is_deleted
                    && !matches!(stored.status, JobStatus::Cancelled | JobStatus::Finished | JobStatus::Seeding) =>
            {
                stored
            }
            // A completed or cancelled record starts over from zero.
            _ => job,
        };
        if record.downloader.is_torrent() && self.config.seed_after_download {
            record.should_seed = true;
        }
        self.activate(record, backend, true).await
    }

    /// Pauses the job holding the active slot. Extraction cannot be paused.
    pub async fn pause_download(&self) -> Result<(), ManagerError> {
        {
            let mut slot = self.slot.lock().await;
            match slot.as_ref() {
                None => return Ok(()),
                Some(active) if active.job.status == JobStatus::Decompressing => {
                    info!(game_id = %active.game_id, "refusing to pause while decompressing");
                    return Ok(());
                }
                Some(_) => {}
            }
            if let Some(holder) = slot.take() {
                self.preempt(holder).await;
            }
        }
        self.promote_next().await;
        Ok(())
    }

    /// Resumes a paused job, reusing its parked adapter when it is still usable.
    pub async fn resume_download(&self, game_id: &str) -> Result<(), ManagerError> {
        let job = self
            .store
            .get_job_by_game_id(game_id)
            .await?
            .ok_or_else(|| ManagerError::JobNotFound(game_id.to_string()))?;
        if self.slot.lock().await.as_ref().is_some_and(|active| active.game_id == game_id) {
            return Ok(());
        }
        if job.status != JobStatus::Paused {
            return Err(ManagerError::InvalidState {
                game_id: game_id.to_string(),
                action: "resume",
                status: job.status,
            });
        }
        let backend = self.backend(job.downloader)?;
        backend.preflight()?;
        self.activate(job, backend, true).await
    }

    /// Stops the job wherever it is and zeroes its counters. Idempotent.
    pub async fn cancel_download(&self, game_id: &str) -> Result<(), ManagerError> {
        let mut job = self
            .store
            .get_job_by_game_id(game_id)
            .await?
            .ok_or_else(|| ManagerError::JobNotFound(game_id.to_string()))?;

        let released = {
            let mut slot = self.slot.lock().await;
            let mut released = false;
            if slot.as_ref().is_some_and(|active| active.game_id == game_id) {
                if let Some(active) = slot.take() {
                    job = active.job.clone();
                    self.discard(active).await;
                    released = true;
                }
            }
            let parked = self.parked.lock().await.remove(game_id);
            if let Some(parked) = parked {
                self.bounded("cancel", game_id, parked.transfer.cancel()).await;
            }
            if job.status == JobStatus::Seeding {
                if let Ok(backend) = self.backend(job.downloader) {
                    self.bounded("pause seeding", game_id, backend.pause_seeding(&job)).await;
                }
            }
            self.queue.remove(game_id).await?;

            if job.status != JobStatus::Cancelled {
                job.reset_counters();
                self.store.save_job(&job).await?;
                self.publish(&job, None);
                info!(%game_id, "download cancelled");
            }
            released
        };
        if released {
            self.promote_next().await;
        }
        Ok(())
    }

    /// Stops uploading a seeding torrent.
    pub async fn pause_seeding(&self, game_id: &str) -> Result<(), ManagerError> {
        let mut job = self
            .store
            .get_job_by_game_id(game_id)
            .await?
            .ok_or_else(|| ManagerError::JobNotFound(game_id.to_string()))?;
        if job.status != JobStatus::Seeding {
            return Ok(());
        }
        self.backend(job.downloader)?.pause_seeding(&job).await?;
        job.should_seed = false;
        job.status = JobStatus::Finished;
        self.store.save_job(&job).await?;
        self.publish(&job, None);
        Ok(())
    }

    /// Starts seeding a finished torrent again. Does not take the active slot.
    pub async fn resume_seeding(&self, game_id: &str) -> Result<(), ManagerError> {
        let mut job = self
            .store
            .get_job_by_game_id(game_id)
            .await?
            .ok_or_else(|| ManagerError::JobNotFound(game_id.to_string()))?;
        if job.status == JobStatus::Seeding {
            return Ok(());
        }
        if job.status != JobStatus::Finished || !job.downloader.is_torrent() {
            return Err(ManagerError::InvalidState {
                game_id: game_id.to_string(),
                action: "seed",
                status: job.status,
            });
        }
        self.backend(job.downloader)?.resume_seeding(&job).await?;
        job.should_seed = true;
        job.status = JobStatus::Seeding;
        self.store.save_job(&job).await?;
        self.publish(&job, None);
        Ok(())
    }

    /// Puts `record` into the active slot.
    ///
    /// With `preempt` unset an occupied slot always queues the job instead.
    async fn activate(
        &self,
        mut record: Job,
        backend: Arc<dyn Backend>,
        preempt: bool,
    ) -> Result<(), ManagerError> {
        let game_id = record.game_id();
        let mut slot = self.slot.lock().await;

        if let Some(active) = slot.as_ref() {
            if active.game_id == game_id {
                if active.job.same_intent(&record) {
                    debug!(%game_id, "start coalesced with the in-flight job");
                    return Ok(());
                }
                info!(%game_id, "replacing in-flight intent");
                if let Some(old) = slot.take() {
                    self.discard(old).await;
                }
            } else if !preempt || active.job.progress >= 1.0 {
                if record.status.is_active() {
                    record.status = JobStatus::Paused;
                }
                self.store.save_job(&record).await?;
                self.queue.push(&game_id).await?;
                self.publish(&record, None);
                info!(%game_id, holder = %active.game_id, "active slot busy; job queued");
                return Ok(());
            } else if let Some(holder) = slot.take() {
                self.preempt(holder).await;
            }
        }

        if self.queue.remove(&game_id).await? {
            info!(%game_id, "promoted queued job");
        }

        // Everything is on disk already; only the archive is left to unpack.
        if record.progress >= 1.0 {
            if let (Some(archive), Some(extractor)) = (record.rar_path.clone(), self.extractor.clone()) {
                let generation = self.next_generation();
                record.status = JobStatus::Decompressing;
                record.decompression_progress = 0.0;
                self.store.save_job(&record).await?;
                self.publish(&record, None);
                let ctx = TransferContext::new(game_id.clone(), generation, self.events.clone());
                *slot = Some(ActiveSlot {
                    game_id,
                    job: record,
                    generation,
                    transfer: None,
                    extraction: Some(spawn_extraction(extractor, archive, ctx)),
                });
                return Ok(());
            }
        }

        let parked = self.parked.lock().await.remove(&game_id);
        record.status = record.initial_status();
        self.store.save_job(&record).await?;
        self.publish(&record, None);

        let reused = match parked {
            Some(parked) if parked.job.same_intent(&record) => match parked.transfer.resume().await {
                Ok(()) => Some((parked.generation, parked.transfer)),
                Err(e) => {
                    warn!(%game_id, error = %e, "parked adapter cannot resume; recreating it");
                    None
                }
            },
            Some(parked) => {
                self.bounded("cancel", &game_id, parked.transfer.cancel()).await;
                None
            }
            None => None,
        };

        let (generation, transfer) = match reused {
            Some(reused) => reused,
            None => {
                let generation = self.next_generation();
                let ctx = TransferContext::new(game_id.clone(), generation, self.events.clone());
                match open_and_start(backend.as_ref(), &record, ctx).await {
                    Ok(transfer) => (generation, transfer),
                    Err(e) => {
                        warn!(%game_id, error = %e, "adapter failed to start");
                        if record.status.can_transition(JobStatus::Paused) {
                            record.status = JobStatus::Paused;
                        }
                        self.persist(&record).await;
                        self.publish(&record, None);
                        return Err(e.into());
                    }
                }
            }
        };

        info!(%game_id, downloader = %record.downloader, generation, "job is now active");
        *slot = Some(ActiveSlot {
            game_id,
            job: record,
            generation,
            transfer: Some(transfer),
            extraction: None,
        });
        Ok(())
    }

    /// Pauses the slot holder and parks its adapter. Caller holds the slot lock.
    async fn preempt(&self, mut holder: ActiveSlot) {
        if let Some(transfer) = &holder.transfer {
            self.bounded("pause", &holder.game_id, transfer.pause()).await;
        }
        if let Some(handle) = holder.extraction.take() {
            handle.abort();
        }
        if holder.job.status.can_transition(JobStatus::Paused) {
            holder.job.status = JobStatus::Paused;
        }
        self.persist(&holder.job).await;
        self.publish(&holder.job, None);
        info!(game_id = %holder.game_id, progress = holder.job.progress, "paused");

        if let Some(transfer) = holder.transfer {
            self.parked.lock().await.insert(
                holder.game_id,
                Parked { generation: holder.generation, transfer, job: holder.job },
            );
        }
    }

    /// Cancels the holder's adapter without touching the record.
    async fn discard(&self, mut holder: ActiveSlot) {
        if let Some(handle) = holder.extraction.take() {
            handle.abort();
        }
        if let Some(transfer) = &holder.transfer {
            self.bounded("cancel", &holder.game_id, transfer.cancel()).await;
        }
    }

    /// Moves the oldest queued job into a free slot.
    ///
    /// The entry stays at the head of the queue until `activate` takes the
    /// slot, so a start that wins the slot first leaves the order intact.
    async fn promote_next(&self) {
        loop {
            if self.slot.lock().await.is_some() {
                return;
            }
            let Some(game_id) = self.queue.front().await else {
                return;
            };
            let job = match self.store.get_job_by_game_id(&game_id).await {
                Ok(Some(job)) if !job.is_deleted => job,
                Ok(_) => {
                    debug!(%game_id, "queued job no longer exists");
                    if !self.drop_queued(&game_id).await {
                        return;
                    }
                    continue;
                }
                Err(e) => {
                    error!(%game_id, error = %e, "failed to load queued job");
                    if !self.drop_queued(&game_id).await {
                        return;
                    }
                    continue;
                }
            };
            let backend = match self.backend(job.downloader) {
                Ok(backend) => backend,
                Err(e) => {
                    warn!(%game_id, error = %e, "dropping queued job");
                    if !self.drop_queued(&game_id).await {
                        return;
                    }
                    continue;
                }
            };
            if let Err(e) = backend.preflight() {
                warn!(%game_id, error = %e, "dropping queued job");
                if !self.drop_queued(&game_id).await {
                    return;
                }
                continue;
            }
            match self.activate(job, backend, false).await {
                Ok(()) => {
                    debug!(%game_id, "queue head handed to activate");
                    return;
                }
                Err(e) => {
                    warn!(%game_id, error = %e, "queued job failed to start");
                    if !self.drop_queued(&game_id).await {
                        return;
                    }
                }
            }
        }
    }

    /// Removes a queue entry that cannot be promoted. False if the queue
    /// could not be updated, which stops promotion.
    async fn drop_queued(&self, game_id: &str) -> bool {
        match self.queue.remove(game_id).await {
            Ok(_) => true,
            Err(e) => {
                error!(%game_id, error = %e, "failed to update the download queue");
                false
            }
        }
    }

    fn backend(&self, kind: DownloaderKind) -> Result<Arc<dyn Backend>, ManagerError> {
        self.backends.get(&kind).cloned().ok_or(ManagerError::NoBackend(kind))
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Waits for an adapter acknowledgment, but never longer than the cancel timeout.
    async fn bounded<F>(&self, action: &'static str, game_id: &str, op: F)
    where
        F: Future<Output = Result<(), AdapterError>>,
    {
        match tokio::time::timeout(self.config.cancel_timeout(), op).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(%game_id, action, error = %e, "adapter request failed"),
            Err(_) => warn!(%game_id, action, "adapter did not acknowledge in time; continuing"),
        }
    }

    /// Event-path writes never fail the engine.
    async fn persist(&self, job: &Job) {
        if let Err(e) = self.store.save_job(job).await {
            error!(game_id = %job.game_id(), error = %e, "failed to persist job update");
        }
    }

    fn publish(&self, job: &Job, sample: Option<&Telemetry>) {
        // No subscribers is fine.
        let _ = self.broadcast.send(StatusBroadcast::from_job(job, sample));
    }
}

async fn open_and_start(
    backend: &dyn Backend,
    job: &Job,
    ctx: TransferContext,
) -> Result<Arc<dyn Transfer>, AdapterError> {
    let transfer = backend.open(job, ctx).await?;
    transfer.start().await?;
    Ok(transfer)
}

fn spawn_extraction(extractor: Arc<dyn Extractor>, archive: PathBuf, ctx: TransferContext) -> JoinHandle<()> {
    tokio::spawn(async move {
        let destination = extraction_dir(&archive);
        let report = |progress: f64| {
            ctx.emit(EventKind::Extraction { progress });
        };
        match extractor.extract(&archive, &destination, &report).await {
            Ok(()) => {
                ctx.emit(EventKind::ExtractionDone);
            }
            Err(e) => {
                ctx.failed(e.to_string(), false);
            }
        }
    })
}
