// tests/orchestrator.rs

use async_trait::async_trait;
use gamedl::adapter::Transfer;
use gamedl::extract::{ExtractError, Extractor};
use gamedl::manager::Backends;
use gamedl::prelude::*;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

type Log = Arc<Mutex<Vec<String>>>;

/// Records every call and hands out the contexts it was given.
#[derive(Default)]
struct FakeBackend {
    log: Log,
    contexts: Arc<Mutex<HashMap<String, TransferContext>>>,
    fatal: bool,
}

impl FakeBackend {
    fn ctx(&self, game_id: &str) -> TransferContext {
        self.contexts.lock().unwrap().get(game_id).cloned().expect("transfer was opened")
    }

    fn calls(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| *c == call).count()
    }
}

struct FakeTransfer {
    game_id: String,
    log: Log,
}

impl FakeTransfer {
    fn record(&self, op: &str) {
        self.log.lock().unwrap().push(format!("{op}:{}", self.game_id));
    }
}

#[async_trait]
impl Transfer for FakeTransfer {
    async fn start(&self) -> Result<(), AdapterError> {
        self.record("start");
        Ok(())
    }

    async fn pause(&self) -> Result<(), AdapterError> {
        self.record("pause");
        Ok(())
    }

    async fn resume(&self) -> Result<(), AdapterError> {
        self.record("resume");
        Ok(())
    }

    async fn cancel(&self) -> Result<(), AdapterError> {
        self.record("cancel");
        Ok(())
    }
}

#[async_trait]
impl Backend for FakeBackend {
    fn preflight(&self) -> Result<(), AdapterError> {
        if self.fatal {
            Err(AdapterError::Fatal("agent binary missing".into()))
        } else {
            Ok(())
        }
    }

    async fn open(&self, job: &Job, ctx: TransferContext) -> Result<Arc<dyn Transfer>, AdapterError> {
        let game_id = job.game_id();
        self.log.lock().unwrap().push(format!("open:{game_id}"));
        self.contexts.lock().unwrap().insert(game_id.clone(), ctx);
        Ok(Arc::new(FakeTransfer { game_id, log: self.log.clone() }))
    }

    async fn pause_seeding(&self, job: &Job) -> Result<(), AdapterError> {
        self.log.lock().unwrap().push(format!("pause_seeding:{}", job.game_id()));
        Ok(())
    }
}

/// Unpacks nothing; reports halfway and then success.
struct FakeExtractor;

#[async_trait]
impl Extractor for FakeExtractor {
    async fn extract(
        &self,
        _archive: &Path,
        _destination: &Path,
        progress: &(dyn Fn(f64) + Send + Sync),
    ) -> Result<(), ExtractError> {
        progress(0.5);
        Ok(())
    }
}

struct Harness {
    manager: Arc<DownloadManager>,
    http: Arc<FakeBackend>,
    torrent: Arc<FakeBackend>,
}

async fn harness_with(config: EngineConfig, store: StateManager, extractor: Option<Arc<dyn Extractor>>) -> Harness {
    let http = Arc::new(FakeBackend::default());
    let torrent = Arc::new(FakeBackend::default());
    let fatal = Arc::new(FakeBackend { fatal: true, ..FakeBackend::default() });
    let mut backends: Backends = HashMap::new();
    backends.insert(DownloaderKind::GenericHttp, http.clone());
    backends.insert(DownloaderKind::Torrent, torrent.clone());
    backends.insert(DownloaderKind::PixelDrain, fatal);
    let manager = DownloadManager::with_backends(config, store, backends, extractor).await.unwrap();
    Harness { manager: Arc::new(manager), http, torrent }
}

async fn harness() -> Harness {
    harness_with(EngineConfig::default(), StateManager::open_in_memory().await.unwrap(), None).await
}

fn http_job(object_id: &str) -> Job {
    Job::new("steam", object_id, DownloaderKind::GenericHttp, format!("https://host/{object_id}.bin"), "/games")
}

fn tick(ctx: &TransferContext, state: TransferState, progress: f64) -> StatusEvent {
    StatusEvent {
        game_id: ctx.game_id.clone(),
        generation: ctx.generation,
        kind: EventKind::Transfer(Telemetry {
            state,
            progress,
            bytes_downloaded: (progress * 1000.0) as u64,
            file_size: Some(1000),
            download_speed: 100,
            ..Telemetry::default()
        }),
    }
}

fn event(ctx: &TransferContext, kind: EventKind) -> StatusEvent {
    StatusEvent { game_id: ctx.game_id.clone(), generation: ctx.generation, kind }
}

async fn stored(manager: &DownloadManager, game_id: &str) -> Job {
    manager.get_job(game_id).await.unwrap().expect("job is persisted")
}

#[tokio::test]
async fn starting_a_second_job_pauses_the_first() {
    let h = harness().await;
    let mut updates = h.manager.subscribe();

    h.manager.start_download(http_job("a")).await.unwrap();
    let ctx_a = h.http.ctx("steam-a");
    h.manager.on_status(tick(&ctx_a, TransferState::Downloading, 0.4)).await;

    h.manager.start_download(http_job("b")).await.unwrap();

    let a = stored(&h.manager, "steam-a").await;
    assert_eq!(a.status, JobStatus::Paused);
    assert_eq!(a.progress, 0.4);
    assert_eq!(h.manager.active_job().await.unwrap().game_id(), "steam-b");
    assert_eq!(stored(&h.manager, "steam-b").await.status, JobStatus::Downloading);
    assert_eq!(h.http.count("pause:steam-a"), 1);

    // Late ticks from the paused adapter are ignored.
    h.manager.on_status(tick(&ctx_a, TransferState::Downloading, 0.6)).await;
    assert_eq!(stored(&h.manager, "steam-a").await.progress, 0.4);

    let mut seen = Vec::new();
    while let Ok(update) = updates.try_recv() {
        seen.push((update.game_id, update.status));
    }
    assert!(seen.contains(&("steam-a".to_string(), JobStatus::Paused)));
    assert_eq!(seen.last(), Some(&("steam-b".to_string(), JobStatus::Downloading)));

    let active: Vec<Job> = h
        .manager
        .list_jobs()
        .await
        .unwrap()
        .into_iter()
        .filter(|job| job.status.is_active())
        .collect();
    assert_eq!(active.len(), 1);
}

#[tokio::test]
async fn repeated_start_is_coalesced() {
    let h = harness().await;
    h.manager.start_download(http_job("a")).await.unwrap();
    h.manager.start_download(http_job("a")).await.unwrap();
    assert_eq!(h.http.count("open:steam-a"), 1);
    assert_eq!(h.http.count("start:steam-a"), 1);
}

#[tokio::test]
async fn finishing_holder_is_not_preempted() {
    let h = harness().await;
    h.manager.start_download(http_job("a")).await.unwrap();
    let ctx_a = h.http.ctx("steam-a");
    h.manager.on_status(tick(&ctx_a, TransferState::Downloading, 1.0)).await;

    h.manager.start_download(http_job("b")).await.unwrap();
    assert_eq!(h.http.count("pause:steam-a"), 0);
    assert_eq!(h.manager.queued().await, vec!["steam-b"]);
    assert_eq!(stored(&h.manager, "steam-b").await.status, JobStatus::Paused);

    h.manager.on_status(tick(&ctx_a, TransferState::Finished, 1.0)).await;

    let a = stored(&h.manager, "steam-a").await;
    assert_eq!(a.status, JobStatus::Finished);
    assert_eq!(a.bytes_downloaded, 1000);
    assert_eq!(h.manager.active_job().await.unwrap().game_id(), "steam-b");
    assert!(h.manager.queued().await.is_empty());
}

#[tokio::test]
async fn cancel_resets_counters_and_is_idempotent() {
    let h = harness().await;
    h.manager.start_download(http_job("a")).await.unwrap();
    let ctx_a = h.http.ctx("steam-a");
    h.manager.on_status(tick(&ctx_a, TransferState::Downloading, 0.5)).await;

    h.manager.cancel_download("steam-a").await.unwrap();
    let a = stored(&h.manager, "steam-a").await;
    assert_eq!(a.status, JobStatus::Cancelled);
    assert_eq!(a.progress, 0.0);
    assert_eq!(a.bytes_downloaded, 0);
    assert!(h.manager.active_job().await.is_none());
    assert_eq!(h.http.count("cancel:steam-a"), 1);

    h.manager.cancel_download("steam-a").await.unwrap();
    assert_eq!(stored(&h.manager, "steam-a").await, a);
    assert_eq!(h.http.count("cancel:steam-a"), 1);

    assert!(matches!(
        h.manager.cancel_download("steam-missing").await,
        Err(ManagerError::JobNotFound(_))
    ));
}

#[tokio::test]
async fn adapter_exit_leaves_job_resumable() {
    let h = harness().await;
    h.manager.start_download(http_job("a")).await.unwrap();
    let ctx_a = h.http.ctx("steam-a");
    h.manager.on_status(tick(&ctx_a, TransferState::Downloading, 0.3)).await;
    h.manager.on_status(event(&ctx_a, EventKind::Exited)).await;

    let a = stored(&h.manager, "steam-a").await;
    assert_eq!(a.status, JobStatus::Paused);
    assert_eq!(a.progress, 0.3);
    assert!(h.manager.active_job().await.is_none());

    // Nothing was parked, so resuming opens a fresh adapter.
    h.manager.resume_download("steam-a").await.unwrap();
    assert_eq!(h.http.count("open:steam-a"), 2);
    assert_eq!(stored(&h.manager, "steam-a").await.progress, 0.3);
}

#[tokio::test]
async fn failed_transfer_is_parked_and_reused() {
    let h = harness().await;
    h.manager.start_download(http_job("a")).await.unwrap();
    let ctx_a = h.http.ctx("steam-a");
    h.manager
        .on_status(event(&ctx_a, EventKind::Failed { reason: "connection reset".into(), retryable: true }))
        .await;
    assert_eq!(stored(&h.manager, "steam-a").await.status, JobStatus::Paused);

    h.manager.resume_download("steam-a").await.unwrap();
    assert_eq!(h.http.count("open:steam-a"), 1);
    assert_eq!(h.http.count("resume:steam-a"), 1);
    assert_eq!(stored(&h.manager, "steam-a").await.status, JobStatus::Downloading);

    // The reused adapter keeps its generation.
    h.manager.on_status(tick(&ctx_a, TransferState::Downloading, 0.2)).await;
    assert_eq!(stored(&h.manager, "steam-a").await.progress, 0.2);
}

#[tokio::test]
async fn resume_requires_a_paused_job() {
    let h = harness().await;
    h.manager.start_download(http_job("a")).await.unwrap();
    h.manager.cancel_download("steam-a").await.unwrap();
    assert!(matches!(
        h.manager.resume_download("steam-a").await,
        Err(ManagerError::InvalidState { .. })
    ));
}

#[tokio::test]
async fn fatal_preflight_does_not_disturb_the_active_job() {
    let h = harness().await;
    h.manager.start_download(http_job("a")).await.unwrap();

    let job = Job::new("steam", "p", DownloaderKind::PixelDrain, "https://pixeldrain.com/u/abc", "/games");
    let result = h.manager.start_download(job).await;
    assert!(matches!(result, Err(ManagerError::Adapter(AdapterError::Fatal(_)))));
    assert_eq!(h.manager.active_job().await.unwrap().game_id(), "steam-a");
    assert_eq!(h.http.count("pause:steam-a"), 0);
    assert!(h.manager.get_job("steam-p").await.unwrap().is_none());
}

#[tokio::test]
async fn missing_backend_is_reported() {
    let h = harness().await;
    let job = Job::new("steam", "r", DownloaderKind::RealDebrid, "magnet:?xt=urn:btih:ab", "/games");
    assert!(matches!(
        h.manager.start_download(job).await,
        Err(ManagerError::NoBackend(DownloaderKind::RealDebrid))
    ));
}

#[tokio::test]
async fn pause_releases_the_slot() {
    let h = harness().await;
    h.manager.start_download(http_job("a")).await.unwrap();
    h.manager.pause_download().await.unwrap();
    assert!(h.manager.active_job().await.is_none());
    assert_eq!(stored(&h.manager, "steam-a").await.status, JobStatus::Paused);
    assert_eq!(h.http.count("pause:steam-a"), 1);

    // Pausing with nothing active is a no-op.
    h.manager.pause_download().await.unwrap();
}

#[tokio::test]
async fn finished_torrent_seeds_when_configured() {
    let config = EngineConfig { seed_after_download: true, ..EngineConfig::default() };
    let h = harness_with(config, StateManager::open_in_memory().await.unwrap(), None).await;
    let job = Job::new("steam", "t", DownloaderKind::Torrent, "magnet:?xt=urn:btih:ab", "/games");
    h.manager.start_download(job).await.unwrap();
    assert_eq!(stored(&h.manager, "steam-t").await.status, JobStatus::DownloadingMetadata);

    let ctx = h.torrent.ctx("steam-t");
    h.manager.on_status(tick(&ctx, TransferState::Downloading, 0.5)).await;
    h.manager.on_status(tick(&ctx, TransferState::Seeding, 1.0)).await;
    assert_eq!(stored(&h.manager, "steam-t").await.status, JobStatus::Seeding);
    assert!(h.manager.active_job().await.is_none());

    h.manager.pause_seeding("steam-t").await.unwrap();
    let t = stored(&h.manager, "steam-t").await;
    assert_eq!(t.status, JobStatus::Finished);
    assert!(!t.should_seed);
    assert_eq!(h.torrent.count("pause_seeding:steam-t"), 1);
}

#[tokio::test]
async fn interrupted_jobs_are_paused_on_startup() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("jobs.db");
    {
        let store = StateManager::new(&db).await.unwrap();
        let mut job = http_job("a");
        job.status = JobStatus::Downloading;
        job.progress = 0.7;
        store.save_job(&job).await.unwrap();
    }

    let h = harness_with(EngineConfig::default(), StateManager::new(&db).await.unwrap(), None).await;
    let a = stored(&h.manager, "steam-a").await;
    assert_eq!(a.status, JobStatus::Paused);
    assert_eq!(a.progress, 0.7);
    assert!(h.manager.active_job().await.is_none());
}

#[tokio::test]
async fn archives_are_extracted_before_finishing() {
    let extractor: Arc<dyn Extractor> = Arc::new(FakeExtractor);
    let h = harness_with(
        EngineConfig::default(),
        StateManager::open_in_memory().await.unwrap(),
        Some(extractor),
    )
    .await;
    let mut updates = h.manager.subscribe();
    let engine = tokio::spawn(h.manager.clone().run());

    h.manager.start_download(http_job("z")).await.unwrap();
    let ctx = h.http.ctx("steam-z");
    ctx.telemetry(Telemetry {
        state: TransferState::Finished,
        progress: 1.0,
        bytes_downloaded: 1000,
        file_size: Some(1000),
        artifact: Some(PathBuf::from("/games/game.rar")),
        ..Telemetry::default()
    });

    let mut statuses = Vec::new();
    let finished = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let update = updates.recv().await.unwrap();
            statuses.push(update.status);
            if update.status == JobStatus::Finished {
                break;
            }
        }
    })
    .await;
    assert!(finished.is_ok(), "job never finished: {statuses:?}");
    assert!(statuses.contains(&JobStatus::Decompressing));

    let z = stored(&h.manager, "steam-z").await;
    assert_eq!(z.decompression_progress, 1.0);
    assert_eq!(z.folder_name.as_deref(), Some("game"));
    assert!(h.manager.active_job().await.is_none());
    engine.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn queue_order_survives_a_start_racing_promotion() {
    for _ in 0..20 {
        let h = harness().await;
        h.manager.start_download(http_job("a")).await.unwrap();
        let ctx_a = h.http.ctx("steam-a");
        h.manager.on_status(tick(&ctx_a, TransferState::Downloading, 1.0)).await;
        h.manager.start_download(http_job("b")).await.unwrap();
        h.manager.start_download(http_job("c")).await.unwrap();
        assert_eq!(h.manager.queued().await, vec!["steam-b", "steam-c"]);

        // The holder finishes while a new start competes for the slot.
        let (_, started) = tokio::join!(
            h.manager.on_status(tick(&ctx_a, TransferState::Finished, 1.0)),
            h.manager.start_download(http_job("d")),
        );
        started.unwrap();

        let queued = h.manager.queued().await;
        let position = |id: &str| queued.iter().position(|q| q == id);
        if let Some(b) = position("steam-b") {
            assert_eq!(b, 0, "oldest entry lost its place: {queued:?}");
        }
        if let (Some(c), Some(d)) = (position("steam-c"), position("steam-d")) {
            assert!(c < d, "later start jumped the queue: {queued:?}");
        }
        assert!(h.manager.active_job().await.is_some());
    }
}

#[tokio::test]
async fn finished_job_restarts_from_zero() {
    let h = harness().await;
    h.manager.start_download(http_job("a")).await.unwrap();
    let ctx_a = h.http.ctx("steam-a");
    h.manager.on_status(tick(&ctx_a, TransferState::Finished, 1.0)).await;
    assert_eq!(stored(&h.manager, "steam-a").await.status, JobStatus::Finished);

    h.manager.start_download(http_job("a")).await.unwrap();
    let a = stored(&h.manager, "steam-a").await;
    assert_eq!(a.status, JobStatus::Downloading);
    assert_eq!(a.progress, 0.0);
    assert_eq!(a.bytes_downloaded, 0);
    assert_eq!(h.http.count("open:steam-a"), 2);
}
