pub mod adapter;
pub mod agent;
pub mod cloud;
pub mod config;
pub mod downloader;
pub mod extract;
pub mod manager;
pub mod models;
pub mod queue;
pub mod state_manager;
pub mod status;
pub mod transport;

/// Convenient re-exports of the types most callers need.
pub mod prelude {
    pub use crate::adapter::{AdapterError, Backend, EventKind, StatusEvent, Telemetry, Transfer, TransferContext};
    pub use crate::config::EngineConfig;
    pub use crate::manager::{DownloadManager, ManagerError};
    pub use crate::models::{game_id, DownloaderKind, Job, StatusBroadcast};
    pub use crate::state_manager::StateManager;
    pub use crate::status::{JobStatus, TransferState};
}
