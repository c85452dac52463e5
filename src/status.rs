// src/status.rs

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// The persisted, user-visible status of a job.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Explicitly cancelled. The row survives with reset counters.
    #[serde(rename = "removed")]
    Cancelled,
    DownloadingMetadata,
    CheckingFiles,
    Downloading,
    Decompressing,
    Finished,
    Seeding,
    Paused,
}

impl JobStatus {
    /// Statuses that occupy the single active slot.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            JobStatus::Downloading
                | JobStatus::DownloadingMetadata
                | JobStatus::CheckingFiles
                | JobStatus::Decompressing
        )
    }

    /// Torrent pre-stages: active, but progress is not yet meaningful.
    pub fn is_pre_stage(self) -> bool {
        matches!(self, JobStatus::DownloadingMetadata | JobStatus::CheckingFiles)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// Staying in the same status is always allowed (progress ticks).
    pub fn can_transition(self, next: JobStatus) -> bool {
        use JobStatus::*;

        if self == next {
            return true;
        }
        match next {
            // Explicit cancel is legal from anywhere.
            Cancelled => true,
            // Start/resume can enter the pre-stage from any non-active status,
            // and the agent may fall back to it while verifying.
            DownloadingMetadata => !matches!(self, Decompressing),
            CheckingFiles => matches!(self, DownloadingMetadata | Paused | Downloading),
            Downloading => !matches!(self, Decompressing),
            Decompressing => matches!(self, Downloading | Paused),
            Finished => matches!(self, Downloading | Decompressing | Seeding | CheckingFiles),
            Seeding => matches!(self, Finished | Downloading | CheckingFiles),
            Paused => self.is_active(),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobStatus::Cancelled => "removed",
            JobStatus::DownloadingMetadata => "downloading_metadata",
            JobStatus::CheckingFiles => "checking_files",
            JobStatus::Downloading => "downloading",
            JobStatus::Decompressing => "decompressing",
            JobStatus::Finished => "finished",
            JobStatus::Seeding => "seeding",
            JobStatus::Paused => "paused",
        };
        f.write_str(name)
    }
}

/// Raw transfer state as reported by an adapter. The numeric values are the
/// ones the transfer agent puts on the wire.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(try_from = "u8", into = "u8")]
pub enum TransferState {
    CheckingFiles = 1,
    DownloadingMetadata = 2,
    Downloading = 3,
    Finished = 4,
    Seeding = 5,
}

impl TransferState {
    /// Terminal states prove that every byte is on disk.
    pub fn is_complete(self) -> bool {
        matches!(self, TransferState::Finished | TransferState::Seeding)
    }
}

impl TryFrom<u8> for TransferState {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(TransferState::CheckingFiles),
            2 => Ok(TransferState::DownloadingMetadata),
            3 => Ok(TransferState::Downloading),
            4 => Ok(TransferState::Finished),
            5 => Ok(TransferState::Seeding),
            other => Err(format!("unknown transfer state {other}")),
        }
    }
}

impl From<TransferState> for u8 {
    fn from(state: TransferState) -> Self {
        state as u8
    }
}

/// Estimated time remaining. Zero speed or an unknown size yields `None`,
/// which is presented as "infinite".
pub fn eta(file_size: Option<u64>, bytes_downloaded: u64, speed: u64) -> Option<Duration> {
    let total = file_size?;
    if speed == 0 || total == 0 {
        return None;
    }
    let remaining = total.saturating_sub(bytes_downloaded);
    Some(Duration::from_secs_f64(remaining as f64 / speed as f64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_statuses() {
        assert!(JobStatus::Downloading.is_active());
        assert!(JobStatus::DownloadingMetadata.is_active());
        assert!(JobStatus::CheckingFiles.is_active());
        assert!(JobStatus::Decompressing.is_active());
        assert!(!JobStatus::Paused.is_active());
        assert!(!JobStatus::Seeding.is_active());
        assert!(!JobStatus::Finished.is_active());
        assert!(!JobStatus::Cancelled.is_active());
    }

    #[test]
    fn transitions_follow_the_machine() {
        use JobStatus::*;
        assert!(DownloadingMetadata.can_transition(CheckingFiles));
        assert!(CheckingFiles.can_transition(Downloading));
        assert!(Downloading.can_transition(Decompressing));
        assert!(Decompressing.can_transition(Finished));
        assert!(Finished.can_transition(Seeding));
        assert!(Downloading.can_transition(Paused));
        assert!(Paused.can_transition(Downloading));
        assert!(Seeding.can_transition(Cancelled));

        assert!(!Paused.can_transition(Finished));
        assert!(!Finished.can_transition(Paused));
        assert!(!DownloadingMetadata.can_transition(Finished));
        assert!(!Decompressing.can_transition(Downloading));
    }

    #[test]
    fn cancelled_is_serialized_as_removed() {
        let json = serde_json::to_string(&JobStatus::Cancelled).unwrap();
        assert_eq!(json, "\"removed\"");
        let back: JobStatus = serde_json::from_str("\"downloading_metadata\"").unwrap();
        assert_eq!(back, JobStatus::DownloadingMetadata);
    }

    #[test]
    fn transfer_state_uses_wire_numbers() {
        assert_eq!(serde_json::to_string(&TransferState::Seeding).unwrap(), "5");
        let state: TransferState = serde_json::from_str("1").unwrap();
        assert_eq!(state, TransferState::CheckingFiles);
        assert!(serde_json::from_str::<TransferState>("9").is_err());
    }

    #[test]
    fn eta_with_zero_speed_is_infinite() {
        assert_eq!(eta(Some(1000), 100, 0), None);
        assert_eq!(eta(None, 100, 50), None);
        assert_eq!(eta(Some(1000), 500, 100), Some(Duration::from_secs(5)));
        assert_eq!(eta(Some(1000), 2000, 100), Some(Duration::ZERO));
    }
}
