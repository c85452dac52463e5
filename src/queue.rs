// src/queue.rs

use crate::state_manager::{StateError, StateManager};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;

/// FIFO of game ids waiting for the active slot, mirrored to the store so it
/// survives a restart.
pub struct DownloadQueue {
    entries: Mutex<VecDeque<String>>,
    store: Arc<StateManager>,
}

impl DownloadQueue {
    /// Restores the queue from the store.
    pub async fn load(store: Arc<StateManager>) -> Result<Self, StateError> {
        let entries = store.queue_load().await?.into_iter().collect();
        Ok(Self { entries: Mutex::new(entries), store })
    }

    /// Appends `game_id` unless it is already waiting.
    pub async fn push(&self, game_id: &str) -> Result<bool, StateError> {
        let mut entries = self.entries.lock().await;
        if entries.iter().any(|id| id == game_id) {
            return Ok(false);
        }
        self.store.queue_push(game_id).await?;
        entries.push_back(game_id.to_string());
        Ok(true)
    }

    pub async fn remove(&self, game_id: &str) -> Result<bool, StateError> {
        let mut entries = self.entries.lock().await;
        let Some(index) = entries.iter().position(|id| id == game_id) else {
            return Ok(false);
        };
        self.store.queue_remove(game_id).await?;
        entries.remove(index);
        Ok(true)
    }

    /// The oldest entry, left in place.
    pub async fn front(&self) -> Option<String> {
        self.entries.lock().await.front().cloned()
    }

    pub async fn snapshot(&self) -> Vec<String> {
        self.entries.lock().await.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn front_follows_insertion_order() {
        let store = Arc::new(StateManager::open_in_memory().await.unwrap());
        let queue = DownloadQueue::load(store.clone()).await.unwrap();
        queue.push("steam-1").await.unwrap();
        queue.push("steam-2").await.unwrap();
        assert!(!queue.push("steam-1").await.unwrap());

        assert_eq!(queue.front().await.as_deref(), Some("steam-1"));
        // Peeking leaves the entry in place.
        assert_eq!(store.queue_load().await.unwrap(), vec!["steam-1", "steam-2"]);
        assert!(queue.remove("steam-1").await.unwrap());
        assert_eq!(queue.front().await.as_deref(), Some("steam-2"));
        assert!(queue.remove("steam-2").await.unwrap());
        assert_eq!(queue.front().await, None);
    }

    #[tokio::test]
    async fn queue_is_restored_from_store() {
        let store = Arc::new(StateManager::open_in_memory().await.unwrap());
        store.queue_push("steam-7").await.unwrap();
        store.queue_push("steam-3").await.unwrap();
        let queue = DownloadQueue::load(store).await.unwrap();
        assert_eq!(queue.snapshot().await, vec!["steam-7", "steam-3"]);
        assert_eq!(queue.front().await.as_deref(), Some("steam-7"));
    }
}
