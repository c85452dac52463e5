// src/state_manager.rs

use crate::models::Job;
use rusqlite::{params, OptionalExtension};
use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("database query failed: {0}")]
    Query(#[from] rusqlite::Error),
}

/// Persists job records and the download queue to SQLite.
///
/// Jobs are keyed by `(shop, object_id)`; the record itself is stored as JSON.
pub struct StateManager {
    conn: Connection,
}

fn decode_job(job_data: String) -> Result<Job, rusqlite::Error> {
    serde_json::from_str(&job_data).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })
}

impl StateManager {
    /// Opens (or creates) the database file and its tables.
    pub async fn new(db_path: &Path) -> Result<Self, StateError> {
        let conn = Connection::open(db_path).await?;
        let manager = Self { conn };
        manager.setup_database().await?;
        Ok(manager)
    }

    pub async fn open_in_memory() -> Result<Self, StateError> {
        let conn = Connection::open_in_memory().await?;
        let manager = Self { conn };
        manager.setup_database().await?;
        Ok(manager)
    }

    async fn setup_database(&self) -> Result<(), StateError> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "CREATE TABLE IF NOT EXISTS jobs (
                        shop            TEXT NOT NULL,
                        object_id       TEXT NOT NULL,
                        game_id         TEXT NOT NULL UNIQUE,
                        job_data        TEXT NOT NULL,
                        PRIMARY KEY (shop, object_id)
                    );
                    CREATE TABLE IF NOT EXISTS download_queue (
                        seq             INTEGER PRIMARY KEY AUTOINCREMENT,
                        game_id         TEXT NOT NULL UNIQUE
                    );",
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Inserts or replaces a job record.
    pub async fn save_job(&self, job: &Job) -> Result<(), StateError> {
        let job_data = serde_json::to_string(job)?;
        let shop = job.shop.clone();
        let object_id = job.object_id.clone();
        let game_id = job.game_id();

        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO jobs (shop, object_id, game_id, job_data) VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT (shop, object_id) DO UPDATE SET job_data = excluded.job_data",
                    params![shop, object_id, game_id, job_data],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn get_job(&self, shop: &str, object_id: &str) -> Result<Option<Job>, StateError> {
        let shop = shop.to_string();
        let object_id = object_id.to_string();
        let job = self
            .conn
            .call(move |conn| {
                let data: Option<String> = conn
                    .query_row(
                        "SELECT job_data FROM jobs WHERE shop = ?1 AND object_id = ?2",
                        params![shop, object_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(data.map(decode_job).transpose()?)
            })
            .await?;
        Ok(job)
    }

    pub async fn get_job_by_game_id(&self, game_id: &str) -> Result<Option<Job>, StateError> {
        let game_id = game_id.to_string();
        let job = self
            .conn
            .call(move |conn| {
                let data: Option<String> = conn
                    .query_row(
                        "SELECT job_data FROM jobs WHERE game_id = ?1",
                        params![game_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(data.map(decode_job).transpose()?)
            })
            .await?;
        Ok(job)
    }

    /// Loads every job record.
    pub async fn load_all_jobs(&self) -> Result<Vec<Job>, StateError> {
        let jobs = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT job_data FROM jobs ORDER BY rowid")?;
                let job_iter = stmt.query_map([], |row| decode_job(row.get(0)?))?;
                let jobs: Result<Vec<Job>, rusqlite::Error> = job_iter.collect();
                Ok(jobs?)
            })
            .await?;
        Ok(jobs)
    }

    /// Appends to the queue. Returns false if the id was already queued.
    pub async fn queue_push(&self, game_id: &str) -> Result<bool, StateError> {
        let game_id = game_id.to_string();
        let inserted = self
            .conn
            .call(move |conn| {
                let n = conn.execute(
                    "INSERT OR IGNORE INTO download_queue (game_id) VALUES (?1)",
                    params![game_id],
                )?;
                Ok(n > 0)
            })
            .await?;
        Ok(inserted)
    }

    pub async fn queue_remove(&self, game_id: &str) -> Result<bool, StateError> {
        let game_id = game_id.to_string();
        let removed = self
            .conn
            .call(move |conn| {
                let n = conn.execute("DELETE FROM download_queue WHERE game_id = ?1", params![game_id])?;
                Ok(n > 0)
            })
            .await?;
        Ok(removed)
    }

    /// Queued ids, oldest first.
    pub async fn queue_load(&self) -> Result<Vec<String>, StateError> {
        let ids = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT game_id FROM download_queue ORDER BY seq")?;
                let rows = stmt.query_map([], |row| row.get(0))?;
                let ids: Result<Vec<String>, rusqlite::Error> = rows.collect();
                Ok(ids?)
            })
            .await?;
        Ok(ids)
    }
}
