// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite-backed local store for the offline queue and the identifier cache.
//!
//! One file, two tables:
//! ```sql
//! CREATE TABLE queued_submissions (
//!   id INTEGER PRIMARY KEY AUTOINCREMENT,  -- never reused
//!   private_id TEXT NOT NULL,
//!   healthing_key TEXT NOT NULL,
//!   timestamp TEXT NOT NULL                -- ISO-8601, set at enqueue
//! )
//! CREATE TABLE valid_identifier_cache (
//!   private_id TEXT PRIMARY KEY
//! )
//! ```
//!
//! The pool is opened lazily on first access and reused until [`LocalStore::close`].
//! Nothing here is global: whoever constructs the store owns it.

use async_trait::async_trait;
use sqlx::{AnyPool, Row, any::AnyPoolOptions};
use std::path::Path;
use std::sync::Once;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::resilience::retry::{retry, RetryConfig};
use crate::submission::{QueuedSubmission, SubmissionId};
use super::traits::{delete_each, IdentifierCacheStore, RemoveReport, StorageError, SubmissionStore};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

pub(crate) fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

const SUBMISSIONS_TABLE: &str = "queued_submissions";

pub struct LocalStore {
    url: String,
    path: String,
    pool: OnceCell<AnyPool>,
    connect_retry: RetryConfig,
}

impl LocalStore {
    /// Describe a store at `path`. No I/O happens until the first operation.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self::with_retry(path, RetryConfig::startup())
    }

    /// Same as [`LocalStore::new`] with a custom connect retry policy.
    pub fn with_retry(path: impl AsRef<Path>, connect_retry: RetryConfig) -> Self {
        let path = path.as_ref().to_string_lossy().to_string();
        Self {
            url: format!("sqlite://{}?mode=rwc", path),
            path,
            pool: OnceCell::new(),
            connect_retry,
        }
    }

    /// Path of the SQLite file.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Whether the pool has been opened yet.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.pool.get().is_some_and(|p| !p.is_closed())
    }

    /// Open the store now instead of on first use.
    pub async fn open(&self) -> Result<(), StorageError> {
        self.pool().await.map(|_| ())
    }

    /// Close the pool. Later operations fail with a backend error.
    pub async fn close(&self) {
        if let Some(pool) = self.pool.get() {
            pool.close().await;
            debug!(path = %self.path, "Local store closed");
        }
    }

    async fn pool(&self) -> Result<&AnyPool, StorageError> {
        self.pool
            .get_or_try_init(|| async {
                install_drivers();
                info!(path = %self.path, "Opening local store");

                let pool = retry("local_store_connect", &self.connect_retry, || async {
                    AnyPoolOptions::new()
                        .max_connections(4)
                        .acquire_timeout(Duration::from_secs(10))
                        .connect(&self.url)
                        .await
                        .map_err(|e| StorageError::Unavailable(e.to_string()))
                })
                .await?;

                Self::enable_wal_mode(&pool).await?;
                Self::init_schema(&pool).await?;
                Ok(pool)
            })
            .await
    }

    /// WAL journal: readers don't block the writer, one fsync per commit.
    async fn enable_wal_mode(pool: &AnyPool) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(pool)
            .await
            .map_err(|e| StorageError::Unavailable(format!("Failed to enable WAL mode: {}", e)))?;

        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(pool)
            .await
            .map_err(|e| StorageError::Unavailable(format!("Failed to set synchronous mode: {}", e)))?;

        Ok(())
    }

    async fn init_schema(pool: &AnyPool) -> Result<(), StorageError> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS queued_submissions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                private_id TEXT NOT NULL,
                healthing_key TEXT NOT NULL,
                timestamp TEXT NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS valid_identifier_cache (
                private_id TEXT PRIMARY KEY
            )
            "#,
        ];

        for sql in statements {
            sqlx::query(sql)
                .execute(pool)
                .await
                .map_err(|e| StorageError::Unavailable(format!("Failed to create schema: {}", e)))?;
        }
        Ok(())
    }
}

fn backend(e: sqlx::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

#[async_trait]
impl SubmissionStore for LocalStore {
    async fn insert_submission(
        &self,
        private_id: &str,
        healthing_key: &str,
        timestamp: &str,
    ) -> Result<SubmissionId, StorageError> {
        let pool = self.pool().await?;
        // The Any driver reports no last_insert_id for SQLite
        let row = sqlx::query(
            "INSERT INTO queued_submissions (private_id, healthing_key, timestamp) VALUES (?, ?, ?) RETURNING id",
        )
        .bind(private_id)
        .bind(healthing_key)
        .bind(timestamp)
        .fetch_one(pool)
        .await
        .map_err(backend)?;

        row.try_get::<i64, _>("id").map_err(backend)
    }

    async fn list_submissions(&self) -> Result<Vec<QueuedSubmission>, StorageError> {
        let pool = self.pool().await?;
        let rows = sqlx::query(
            "SELECT id, private_id, healthing_key, timestamp FROM queued_submissions",
        )
        .fetch_all(pool)
        .await
        .map_err(backend)?;

        let corrupt = |e: sqlx::Error| StorageError::Corrupt {
            table: SUBMISSIONS_TABLE.to_string(),
            detail: e.to_string(),
        };

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            out.push(QueuedSubmission {
                id: row.try_get("id").map_err(corrupt)?,
                private_id: row.try_get("private_id").map_err(corrupt)?,
                healthing_key: row.try_get("healthing_key").map_err(corrupt)?,
                timestamp: row.try_get("timestamp").map_err(corrupt)?,
            });
        }
        Ok(out)
    }

    async fn delete_submission(&self, id: SubmissionId) -> Result<(), StorageError> {
        let pool = self.pool().await?;
        sqlx::query("DELETE FROM queued_submissions WHERE id = ?")
            .bind(id)
            .execute(pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    /// One `DELETE … IN (…)` first; on failure, fall back to per-id deletes so
    /// one bad id can't hold the rest hostage.
    async fn delete_submissions(&self, ids: &[SubmissionId]) -> RemoveReport {
        if ids.is_empty() {
            return RemoveReport::default();
        }

        let placeholders: Vec<&str> = ids.iter().map(|_| "?").collect();
        let sql = format!(
            "DELETE FROM queued_submissions WHERE id IN ({})",
            placeholders.join(", ")
        );

        let batch = async {
            let pool = self.pool().await?;
            let mut query = sqlx::query(&sql);
            for id in ids {
                query = query.bind(*id);
            }
            query.execute(pool).await.map_err(backend)
        };

        match batch.await {
            Ok(result) => {
                debug!(requested = ids.len(), deleted = result.rows_affected(), "Batch deleted from queue");
                RemoveReport {
                    removed: ids.to_vec(),
                    failed: Vec::new(),
                }
            }
            Err(e) => {
                warn!(error = %e, count = ids.len(), "Batch delete failed, falling back to per-id deletes");
                delete_each(self, ids).await
            }
        }
    }

    async fn count_submissions(&self) -> Result<u64, StorageError> {
        let pool = self.pool().await?;
        let row = sqlx::query("SELECT COUNT(*) as cnt FROM queued_submissions")
            .fetch_one(pool)
            .await
            .map_err(backend)?;
        let count: i64 = row.try_get("cnt").map_err(backend)?;
        Ok(count as u64)
    }
}

#[async_trait]
impl IdentifierCacheStore for LocalStore {
    async fn contains_identifier(&self, private_id: &str) -> Result<bool, StorageError> {
        let pool = self.pool().await?;
        let row = sqlx::query("SELECT 1 FROM valid_identifier_cache WHERE private_id = ? LIMIT 1")
            .bind(private_id)
            .fetch_optional(pool)
            .await
            .map_err(backend)?;
        Ok(row.is_some())
    }

    async fn remember_identifier(&self, private_id: &str) -> Result<(), StorageError> {
        let pool = self.pool().await?;
        sqlx::query("INSERT OR IGNORE INTO valid_identifier_cache (private_id) VALUES (?)")
            .bind(private_id)
            .execute(pool)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn replace_identifiers(&self, ids: &[String]) -> Result<usize, StorageError> {
        let pool = self.pool().await?;
        let mut tx = pool.begin().await.map_err(backend)?;

        sqlx::query("DELETE FROM valid_identifier_cache")
            .execute(&mut *tx)
            .await
            .map_err(backend)?;

        for id in ids {
            sqlx::query("INSERT OR IGNORE INTO valid_identifier_cache (private_id) VALUES (?)")
                .bind(id.as_str())
                .execute(&mut *tx)
                .await
                .map_err(backend)?;
        }

        tx.commit().await.map_err(backend)?;

        let count = self.count_identifiers().await?;
        Ok(count as usize)
    }

    async fn count_identifiers(&self) -> Result<u64, StorageError> {
        let pool = self.pool().await?;
        let row = sqlx::query("SELECT COUNT(*) as cnt FROM valid_identifier_cache")
            .fetch_one(pool)
            .await
            .map_err(backend)?;
        let count: i64 = row.try_get("cnt").map_err(backend)?;
        Ok(count as u64)
    }
}
