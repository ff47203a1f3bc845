// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL implementation of the remote service (MySQL in production, SQLite in tests).
//!
//! Expected schema (names come from [`RemoteTables`]):
//! ```sql
//! CREATE TABLE valid_private_ids (private_id VARCHAR(255) PRIMARY KEY);
//! CREATE TABLE valid_healthing_codes (
//!   healthing_code VARCHAR(255) PRIMARY KEY,
//!   is_used BIGINT NOT NULL DEFAULT 0
//! );
//! CREATE TABLE submission_history (
//!   id BIGINT AUTO_INCREMENT PRIMARY KEY,
//!   private_id VARCHAR(255) NOT NULL,
//!   healthing_key VARCHAR(255) NOT NULL,
//!   timestamp VARCHAR(64) NOT NULL
//! );
//! ```
//!
//! ## Atomic consume
//!
//! [`consume_key`](RemoteService::consume_key) runs in one transaction:
//!
//! ```sql
//! UPDATE valid_healthing_codes SET is_used = 1 WHERE healthing_code = ? AND is_used = 0;
//! -- zero rows: key missing or already used -> rollback, nothing written
//! INSERT INTO submission_history (private_id, healthing_key, timestamp) VALUES (?, ?, ?);
//! COMMIT;
//! ```
//!
//! The conditional update is the idempotency boundary: a replay of a
//! submission whose commit already landed finds the key used and writes nothing.

use async_trait::async_trait;
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{AnyPool, Row};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::config::RemoteTables;
use crate::resilience::retry::{retry, RetryConfig};
use crate::storage::sql::install_drivers;
use crate::submission::SubmissionRecord;
use super::traits::{ConsumeOutcome, KeyStatus, RemoteError, RemoteService};

/// Prepared SQL text for the configured table names.
#[derive(Debug, Clone)]
struct Statements {
    identifier_exists: String,
    list_identifiers: String,
    key_lookup: String,
    mark_used: String,
    insert_history: String,
    history: String,
}

impl Statements {
    fn new(t: &RemoteTables) -> Self {
        Self {
            identifier_exists: format!("SELECT 1 FROM {} WHERE private_id = ? LIMIT 1", t.valid_ids),
            list_identifiers: format!("SELECT private_id FROM {}", t.valid_ids),
            key_lookup: format!("SELECT is_used FROM {} WHERE {} = ?", t.keys, t.key_column),
            mark_used: format!(
                "UPDATE {} SET is_used = 1 WHERE {} = ? AND is_used = 0",
                t.keys, t.key_column
            ),
            insert_history: format!(
                "INSERT INTO {} (private_id, healthing_key, timestamp) VALUES (?, ?, ?)",
                t.submissions
            ),
            history: format!(
                "SELECT private_id, healthing_key, timestamp FROM {} WHERE private_id = ? ORDER BY timestamp DESC",
                t.submissions
            ),
        }
    }
}

/// Table and column names are spliced into SQL, so only plain identifiers pass.
fn validate_identifier(name: &str) -> Result<(), RemoteError> {
    if !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(RemoteError::Config(format!("invalid SQL identifier '{}'", name)))
    }
}

fn validate_tables(t: &RemoteTables) -> Result<(), RemoteError> {
    validate_identifier(&t.valid_ids)?;
    validate_identifier(&t.keys)?;
    validate_identifier(&t.key_column)?;
    validate_identifier(&t.submissions)
}

const URL_SCHEMES: [&str; 3] = ["mysql:", "mariadb:", "sqlite:"];

fn check_url(url: &str) -> Result<(), RemoteError> {
    if URL_SCHEMES.iter().any(|scheme| url.starts_with(scheme)) {
        Ok(())
    } else {
        let scheme = url.split(':').next().unwrap_or_default();
        Err(RemoteError::Config(format!(
            "unsupported remote URL scheme '{}', expected mysql, mariadb or sqlite",
            scheme
        )))
    }
}

fn map_sqlx(e: sqlx::Error) -> RemoteError {
    match &e {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => RemoteError::Transport(e.to_string()),
        _ => RemoteError::Backend(e.to_string()),
    }
}

// sqlx Any driver hands MySQL VARCHAR/TEXT back as either text or bytes
fn text_column(row: &AnyRow, column: &str) -> Result<String, RemoteError> {
    if let Ok(s) = row.try_get::<String, _>(column) {
        return Ok(s);
    }
    let bytes: Vec<u8> = row.try_get(column).map_err(map_sqlx)?;
    String::from_utf8(bytes)
        .map_err(|e| RemoteError::Backend(format!("column '{}' is not UTF-8: {}", column, e)))
}

// BIGINT flag, or BOOLEAN on schemas that declare one
fn flag_column(row: &AnyRow, column: &str) -> Result<bool, RemoteError> {
    if let Ok(v) = row.try_get::<i64, _>(column) {
        return Ok(v != 0);
    }
    row.try_get::<bool, _>(column).map_err(map_sqlx)
}

fn observe<T>(operation: &str, start: Instant, result: &Result<T, RemoteError>) {
    let status = match result {
        Ok(_) => "success",
        Err(e) => e.kind(),
    };
    crate::metrics::record_remote_call(operation, status, start.elapsed());
}

pub struct SqlRemote {
    pool: AnyPool,
    tables: RemoteTables,
    sql: Statements,
    is_sqlite: bool,
}

impl SqlRemote {
    /// Connect with startup-mode retry (fails fast on a bad URL).
    pub async fn connect(url: &str, tables: RemoteTables) -> Result<Self, RemoteError> {
        Self::connect_with_retry(url, tables, &RetryConfig::startup()).await
    }

    pub async fn connect_with_retry(
        url: &str,
        tables: RemoteTables,
        retry_config: &RetryConfig,
    ) -> Result<Self, RemoteError> {
        validate_tables(&tables)?;
        check_url(url)?;
        install_drivers();

        let pool = retry("remote_connect", retry_config, || async {
            AnyPoolOptions::new()
                .max_connections(5)
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(url)
                .await
                .map_err(map_sqlx)
        })
        .await?;

        info!(valid_ids = %tables.valid_ids, keys = %tables.keys, "Connected to remote submission service");
        Ok(Self::build(pool, tables, url.starts_with("sqlite:")))
    }

    /// Build the pool without connecting. Only the URL is checked here, so a
    /// client can start while the remote is unreachable.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn connect_lazy(url: &str, tables: RemoteTables) -> Result<Self, RemoteError> {
        validate_tables(&tables)?;
        check_url(url)?;
        install_drivers();

        let pool = AnyPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .idle_timeout(Duration::from_secs(300))
            .connect_lazy(url)
            .map_err(|e| RemoteError::Config(format!("bad remote URL: {}", e)))?;

        Ok(Self::build(pool, tables, url.starts_with("sqlite:")))
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: AnyPool, tables: RemoteTables, is_sqlite: bool) -> Result<Self, RemoteError> {
        validate_tables(&tables)?;
        Ok(Self::build(pool, tables, is_sqlite))
    }

    fn build(pool: AnyPool, tables: RemoteTables, is_sqlite: bool) -> Self {
        let sql = Statements::new(&tables);
        Self { pool, tables, sql, is_sqlite }
    }

    /// Get a clone of the connection pool.
    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    /// Create the three tables if missing. For development and tests; a
    /// production backend owns its own schema.
    pub async fn init_schema(&self) -> Result<(), RemoteError> {
        let t = &self.tables;
        let mut statements = vec![
            format!(
                "CREATE TABLE IF NOT EXISTS {} (private_id VARCHAR(255) PRIMARY KEY)",
                t.valid_ids
            ),
            format!(
                "CREATE TABLE IF NOT EXISTS {} ({} VARCHAR(255) PRIMARY KEY, is_used BIGINT NOT NULL DEFAULT 0)",
                t.keys, t.key_column
            ),
        ];

        if self.is_sqlite {
            statements.push(format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    private_id VARCHAR(255) NOT NULL,
                    healthing_key VARCHAR(255) NOT NULL,
                    timestamp VARCHAR(64) NOT NULL
                )",
                t.submissions
            ));
            statements.push(format!(
                "CREATE INDEX IF NOT EXISTS idx_{0}_private_id ON {0} (private_id)",
                t.submissions
            ));
        } else {
            statements.push(format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id BIGINT AUTO_INCREMENT PRIMARY KEY,
                    private_id VARCHAR(255) NOT NULL,
                    healthing_key VARCHAR(255) NOT NULL,
                    timestamp VARCHAR(64) NOT NULL,
                    INDEX idx_private_id (private_id)
                )",
                t.submissions
            ));
        }

        for sql in &statements {
            sqlx::query(sql).execute(&self.pool).await.map_err(map_sqlx)?;
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteService for SqlRemote {
    async fn identifier_exists(&self, private_id: &str) -> Result<bool, RemoteError> {
        let start = Instant::now();
        let result = sqlx::query(&self.sql.identifier_exists)
            .bind(private_id)
            .fetch_optional(&self.pool)
            .await
            .map(|row| row.is_some())
            .map_err(map_sqlx);
        observe("identifier_exists", start, &result);
        result
    }

    async fn valid_identifiers(&self) -> Result<Vec<String>, RemoteError> {
        let start = Instant::now();
        let result = async {
            let rows = sqlx::query(&self.sql.list_identifiers)
                .fetch_all(&self.pool)
                .await
                .map_err(map_sqlx)?;
            rows.iter().map(|row| text_column(row, "private_id")).collect()
        }
        .await;
        observe("valid_identifiers", start, &result);
        result
    }

    async fn key_status(&self, key: &str) -> Result<KeyStatus, RemoteError> {
        let start = Instant::now();
        let result = async {
            let row = sqlx::query(&self.sql.key_lookup)
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(map_sqlx)?;
            match row {
                None => Ok(KeyStatus::Missing),
                Some(row) if flag_column(&row, "is_used")? => Ok(KeyStatus::Used),
                Some(_) => Ok(KeyStatus::Free),
            }
        }
        .await;
        observe("key_status", start, &result);
        result
    }

    async fn consume_key(&self, record: &SubmissionRecord) -> Result<ConsumeOutcome, RemoteError> {
        let start = Instant::now();
        let result = async {
            let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

            let updated = sqlx::query(&self.sql.mark_used)
                .bind(record.healthing_key.as_str())
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx)?;

            if updated.rows_affected() == 0 {
                let existing = sqlx::query(&self.sql.key_lookup)
                    .bind(record.healthing_key.as_str())
                    .fetch_optional(&mut *tx)
                    .await
                    .map_err(map_sqlx)?;
                tx.rollback().await.map_err(map_sqlx)?;
                return Ok(if existing.is_some() {
                    ConsumeOutcome::KeyAlreadyUsed
                } else {
                    ConsumeOutcome::KeyMissing
                });
            }

            sqlx::query(&self.sql.insert_history)
                .bind(record.private_id.as_str())
                .bind(record.healthing_key.as_str())
                .bind(record.timestamp.as_str())
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx)?;

            tx.commit().await.map_err(map_sqlx)?;
            debug!(private_id = %record.private_id, "Key consumed and submission recorded");
            Ok(ConsumeOutcome::Consumed)
        }
        .await;
        observe("consume_key", start, &result);
        result
    }

    async fn history(&self, private_id: &str) -> Result<Vec<SubmissionRecord>, RemoteError> {
        let start = Instant::now();
        let result = async {
            let rows = sqlx::query(&self.sql.history)
                .bind(private_id)
                .fetch_all(&self.pool)
                .await
                .map_err(map_sqlx)?;
            rows.iter()
                .map(|row| {
                    Ok(SubmissionRecord {
                        private_id: text_column(row, "private_id")?,
                        healthing_key: text_column(row, "healthing_key")?,
                        timestamp: text_column(row, "timestamp")?,
                    })
                })
                .collect()
        }
        .await;
        observe("history", start, &result);
        result
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map(|_| ())
            .map_err(map_sqlx)
    }
}
