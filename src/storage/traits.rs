// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage traits shared by the SQLite and in-memory stores.

use async_trait::async_trait;
use crate::submission::{QueuedSubmission, SubmissionId};
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Local store unavailable: {0}")]
    Unavailable(String),
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Invalid queue entry: {0}")]
    InvalidEntry(String),
    #[error("Queue full: {pending} items (max {max})")]
    QueueFull { pending: u64, max: u64 },
    #[error("Corrupt row in '{table}': {detail}")]
    Corrupt { table: String, detail: String },
}

/// Result of a best-effort batch removal.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RemoveReport {
    /// Ids whose removal completed (including ids that were already gone)
    pub removed: Vec<SubmissionId>,
    /// Ids whose removal failed, with the error text
    pub failed: Vec<(SubmissionId, String)>,
}

impl RemoveReport {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Persistent table of pending submissions.
#[async_trait]
pub trait SubmissionStore: Send + Sync {
    /// Insert a row and return its freshly assigned id.
    async fn insert_submission(
        &self,
        private_id: &str,
        healthing_key: &str,
        timestamp: &str,
    ) -> Result<SubmissionId, StorageError>;

    /// All rows, in no particular order.
    async fn list_submissions(&self) -> Result<Vec<QueuedSubmission>, StorageError>;

    /// Delete one row. Deleting a missing id is not an error.
    async fn delete_submission(&self, id: SubmissionId) -> Result<(), StorageError>;

    /// Delete several rows; a failure on one id never stops the others.
    /// Default implementation deletes one id at a time.
    async fn delete_submissions(&self, ids: &[SubmissionId]) -> RemoveReport {
        delete_each(self, ids).await
    }

    async fn count_submissions(&self) -> Result<u64, StorageError>;
}

/// Persistent set of identifiers known to be valid remotely.
#[async_trait]
pub trait IdentifierCacheStore: Send + Sync {
    async fn contains_identifier(&self, private_id: &str) -> Result<bool, StorageError>;

    /// Add one identifier (no-op if present).
    async fn remember_identifier(&self, private_id: &str) -> Result<(), StorageError>;

    /// Replace the whole set atomically. Returns the new size.
    async fn replace_identifiers(&self, ids: &[String]) -> Result<usize, StorageError>;

    async fn count_identifiers(&self) -> Result<u64, StorageError>;
}

/// Delete `ids` one statement at a time, collecting per-id failures.
pub(crate) async fn delete_each<S>(store: &S, ids: &[SubmissionId]) -> RemoveReport
where
    S: SubmissionStore + ?Sized,
{
    let mut report = RemoveReport::default();
    for &id in ids {
        match store.delete_submission(id).await {
            Ok(()) => report.removed.push(id),
            Err(e) => {
                warn!(id, error = %e, "Failed to delete queued submission");
                report.failed.push((id, e.to_string()));
            }
        }
    }
    report
}
