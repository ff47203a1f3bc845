// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Non-persistent store for tests and demos.

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use crate::submission::{QueuedSubmission, SubmissionId};
use super::traits::{IdentifierCacheStore, StorageError, SubmissionStore};

pub struct MemoryStore {
    submissions: DashMap<SubmissionId, QueuedSubmission>,
    identifiers: DashSet<String>,
    next_id: AtomicI64,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self {
            submissions: DashMap::new(),
            identifiers: DashSet::new(),
            next_id: AtomicI64::new(1),
        }
    }

    /// Number of queued submissions
    #[must_use]
    pub fn len(&self) -> usize {
        self.submissions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.submissions.is_empty()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SubmissionStore for MemoryStore {
    async fn insert_submission(
        &self,
        private_id: &str,
        healthing_key: &str,
        timestamp: &str,
    ) -> Result<SubmissionId, StorageError> {
        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        self.submissions.insert(
            id,
            QueuedSubmission::new(id, private_id, healthing_key, timestamp),
        );
        Ok(id)
    }

    async fn list_submissions(&self) -> Result<Vec<QueuedSubmission>, StorageError> {
        Ok(self.submissions.iter().map(|r| r.value().clone()).collect())
    }

    async fn delete_submission(&self, id: SubmissionId) -> Result<(), StorageError> {
        self.submissions.remove(&id);
        Ok(())
    }

    async fn count_submissions(&self) -> Result<u64, StorageError> {
        Ok(self.submissions.len() as u64)
    }
}

#[async_trait]
impl IdentifierCacheStore for MemoryStore {
    async fn contains_identifier(&self, private_id: &str) -> Result<bool, StorageError> {
        Ok(self.identifiers.contains(private_id))
    }

    async fn remember_identifier(&self, private_id: &str) -> Result<(), StorageError> {
        self.identifiers.insert(private_id.to_string());
        Ok(())
    }

    async fn replace_identifiers(&self, ids: &[String]) -> Result<usize, StorageError> {
        self.identifiers.clear();
        for id in ids {
            self.identifiers.insert(id.clone());
        }
        Ok(self.identifiers.len())
    }

    async fn count_identifiers(&self) -> Result<u64, StorageError> {
        Ok(self.identifiers.len() as u64)
    }
}
