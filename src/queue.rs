// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Local durable queue of offline submissions.
//!
//! When the device is offline, submissions are written here instead of to
//! the remote service. The reconciler drains the queue once connectivity
//! returns. Entries are "in flight" to the remote, not a permanent home.
//!
//! The queue enforces entry validity and a capacity limit on top of a
//! [`SubmissionStore`], and keeps counters for observability.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::storage::traits::{RemoveReport, StorageError, SubmissionStore};
use crate::submission::{now_iso8601, QueuedSubmission, SubmissionId};

/// Queue counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    /// Entries currently queued
    pub pending: u64,
    /// Entries enqueued since startup
    pub total_enqueued: u64,
    /// Entries removed since startup
    pub total_removed: u64,
}

pub struct SubmissionQueue {
    store: Arc<dyn SubmissionStore>,
    max_items: u64,
    // Held across the capacity check and the insert
    insert_lock: Mutex<()>,
    total_enqueued: AtomicU64,
    total_removed: AtomicU64,
}

impl SubmissionQueue {
    /// Wrap `store` without touching it. The store opens on first use.
    pub fn new(store: Arc<dyn SubmissionStore>, max_items: u64) -> Self {
        Self {
            store,
            max_items,
            insert_lock: Mutex::new(()),
            total_enqueued: AtomicU64::new(0),
            total_removed: AtomicU64::new(0),
        }
    }

    /// Open the queue over `store`, reporting entries left by a previous run.
    pub async fn open(store: Arc<dyn SubmissionStore>, max_items: u64) -> Result<Self, StorageError> {
        let queue = Self::new(store, max_items);
        let pending = queue.pending_count().await?;
        if pending > 0 {
            warn!(pending, "Queue has submissions from a previous run, will reconcile");
        }
        Ok(queue)
    }

    /// Persist a new submission stamped with the current time.
    pub async fn enqueue(&self, private_id: &str, healthing_key: &str) -> Result<SubmissionId, StorageError> {
        if private_id.trim().is_empty() {
            return Err(StorageError::InvalidEntry("private_id is empty".to_string()));
        }
        if healthing_key.trim().is_empty() {
            return Err(StorageError::InvalidEntry("healthing_key is empty".to_string()));
        }

        let _insert = self.insert_lock.lock().await;
        let pending = self.store.count_submissions().await?;
        if pending >= self.max_items {
            return Err(StorageError::QueueFull {
                pending,
                max: self.max_items,
            });
        }

        let timestamp = now_iso8601();
        let id = self
            .store
            .insert_submission(private_id, healthing_key, &timestamp)
            .await?;
        self.total_enqueued.fetch_add(1, Ordering::Relaxed);
        crate::metrics::set_queue_pending(pending + 1);

        info!(id, private_id, pending = pending + 1, "Submission saved offline");
        Ok(id)
    }

    /// Snapshot of every queued entry. Order is unspecified.
    pub async fn list_all(&self) -> Result<Vec<QueuedSubmission>, StorageError> {
        self.store.list_submissions().await
    }

    /// Remove one entry. Removing an unknown id succeeds.
    pub async fn remove(&self, id: SubmissionId) -> Result<(), StorageError> {
        self.store.delete_submission(id).await?;
        self.total_removed.fetch_add(1, Ordering::Relaxed);
        debug!(id, "Submission removed from queue");
        Ok(())
    }

    /// Best-effort removal of several entries; see [`RemoveReport`].
    pub async fn remove_many(&self, ids: &[SubmissionId]) -> RemoveReport {
        let report = self.store.delete_submissions(ids).await;
        self.total_removed
            .fetch_add(report.removed.len() as u64, Ordering::Relaxed);
        if !report.is_complete() {
            warn!(
                removed = report.removed.len(),
                failed = report.failed.len(),
                "Some queued submissions could not be removed"
            );
        }
        report
    }

    pub async fn pending_count(&self) -> Result<u64, StorageError> {
        let pending = self.store.count_submissions().await?;
        crate::metrics::set_queue_pending(pending);
        Ok(pending)
    }

    pub async fn stats(&self) -> Result<QueueStats, StorageError> {
        Ok(QueueStats {
            pending: self.pending_count().await?,
            total_enqueued: self.total_enqueued.load(Ordering::Relaxed),
            total_removed: self.total_removed.load(Ordering::Relaxed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::retry::RetryConfig;
    use crate::storage::memory::MemoryStore;
    use crate::storage::sql::LocalStore;
    use chrono::DateTime;
    use tempfile::tempdir;

    async fn memory_queue(max: u64) -> SubmissionQueue {
        SubmissionQueue::open(Arc::new(MemoryStore::new()), max).await.unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_and_stats() {
        let queue = memory_queue(1000).await;

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.total_enqueued, 0);

        for i in 0..5 {
            queue.enqueue("P1", &format!("K{i}")).await.unwrap();
        }

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.pending, 5);
        assert_eq!(stats.total_enqueued, 5);
    }

    #[tokio::test]
    async fn test_enqueue_stamps_iso_timestamp() {
        let queue = memory_queue(10).await;
        let id = queue.enqueue("P1", "K1").await.unwrap();

        let all = queue.list_all().await.unwrap();
        let entry = all.iter().find(|s| s.id == id).unwrap();
        assert!(DateTime::parse_from_rfc3339(&entry.timestamp).is_ok());
    }

    #[tokio::test]
    async fn test_enqueue_rejects_empty_fields() {
        let queue = memory_queue(10).await;

        assert!(matches!(
            queue.enqueue("  ", "K1").await,
            Err(StorageError::InvalidEntry(_))
        ));
        assert!(matches!(
            queue.enqueue("P1", "").await,
            Err(StorageError::InvalidEntry(_))
        ));
        assert_eq!(queue.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_queue_full() {
        let queue = memory_queue(3).await;
        queue.enqueue("P", "K1").await.unwrap();
        queue.enqueue("P", "K2").await.unwrap();
        queue.enqueue("P", "K3").await.unwrap();

        let err = queue.enqueue("P", "K4").await.unwrap_err();
        assert!(matches!(err, StorageError::QueueFull { pending: 3, max: 3 }));
        assert!(err.to_string().contains("Queue full"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_enqueues_never_exceed_capacity() {
        let dir = tempdir().unwrap();
        let store = Arc::new(LocalStore::with_retry(dir.path().join("cap.db"), RetryConfig::test()));
        let queue = Arc::new(SubmissionQueue::new(store, 5));

        let tasks: Vec<_> = (0..20)
            .map(|i| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.enqueue("P", &format!("K{i}")).await })
            })
            .collect();

        let mut saved = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => saved += 1,
                Err(e) => assert!(matches!(e, StorageError::QueueFull { max: 5, .. }), "{e}"),
            }
        }

        assert_eq!(saved, 5);
        assert_eq!(queue.pending_count().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let queue = memory_queue(10).await;
        let id = queue.enqueue("P", "K").await.unwrap();

        queue.remove(id).await.unwrap();
        queue.remove(id).await.unwrap();
        assert_eq!(queue.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_remove_many_keeps_going_past_unknown_ids() {
        let queue = memory_queue(10).await;
        let a = queue.enqueue("P", "K1").await.unwrap();
        let b = queue.enqueue("P", "K2").await.unwrap();
        let c = queue.enqueue("P", "K3").await.unwrap();

        let report = queue.remove_many(&[a, -1, b]).await;
        assert!(report.is_complete());

        let left = queue.list_all().await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, c);
    }

    #[tokio::test]
    async fn test_queue_survives_restart() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("queue.db");

        {
            let store = Arc::new(LocalStore::with_retry(&path, RetryConfig::test()));
            let queue = SubmissionQueue::open(store.clone(), 100).await.unwrap();
            queue.enqueue("P1", "K1").await.unwrap();
            queue.enqueue("P2", "K2").await.unwrap();
            store.close().await;
        }

        let store = Arc::new(LocalStore::with_retry(&path, RetryConfig::test()));
        let queue = SubmissionQueue::open(store, 100).await.unwrap();
        assert_eq!(queue.pending_count().await.unwrap(), 2);

        let mut keys: Vec<String> = queue
            .list_all()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.healthing_key)
            .collect();
        keys.sort();
        assert_eq!(keys, vec!["K1", "K2"]);
    }
}
