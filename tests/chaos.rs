// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Chaos Testing for the submission client
//!
//! This module tests failure scenarios using:
//! 1. **Failing wrappers** - error injection in the local store and the remote
//! 2. **Crash simulation** - dropping the client between remote commit and local delete
//! 3. **Concurrent triggers** - many reconciliation requests racing on one queue
//!
//! # Running Chaos Tests
//! ```bash
//! cargo test --test chaos -- --nocapture
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use tokio::sync::broadcast;

use healthing_sync::{
    CircuitConfig, Connectivity, ConnectivityMonitor, ConsumeOutcome, GuardedRemote, KeyStatus,
    LocalStore, MemoryRemote, MemoryStore, Reconciler, RemoteError, RemoteService, RetryConfig,
    StorageError, SubmissionId, SubmissionQueue, SubmissionRecord, SubmissionStore, Trigger,
};
use healthing_sync::QueuedSubmission;

// =============================================================================
// Failing Wrappers - Precise Error Injection
// =============================================================================

/// A store whose list and delete calls can be switched to fail.
pub struct FailingStore<S: SubmissionStore> {
    inner: S,
    fail_deletes: AtomicBool,
    fail_lists: AtomicBool,
    delete_calls: AtomicU64,
}

impl<S: SubmissionStore> FailingStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            fail_deletes: AtomicBool::new(false),
            fail_lists: AtomicBool::new(false),
            delete_calls: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl<S: SubmissionStore> SubmissionStore for FailingStore<S> {
    async fn insert_submission(
        &self,
        private_id: &str,
        healthing_key: &str,
        timestamp: &str,
    ) -> Result<SubmissionId, StorageError> {
        self.inner.insert_submission(private_id, healthing_key, timestamp).await
    }

    async fn list_submissions(&self) -> Result<Vec<QueuedSubmission>, StorageError> {
        if self.fail_lists.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("injected list failure".into()));
        }
        self.inner.list_submissions().await
    }

    async fn delete_submission(&self, id: SubmissionId) -> Result<(), StorageError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(StorageError::Backend("injected delete failure".into()));
        }
        self.inner.delete_submission(id).await
    }

    async fn count_submissions(&self) -> Result<u64, StorageError> {
        self.inner.count_submissions().await
    }
}

/// A remote that commits the consume and then loses the response.
pub struct LostResponseRemote {
    inner: MemoryRemote,
    lose_next: AtomicU64,
}

#[async_trait]
impl RemoteService for LostResponseRemote {
    async fn identifier_exists(&self, private_id: &str) -> Result<bool, RemoteError> {
        self.inner.identifier_exists(private_id).await
    }

    async fn valid_identifiers(&self) -> Result<Vec<String>, RemoteError> {
        self.inner.valid_identifiers().await
    }

    async fn key_status(&self, key: &str) -> Result<KeyStatus, RemoteError> {
        self.inner.key_status(key).await
    }

    async fn consume_key(&self, record: &SubmissionRecord) -> Result<ConsumeOutcome, RemoteError> {
        let outcome = self.inner.consume_key(record).await?;
        let lose = self
            .lose_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if lose {
            return Err(RemoteError::Transport("connection reset after commit".into()));
        }
        Ok(outcome)
    }

    async fn history(&self, private_id: &str) -> Result<Vec<SubmissionRecord>, RemoteError> {
        self.inner.history(private_id).await
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        self.inner.ping().await
    }
}

// =============================================================================
// Helpers
// =============================================================================

struct Rig<R: RemoteService + 'static> {
    reconciler: Arc<Reconciler>,
    queue: Arc<SubmissionQueue>,
    remote: Arc<R>,
    monitor: Arc<ConnectivityMonitor>,
}

fn rig<R: RemoteService + 'static>(
    store: Arc<dyn SubmissionStore>,
    remote: Arc<R>,
    failure_threshold: u64,
) -> Rig<R> {
    let queue = Arc::new(SubmissionQueue::new(store, 10_000));
    let monitor = Arc::new(ConnectivityMonitor::new(Connectivity::Online, failure_threshold));
    let (tx, _) = broadcast::channel(1024);
    let dyn_remote: Arc<dyn RemoteService> = remote.clone();
    let reconciler = Arc::new(Reconciler::new(
        queue.clone(),
        dyn_remote,
        monitor.clone(),
        tx,
        RetryConfig::reconcile(),
    ));
    Rig {
        reconciler,
        queue,
        remote,
        monitor,
    }
}

fn keyed_remote(n: usize) -> MemoryRemote {
    let remote = MemoryRemote::new().with_identifier("P1");
    for i in 0..n {
        remote.add_key(&format!("K{i}"), false);
    }
    remote
}

// =============================================================================
// Chaos Tests - Local Store Failures
// =============================================================================

#[tokio::test]
async fn chaos_delete_fails_after_remote_commit() {
    // Remote commit succeeds, local delete fails: the entry lingers.
    // Next pass must discard it (key now used) without a second insert.
    let store = Arc::new(FailingStore::new(MemoryStore::new()));
    let r = rig(store.clone(), Arc::new(keyed_remote(1)), 3);
    r.queue.enqueue("P1", "K0").await.unwrap();

    store.fail_deletes.store(true, Ordering::SeqCst);
    let first = r.reconciler.run(Trigger::Manual).await;
    assert_eq!(first.synced, 1);
    assert_eq!(r.queue.pending_count().await.unwrap(), 1, "delete failed, entry still queued");
    assert!(store.delete_calls.load(Ordering::SeqCst) >= 2, "retried and swept");

    store.fail_deletes.store(false, Ordering::SeqCst);
    let second = r.reconciler.run(Trigger::Manual).await;
    assert_eq!(second.discarded, 1);
    assert_eq!(r.queue.pending_count().await.unwrap(), 0);
    assert_eq!(r.remote.inserts_for("K0"), 1);
}

#[tokio::test]
async fn chaos_queue_unreadable() {
    let store = Arc::new(FailingStore::new(MemoryStore::new()));
    let r = rig(store.clone(), Arc::new(keyed_remote(1)), 3);
    r.queue.enqueue("P1", "K0").await.unwrap();

    store.fail_lists.store(true, Ordering::SeqCst);
    let report = r.reconciler.run(Trigger::Manual).await;
    assert!(report.storage_error.is_some());
    assert_eq!(r.remote.calls().total(), 0);

    store.fail_lists.store(false, Ordering::SeqCst);
    assert_eq!(r.reconciler.run(Trigger::Manual).await.synced, 1);
}

// =============================================================================
// Chaos Tests - Remote Failures
// =============================================================================

#[tokio::test]
async fn chaos_consume_response_lost() {
    // The remote committed but the client saw a transport error.
    let remote = Arc::new(LostResponseRemote {
        inner: keyed_remote(1),
        lose_next: AtomicU64::new(1),
    });
    let r = rig(Arc::new(MemoryStore::new()), remote, 3);
    r.queue.enqueue("P1", "K0").await.unwrap();

    let first = r.reconciler.run(Trigger::Manual).await;
    assert_eq!(first.retained, 1);

    let second = r.reconciler.run(Trigger::Manual).await;
    assert_eq!(second.discarded, 1);
    assert_eq!(r.remote.inner.inserts_for("K0"), 1);
    assert_eq!(r.queue.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn chaos_single_flaky_key_check() {
    let r = rig(Arc::new(MemoryStore::new()), Arc::new(keyed_remote(5)), 3);
    for i in 0..5 {
        r.queue.enqueue("P1", &format!("K{i}")).await.unwrap();
    }
    r.remote.fail_next_key_checks(1);

    let report = r.reconciler.run(Trigger::Manual).await;
    assert_eq!(report.retained, 1);
    assert_eq!(report.synced, 4);
    assert_eq!(report.failures.len(), 1);
    assert!(r.monitor.is_online());
}

#[tokio::test]
async fn chaos_circuit_open_keeps_everything_queued() {
    let breaker = CircuitConfig {
        error_rate: 0.5,
        window: 2,
        half_open_calls: 1,
        recovery_timeout: Duration::from_millis(50),
    };
    let remote = Arc::new(GuardedRemote::new(keyed_remote(6), breaker));
    // high threshold: stay "online" so every entry meets the breaker
    let r = rig(Arc::new(MemoryStore::new()), remote, 1_000);
    for i in 0..6 {
        r.queue.enqueue("P1", &format!("K{i}")).await.unwrap();
    }

    r.remote.inner().set_reachable(false);
    let report = r.reconciler.run(Trigger::Manual).await;
    assert_eq!(report.retained, 6);
    assert!(report.failures.iter().any(|f| f.reason.contains("circuit open")));
    assert_eq!(r.queue.pending_count().await.unwrap(), 6);

    r.remote.inner().set_reachable(true);
    tokio::time::sleep(Duration::from_millis(80)).await;
    let report = r.reconciler.run(Trigger::Manual).await;
    assert_eq!(report.synced, 6);
    assert_eq!(r.queue.pending_count().await.unwrap(), 0);
}

// =============================================================================
// Chaos Tests - Crash and Concurrency
// =============================================================================

#[tokio::test]
async fn chaos_crash_between_commit_and_delete() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("queue.db");
    let remote = Arc::new(keyed_remote(2));

    // First life: queue two submissions, the remote consumes K0, then "crash"
    {
        let store = Arc::new(LocalStore::new(&path));
        let queue = SubmissionQueue::new(store.clone(), 100);
        queue.enqueue("P1", "K0").await.unwrap();
        queue.enqueue("P1", "K1").await.unwrap();
        remote
            .consume_key(&SubmissionRecord::now("P1", "K0"))
            .await
            .unwrap();
        store.close().await;
    }

    // Second life: reopen and reconcile
    let store = Arc::new(LocalStore::new(&path));
    let r = rig(store, remote, 3);
    let report = r.reconciler.run(Trigger::Connectivity).await;

    assert_eq!(report.total, 2);
    assert_eq!(report.discarded, 1);
    assert_eq!(report.synced, 1);
    assert_eq!(r.remote.inserts_for("K0"), 1);
    assert_eq!(r.remote.inserts_for("K1"), 1);
    assert_eq!(r.queue.pending_count().await.unwrap(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn chaos_many_concurrent_triggers() {
    let remote = keyed_remote(20);
    remote.set_latency(Duration::from_millis(1));
    let r = rig(Arc::new(MemoryStore::new()), Arc::new(remote), 3);
    for i in 0..20 {
        r.queue.enqueue("P1", &format!("K{i}")).await.unwrap();
    }

    let mut handles = Vec::new();
    for i in 0..10 {
        let reconciler = r.reconciler.clone();
        let trigger = match i % 3 {
            0 => Trigger::Connectivity,
            1 => Trigger::Manual,
            _ => Trigger::Background,
        };
        handles.push(tokio::spawn(async move { reconciler.run(trigger).await }));
    }

    let mut synced = 0;
    for h in handles {
        synced += h.await.unwrap().synced;
    }

    assert_eq!(synced, 20);
    for i in 0..20 {
        assert_eq!(r.remote.inserts_for(&format!("K{i}")), 1, "K{i} inserted once");
    }
    assert_eq!(r.queue.pending_count().await.unwrap(), 0);
}
