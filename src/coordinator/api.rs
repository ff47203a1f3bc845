// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Client API: submit, history, sync.
//!
//! - `submit()` - validate, then submit live or save offline
//! - `submit_scanned()` - same, after the scanner auto-submit pause
//! - `history()` - remote submission history for an id
//! - `sync_now()` / `handle_background_trigger()` - reconcile the queue

use tracing::{debug, error, info, warn};

use crate::cache::RefreshOutcome;
use crate::notice::Notice;
use crate::queue::QueueStats;
use crate::reconciler::{ReconcileReport, Trigger};
use crate::remote::traits::{ConsumeOutcome, KeyStatus};
use crate::storage::traits::StorageError;
use crate::submission::SubmissionRecord;

use super::{ClientState, SubmitClient, SubmitError, SubmitOutcome};

impl SubmitClient {
    /// Submit a key for a private id.
    ///
    /// Online, the key is checked and consumed remotely. Offline (or when the
    /// remote fails mid-submit) the submission is saved to the local queue
    /// and synced later.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// # use healthing_sync::{SubmitClient, SubmitError};
    /// # async fn example(client: &SubmitClient) {
    /// match client.submit("P-1001", "HK-7F3A").await {
    ///     Ok(outcome) => println!("{:?}", outcome),
    ///     Err(e) if e.is_rejection() => println!("rejected: {}", e),
    ///     Err(e) => eprintln!("failed: {}", e),
    /// }
    /// # }
    /// ```
    #[tracing::instrument(skip(self, healthing_key))]
    pub async fn submit(&self, private_id: &str, healthing_key: &str) -> Result<SubmitOutcome, SubmitError> {
        let _timer = crate::metrics::LatencyTimer::new("submit");

        let key = healthing_key.trim();
        if key.is_empty() {
            crate::metrics::record_submission("rejected");
            return Err(SubmitError::EmptyKey);
        }

        if let Err(e) = self.validator.validate(private_id).await {
            crate::metrics::record_submission("rejected");
            return Err(e.into());
        }
        let private_id = private_id.trim();

        if self.connectivity.is_online() {
            match self.submit_live(private_id, key).await {
                Ok(outcome) => {
                    crate::metrics::record_submission("submitted");
                    info!("Submission recorded");
                    return Ok(outcome);
                }
                Err(SubmitError::Remote(e)) => {
                    self.connectivity.record_failure(&e);
                    warn!(error = %e, "Remote submit failed, saving offline");
                }
                Err(e) => {
                    crate::metrics::record_submission("rejected");
                    return Err(e);
                }
            }
        }

        self.save_offline(private_id, key).await
    }

    /// Submit after the scanner pause (`scan_submit_delay_ms`).
    pub async fn submit_scanned(&self, private_id: &str, healthing_key: &str) -> Result<SubmitOutcome, SubmitError> {
        tokio::time::sleep(self.config.scan_submit_delay()).await;
        self.submit(private_id, healthing_key).await
    }

    async fn submit_live(&self, private_id: &str, key: &str) -> Result<SubmitOutcome, SubmitError> {
        match self.remote.key_status(key).await? {
            KeyStatus::Missing => return Err(SubmitError::InvalidKey),
            KeyStatus::Used => return Err(SubmitError::KeyAlreadyUsed),
            KeyStatus::Free => {}
        }

        let outcome = self.remote.consume_key(&SubmissionRecord::now(private_id, key)).await?;
        self.connectivity.record_success();
        match outcome {
            ConsumeOutcome::Consumed => Ok(SubmitOutcome::Submitted),
            ConsumeOutcome::KeyMissing => Err(SubmitError::InvalidKey),
            ConsumeOutcome::KeyAlreadyUsed => Err(SubmitError::KeyAlreadyUsed),
        }
    }

    async fn save_offline(&self, private_id: &str, key: &str) -> Result<SubmitOutcome, SubmitError> {
        match self.queue.enqueue(private_id, key).await {
            Ok(id) => {
                crate::metrics::record_submission("queued");
                self.notify(Notice::Saved { id });
                if let Ok(count) = self.queue.pending_count().await {
                    self.notify(Notice::Pending { count });
                }
                Ok(SubmitOutcome::Queued { id })
            }
            Err(e) => {
                error!(error = %e, "Failed to save submission offline");
                crate::metrics::record_submission("failed");
                if matches!(e, StorageError::Unavailable(_) | StorageError::Backend(_)) {
                    self.degrade(&e);
                }
                Err(e.into())
            }
        }
    }

    /// Mark the client degraded after a local store failure.
    pub(super) fn degrade(&self, e: &StorageError) {
        if self.state() != ClientState::Degraded {
            warn!(error = %e, "Local store unusable, client degraded");
            self.set_state(ClientState::Degraded);
            self.notify(Notice::Degraded { reason: e.to_string() });
        }
    }

    /// Submission history for `private_id`, newest first. Needs a connection.
    pub async fn history(&self, private_id: &str) -> Result<Vec<SubmissionRecord>, SubmitError> {
        if !self.connectivity.is_online() {
            return Err(SubmitError::HistoryOffline);
        }
        self.validator.validate(private_id).await?;

        match self.remote.history(private_id.trim()).await {
            Ok(rows) => {
                self.connectivity.record_success();
                Ok(rows)
            }
            Err(e) => {
                self.connectivity.record_failure(&e);
                Err(e.into())
            }
        }
    }

    /// Reconcile now (user action). Ignores per-submission backoff.
    pub async fn sync_now(&self) -> ReconcileReport {
        self.reconciler.run(Trigger::Manual).await
    }

    /// Handle a platform background-sync event. Returns `None` for foreign tags.
    pub async fn handle_background_trigger(&self, tag: &str) -> Option<ReconcileReport> {
        if tag != self.config.sync_tag {
            debug!(tag, "Ignoring unrelated background trigger");
            return None;
        }
        Some(self.reconciler.run(Trigger::Background).await)
    }

    /// Refresh the valid-identifier cache from the remote.
    pub async fn refresh_cache(&self) -> RefreshOutcome {
        self.cache.refresh().await
    }

    pub async fn pending_count(&self) -> Result<u64, SubmitError> {
        Ok(self.queue.pending_count().await?)
    }

    pub async fn queue_stats(&self) -> Result<QueueStats, SubmitError> {
        Ok(self.queue.stats().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SubmitClientConfig;
    use crate::connectivity::Connectivity;
    use crate::remote::memory::MemoryRemote;
    use crate::storage::memory::MemoryStore;
    use crate::validator::ValidationError;
    use std::sync::Arc;
    use std::time::Duration;

    fn client(remote: MemoryRemote, online: bool) -> (SubmitClient, Arc<MemoryRemote>) {
        let remote = Arc::new(remote);
        let client = SubmitClient::with_backends(
            SubmitClientConfig::default(),
            Arc::new(MemoryStore::new()),
            remote.clone(),
            Connectivity::from_online(online),
        );
        (client, remote)
    }

    fn seeded() -> MemoryRemote {
        MemoryRemote::new()
            .with_identifier("P1")
            .with_key("K1", false)
            .with_key("USED", true)
    }

    #[tokio::test]
    async fn test_online_submit_consumes_key() {
        let (client, remote) = client(seeded(), true);

        assert_eq!(client.submit("P1", "K1").await.unwrap(), SubmitOutcome::Submitted);
        assert_eq!(remote.key_used("K1"), Some(true));
        assert_eq!(remote.inserts_for("K1"), 1);
        assert_eq!(client.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_online_rejections() {
        let (client, remote) = client(seeded(), true);

        assert!(matches!(client.submit("P1", "  ").await, Err(SubmitError::EmptyKey)));
        assert!(matches!(client.submit("P1", "NOPE").await, Err(SubmitError::InvalidKey)));
        assert!(matches!(client.submit("P1", "USED").await, Err(SubmitError::KeyAlreadyUsed)));
        assert!(matches!(
            client.submit("NOBODY", "K1").await,
            Err(SubmitError::Validation(ValidationError::UnknownIdentifier))
        ));
        assert!(remote.history_rows().is_empty());
    }

    #[tokio::test]
    async fn test_offline_submit_queues_with_cached_id() {
        let (client, remote) = client(seeded(), true);
        client.refresh_cache().await;
        client.set_online(false);
        let mut notices = client.notices();

        let outcome = client.submit("P1", "K1").await.unwrap();
        let SubmitOutcome::Queued { id } = outcome else {
            panic!("expected queued, got {outcome:?}");
        };
        assert_eq!(notices.recv().await.unwrap(), Notice::Saved { id });
        assert_eq!(notices.recv().await.unwrap(), Notice::Pending { count: 1 });
        assert_eq!(remote.calls().key_status, 0);
    }

    #[tokio::test]
    async fn test_offline_unknown_id_not_queued() {
        let (client, _) = client(seeded(), false);
        assert!(matches!(
            client.submit("P1", "K1").await,
            Err(SubmitError::Validation(ValidationError::CannotValidateOffline))
        ));
        assert_eq!(client.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_remote_failure_mid_submit_falls_back_to_queue() {
        let (client, remote) = client(seeded(), true);
        client.refresh_cache().await;
        remote.fail_next_consumes(1);

        let outcome = client.submit("P1", "K1").await.unwrap();
        assert!(matches!(outcome, SubmitOutcome::Queued { .. }));
        assert_eq!(remote.key_used("K1"), Some(false));

        let report = client.sync_now().await;
        assert_eq!(report.synced, 1);
        assert_eq!(remote.inserts_for("K1"), 1);
    }

    #[tokio::test]
    async fn test_history_requires_online() {
        let (client, _) = client(seeded(), true);
        client.submit("P1", "K1").await.unwrap();

        let rows = client.history("P1").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].healthing_key, "K1");

        client.set_online(false);
        assert!(matches!(client.history("P1").await, Err(SubmitError::HistoryOffline)));
    }

    #[tokio::test]
    async fn test_background_trigger_tag() {
        let (client, _) = client(seeded(), true);
        assert!(client.handle_background_trigger("other-tag").await.is_none());
        assert!(client.handle_background_trigger("sync-submissions").await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_scanned_waits() {
        let (client, _) = client(seeded(), true);
        let start = tokio::time::Instant::now();

        client.submit_scanned("P1", "K1").await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(200));
    }
}
