// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Drains the offline queue against the remote service.
//!
//! # Per-submission protocol
//!
//! ```text
//! QUEUED ──► check key ──┬─ missing / used ──────────────► PURGED (no write)
//!                        ├─ error ───────────────────────► RETAINED
//!                        └─ free ──► consume (atomic) ──┬─ consumed ──► PURGED
//!                                                       ├─ race lost ─► PURGED
//!                                                       └─ error ─────► RETAINED
//! ```
//!
//! "Consume" inserts the history row and marks the key used in one remote
//! transaction, so there is no state where the row exists but the key is
//! still free. A purged entry is deleted from the queue right after its
//! outcome; if the process dies between the remote commit and the local
//! delete, the next pass finds the key used and purges without a second
//! insert.
//!
//! # Single flight
//!
//! Passes never overlap. A run requested while a pass is in flight returns
//! immediately with a `coalesced` report, and the in-flight runner performs
//! one more pass over a fresh snapshot before it lets go.
//!
//! # Backoff
//!
//! Retained entries back off exponentially (in memory, per entry id).
//! Automatic passes skip entries that are not yet due, and entries that used
//! up their attempts stay parked until a manual run.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::connectivity::ConnectivityMonitor;
use crate::notice::Notice;
use crate::queue::SubmissionQueue;
use crate::remote::traits::{ConsumeOutcome, KeyStatus, RemoteService};
use crate::resilience::retry::{retry, RetryConfig};
use crate::submission::{QueuedSubmission, SubmissionId};

/// What started a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Transition to online
    Connectivity,
    /// User pressed "sync now"
    Manual,
    /// Platform background-sync event
    Background,
}

impl Trigger {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connectivity => "connectivity",
            Self::Manual => "manual",
            Self::Background => "background",
        }
    }

    /// Automatic runs respect backoff; manual runs do not.
    #[must_use]
    pub fn respects_backoff(self) -> bool {
        self != Self::Manual
    }

    fn merge(self, other: Trigger) -> Trigger {
        if self == Self::Manual || other == Self::Manual {
            Self::Manual
        } else {
            self
        }
    }
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an entry was dropped without syncing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    KeyMissing,
    KeyAlreadyUsed,
}

impl std::fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::KeyMissing => write!(f, "invalid Healthing Key"),
            Self::KeyAlreadyUsed => write!(f, "Healthing Key already used"),
        }
    }
}

/// Terminal or non-terminal result for one entry in one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    /// Consumed remotely; purged
    Synced,
    /// Permanently invalid; purged with no remote write
    Discarded(DiscardReason),
    /// Transient failure; kept for a later pass
    Retained(String),
    /// Not attempted (offline, or backoff not elapsed)
    Deferred,
}

impl ItemOutcome {
    fn label(&self) -> &'static str {
        match self {
            Self::Synced => "synced",
            Self::Discarded(_) => "discarded",
            Self::Retained(_) => "retained",
            Self::Deferred => "deferred",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemFailure {
    pub id: SubmissionId,
    pub private_id: String,
    pub reason: String,
}

/// Aggregate result of a reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Entries in the snapshot
    pub total: usize,
    pub synced: usize,
    pub discarded: usize,
    pub retained: usize,
    pub deferred: usize,
    /// One line per retained entry
    pub failures: Vec<ItemFailure>,
    /// The queue could not be read; nothing was attempted
    pub storage_error: Option<String>,
    /// Folded into a pass that was already running
    pub coalesced: bool,
}

impl ReconcileReport {
    #[must_use]
    pub fn coalesced() -> Self {
        Self {
            coalesced: true,
            ..Default::default()
        }
    }

    /// Entries removed from the queue
    #[must_use]
    pub fn purged(&self) -> usize {
        self.synced + self.discarded
    }

    fn count(&mut self, outcome: &ItemOutcome) {
        match outcome {
            ItemOutcome::Synced => self.synced += 1,
            ItemOutcome::Discarded(_) => self.discarded += 1,
            ItemOutcome::Retained(_) => self.retained += 1,
            ItemOutcome::Deferred => self.deferred += 1,
        }
    }
}

impl std::fmt::Display for ReconcileReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.coalesced {
            return write!(f, "Sync already in progress.");
        }
        if let Some(e) = &self.storage_error {
            return write!(f, "Could not read offline submissions: {}", e);
        }
        write!(
            f,
            "{} synced, {} discarded, {} will be retried, {} waiting.",
            self.synced, self.discarded, self.retained, self.deferred
        )
    }
}

#[derive(Debug, Clone, Copy)]
struct Backoff {
    attempts: u32,
    not_before: Instant,
}

pub struct Reconciler {
    queue: Arc<SubmissionQueue>,
    remote: Arc<dyn RemoteService>,
    connectivity: Arc<ConnectivityMonitor>,
    notices: broadcast::Sender<Notice>,
    backoff_policy: RetryConfig,
    backoff: Mutex<HashMap<SubmissionId, Backoff>>,
    /// Held for the duration of one pass
    gate: tokio::sync::Mutex<()>,
    /// Run requested and not yet served
    pending: Mutex<Option<Trigger>>,
}

impl Reconciler {
    pub fn new(
        queue: Arc<SubmissionQueue>,
        remote: Arc<dyn RemoteService>,
        connectivity: Arc<ConnectivityMonitor>,
        notices: broadcast::Sender<Notice>,
        backoff_policy: RetryConfig,
    ) -> Self {
        Self {
            queue,
            remote,
            connectivity,
            notices,
            backoff_policy,
            backoff: Mutex::new(HashMap::new()),
            gate: tokio::sync::Mutex::new(()),
            pending: Mutex::new(None),
        }
    }

    /// Request a reconciliation and, unless one is already running, perform it.
    ///
    /// Returns the report of the first pass this call performed, or a
    /// `coalesced` report when another runner picked the request up.
    pub async fn run(&self, trigger: Trigger) -> ReconcileReport {
        {
            let mut pending = self.pending.lock();
            *pending = Some(pending.map_or(trigger, |p| p.merge(trigger)));
        }

        let mut first: Option<ReconcileReport> = None;
        loop {
            // Whoever holds the gate re-checks `pending` after releasing it.
            let Ok(guard) = self.gate.try_lock() else {
                if first.is_none() {
                    debug!(trigger = %trigger, "Reconciliation in flight, coalescing");
                    crate::metrics::record_reconcile_coalesced();
                }
                break;
            };
            let next = self.pending.lock().take();
            let Some(next) = next else {
                // A request may have landed after the take but before the release
                drop(guard);
                if self.pending.lock().is_some() {
                    continue;
                }
                break;
            };

            let report = self.pass(next).await;
            drop(guard);
            first.get_or_insert(report);
        }

        first.unwrap_or_else(ReconcileReport::coalesced)
    }

    /// True while a pass is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.gate.try_lock().is_err()
    }

    /// Entries that used up their automatic attempts.
    #[must_use]
    pub fn parked(&self) -> Vec<SubmissionId> {
        let mut ids: Vec<SubmissionId> = self
            .backoff
            .lock()
            .iter()
            .filter(|(_, b)| self.backoff_policy.exhausted(b.attempts))
            .map(|(id, _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    #[tracing::instrument(skip(self))]
    async fn pass(&self, trigger: Trigger) -> ReconcileReport {
        let start = std::time::Instant::now();
        let mut report = ReconcileReport::default();

        let mut entries = match self.queue.list_all().await {
            Ok(entries) => entries,
            Err(e) => {
                error!(error = %e, "Cannot read offline queue");
                report.storage_error = Some(e.to_string());
                self.notify(Notice::SyncComplete(report.clone()));
                return report;
            }
        };
        if entries.is_empty() {
            debug!("No offline submissions to sync");
            return report;
        }
        entries.sort_by_key(|e| e.id);
        report.total = entries.len();

        if !self.connectivity.is_online() {
            debug!(pending = entries.len(), "Offline, leaving submissions queued");
            report.deferred = entries.len();
            crate::metrics::record_reconcile_run(trigger.as_str(), start.elapsed());
            return report;
        }

        self.forget_missing(&entries);
        if !trigger.respects_backoff() {
            self.backoff.lock().clear();
        }

        info!(pending = entries.len(), "Syncing offline submissions");
        self.notify(Notice::SyncStarted { pending: entries.len() });

        let mut undeleted = Vec::new();
        for entry in &entries {
            let outcome = if !self.connectivity.is_online() {
                ItemOutcome::Deferred
            } else if trigger.respects_backoff() && !self.is_due(entry.id) {
                ItemOutcome::Deferred
            } else {
                self.process(entry).await
            };

            crate::metrics::record_reconcile_item(outcome.label());
            report.count(&outcome);

            match &outcome {
                ItemOutcome::Synced | ItemOutcome::Discarded(_) => {
                    self.backoff.lock().remove(&entry.id);
                    let removed = retry("queue_remove", &RetryConfig::query(), || {
                        self.queue.remove(entry.id)
                    })
                    .await;
                    if let Err(e) = removed {
                        warn!(id = entry.id, error = %e, "Purged submission still queued, will sweep");
                        undeleted.push(entry.id);
                    }
                    self.notify(match &outcome {
                        ItemOutcome::Discarded(reason) => Notice::ItemDiscarded {
                            private_id: entry.private_id.clone(),
                            reason: *reason,
                        },
                        _ => Notice::ItemSynced {
                            private_id: entry.private_id.clone(),
                        },
                    });
                }
                ItemOutcome::Retained(reason) => {
                    self.record_attempt(entry.id);
                    report.failures.push(ItemFailure {
                        id: entry.id,
                        private_id: entry.private_id.clone(),
                        reason: reason.clone(),
                    });
                    self.notify(Notice::ItemFailed {
                        private_id: entry.private_id.clone(),
                        reason: reason.clone(),
                    });
                }
                ItemOutcome::Deferred => {}
            }
        }

        if !undeleted.is_empty() {
            let sweep = self.queue.remove_many(&undeleted).await;
            for (id, e) in &sweep.failed {
                error!(id, error = %e, "Could not remove purged submission; next pass will discard it");
            }
        }

        let elapsed = start.elapsed();
        crate::metrics::record_reconcile_run(trigger.as_str(), elapsed);
        info!(
            total = report.total,
            synced = report.synced,
            discarded = report.discarded,
            retained = report.retained,
            deferred = report.deferred,
            elapsed_ms = elapsed.as_millis() as u64,
            "Reconciliation pass complete"
        );
        self.notify(Notice::SyncComplete(report.clone()));
        if let Ok(count) = self.queue.pending_count().await {
            self.notify(Notice::Pending { count });
        }
        report
    }

    async fn process(&self, entry: &QueuedSubmission) -> ItemOutcome {
        match self.remote.key_status(&entry.healthing_key).await {
            Ok(KeyStatus::Free) => self.connectivity.record_success(),
            Ok(KeyStatus::Missing) => {
                self.connectivity.record_success();
                info!(id = entry.id, private_id = %entry.private_id, "Invalid Healthing Key, discarding offline record");
                return ItemOutcome::Discarded(DiscardReason::KeyMissing);
            }
            Ok(KeyStatus::Used) => {
                self.connectivity.record_success();
                info!(id = entry.id, private_id = %entry.private_id, "Healthing Key already used, discarding offline record");
                return ItemOutcome::Discarded(DiscardReason::KeyAlreadyUsed);
            }
            Err(e) => {
                self.connectivity.record_failure(&e);
                warn!(id = entry.id, error = %e, "Key check failed, keeping submission queued");
                return ItemOutcome::Retained(e.to_string());
            }
        }

        match self.remote.consume_key(&entry.to_record()).await {
            Ok(ConsumeOutcome::Consumed) => {
                self.connectivity.record_success();
                info!(id = entry.id, private_id = %entry.private_id, "Offline submission synced");
                ItemOutcome::Synced
            }
            Ok(ConsumeOutcome::KeyMissing) => {
                self.connectivity.record_success();
                info!(id = entry.id, "Key vanished before consume, discarding offline record");
                ItemOutcome::Discarded(DiscardReason::KeyMissing)
            }
            Ok(ConsumeOutcome::KeyAlreadyUsed) => {
                self.connectivity.record_success();
                info!(id = entry.id, "Key consumed elsewhere first, discarding offline record");
                ItemOutcome::Discarded(DiscardReason::KeyAlreadyUsed)
            }
            Err(e) => {
                self.connectivity.record_failure(&e);
                warn!(id = entry.id, error = %e, "Consume failed, keeping submission queued");
                ItemOutcome::Retained(e.to_string())
            }
        }
    }

    fn is_due(&self, id: SubmissionId) -> bool {
        match self.backoff.lock().get(&id) {
            None => true,
            Some(b) => !self.backoff_policy.exhausted(b.attempts) && Instant::now() >= b.not_before,
        }
    }

    fn record_attempt(&self, id: SubmissionId) {
        let mut backoff = self.backoff.lock();
        let entry = backoff.entry(id).or_insert(Backoff {
            attempts: 0,
            not_before: Instant::now(),
        });
        entry.attempts += 1;
        let delay = self.backoff_policy.delay_for_attempt(entry.attempts);
        entry.not_before = Instant::now() + delay;

        if self.backoff_policy.exhausted(entry.attempts) {
            warn!(id, attempts = entry.attempts, "Submission parked until a manual sync");
        } else {
            debug!(id, attempts = entry.attempts, delay_ms = delay.as_millis() as u64, "Submission backing off");
        }
    }

    /// Drop backoff state for ids no longer in the queue.
    fn forget_missing(&self, entries: &[QueuedSubmission]) {
        let mut backoff = self.backoff.lock();
        backoff.retain(|id, _| entries.iter().any(|e| e.id == *id));
    }

    fn notify(&self, notice: Notice) {
        // no receivers is fine
        let _ = self.notices.send(notice);
    }
}
