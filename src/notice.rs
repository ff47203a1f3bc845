// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! User-facing status messages.
//!
//! The client publishes these on a broadcast channel; a UI renders them with
//! `Display`. Each message carries its own context, so a raw error string
//! never reaches the user on its own.

use crate::reconciler::{DiscardReason, ReconcileReport};
use crate::submission::SubmissionId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// Persistent indicator while offline
    Offline,
    Online,
    /// A submission was queued locally
    Saved { id: SubmissionId },
    /// Queue depth changed
    Pending { count: u64 },
    SyncStarted { pending: usize },
    ItemSynced { private_id: String },
    ItemDiscarded { private_id: String, reason: DiscardReason },
    /// Kept in the queue for a later pass
    ItemFailed { private_id: String, reason: String },
    SyncComplete(ReconcileReport),
    /// Storage is unusable; offline submissions cannot be saved
    Degraded { reason: String },
}

impl std::fmt::Display for Notice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Offline => write!(f, "You are currently offline. Submissions will be saved locally."),
            Self::Online => write!(f, "Back online."),
            Self::Saved { .. } => write!(
                f,
                "Submission saved offline. It will sync when you are back online."
            ),
            Self::Pending { count } => write!(f, "{} submission(s) waiting to sync.", count),
            Self::SyncStarted { pending } => {
                write!(f, "Syncing {} offline submission(s)...", pending)
            }
            Self::ItemSynced { private_id } => {
                write!(f, "Successfully synced submission for Private ID: {}", private_id)
            }
            Self::ItemDiscarded { private_id, reason } => write!(
                f,
                "Discarded offline submission for Private ID: {} ({})",
                private_id, reason
            ),
            Self::ItemFailed { private_id, reason } => write!(
                f,
                "Failed to sync for Private ID: {}. Reason: {}. It will be retried.",
                private_id, reason
            ),
            Self::SyncComplete(report) => write!(f, "Sync complete. {}", report),
            Self::Degraded { reason } => write!(f, "App cannot function offline: {}", reason),
        }
    }
}
