// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Public types for the submission client.

use thiserror::Error;

use crate::remote::traits::RemoteError;
use crate::storage::traits::StorageError;
use crate::submission::SubmissionId;
use crate::validator::ValidationError;

/// Client lifecycle state.
///
/// Use [`super::SubmitClient::state()`] to check current state or
/// [`super::SubmitClient::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Just created, not yet started
    Created,
    /// Opening the local store, first probe
    Starting,
    /// Accepting submissions
    Running,
    /// Local store unusable; offline submissions cannot be saved
    Degraded,
    /// Graceful shutdown in progress
    ShuttingDown,
    Stopped,
}

impl std::fmt::Display for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Starting => write!(f, "Starting"),
            Self::Running => write!(f, "Running"),
            Self::Degraded => write!(f, "Degraded"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Where a submission ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Recorded remotely and key consumed
    Submitted,
    /// Saved locally, will sync when online
    Queued { id: SubmissionId },
}

#[derive(Error, Debug)]
pub enum SubmitError {
    #[error("Healthing Key is required")]
    EmptyKey,

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Invalid Healthing Key")]
    InvalidKey,

    #[error("This Healthing Key has already been used")]
    KeyAlreadyUsed,

    #[error("Failed to save submission offline: {0}")]
    Storage(#[from] StorageError),

    #[error("Remote service failed: {0}")]
    Remote(#[from] RemoteError),

    #[error("Submission history is not available offline")]
    HistoryOffline,
}

impl SubmitError {
    /// Failures the user can fix by changing the input.
    #[must_use]
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::EmptyKey | Self::Validation(_) | Self::InvalidKey | Self::KeyAlreadyUsed
        )
    }
}
