// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

use async_trait::async_trait;
use crate::submission::SubmissionRecord;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Network-level failure: connection refused, timeout, pool closed.
    #[error("Remote unreachable: {0}")]
    Transport(String),
    /// The service answered with an error.
    #[error("Remote service error: {0}")]
    Backend(String),
    /// The circuit breaker rejected the call without trying it.
    #[error("Remote circuit open, call not attempted")]
    CircuitOpen,
    /// Bad URL or table name. Only raised while constructing a client.
    #[error("Remote misconfigured: {0}")]
    Config(String),
}

impl RemoteError {
    /// Failures that say the network or service is down (as opposed to a
    /// service-side error on an otherwise healthy link).
    #[must_use]
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::CircuitOpen)
    }

    /// Label for metrics
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transport(_) => "transport",
            Self::Backend(_) => "backend",
            Self::CircuitOpen => "circuit_open",
            Self::Config(_) => "config",
        }
    }
}

/// State of a one-time key on the remote side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStatus {
    /// No such key
    Missing,
    /// Exists and unused
    Free,
    /// Already consumed
    Used,
}

/// Result of the atomic insert-and-mark-used operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// History row inserted and key marked used, together.
    Consumed,
    /// Key vanished; nothing written.
    KeyMissing,
    /// Key was consumed by someone else first; nothing written.
    KeyAlreadyUsed,
}

#[async_trait]
pub trait RemoteService: Send + Sync {
    /// Point lookup in the valid-identifier table.
    async fn identifier_exists(&self, private_id: &str) -> Result<bool, RemoteError>;

    /// The full valid-identifier set (cache warmup).
    async fn valid_identifiers(&self) -> Result<Vec<String>, RemoteError>;

    async fn key_status(&self, key: &str) -> Result<KeyStatus, RemoteError>;

    /// Insert `record` and mark its key used as one atomic operation.
    /// Nothing is written unless the key exists and is unused.
    async fn consume_key(&self, record: &SubmissionRecord) -> Result<ConsumeOutcome, RemoteError>;

    /// History rows for `private_id`, newest first.
    async fn history(&self, private_id: &str) -> Result<Vec<SubmissionRecord>, RemoteError>;

    /// Cheap reachability probe.
    async fn ping(&self) -> Result<(), RemoteError>;
}
