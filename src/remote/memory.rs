// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-process remote service for tests and demos.
//!
//! Behaves like [`SqlRemote`](super::sql::SqlRemote) (consume is atomic under
//! one lock) and adds knobs a real backend lacks: a reachability switch,
//! artificial latency, injected failures and per-operation call counters.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use crate::submission::SubmissionRecord;
use super::traits::{ConsumeOutcome, KeyStatus, RemoteError, RemoteService};

#[derive(Default)]
struct State {
    identifiers: HashSet<String>,
    /// key -> is_used
    keys: HashMap<String, bool>,
    history: Vec<SubmissionRecord>,
}

/// Per-operation call counts (every attempt counts, even failed ones).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CallCounts {
    pub identifier_exists: u64,
    pub valid_identifiers: u64,
    pub key_status: u64,
    pub consume_key: u64,
    pub history: u64,
    pub ping: u64,
}

impl CallCounts {
    #[must_use]
    pub fn total(&self) -> u64 {
        self.identifier_exists
            + self.valid_identifiers
            + self.key_status
            + self.consume_key
            + self.history
            + self.ping
    }
}

#[derive(Default)]
struct Counters {
    identifier_exists: AtomicU64,
    valid_identifiers: AtomicU64,
    key_status: AtomicU64,
    consume_key: AtomicU64,
    history: AtomicU64,
    ping: AtomicU64,
}

pub struct MemoryRemote {
    state: Mutex<State>,
    reachable: AtomicBool,
    latency: Mutex<Duration>,
    fail_consumes: AtomicU32,
    fail_key_checks: AtomicU32,
    calls: Counters,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            reachable: AtomicBool::new(true),
            latency: Mutex::new(Duration::ZERO),
            fail_consumes: AtomicU32::new(0),
            fail_key_checks: AtomicU32::new(0),
            calls: Counters::default(),
        }
    }

    #[must_use]
    pub fn with_identifier(self, private_id: &str) -> Self {
        self.add_identifier(private_id);
        self
    }

    #[must_use]
    pub fn with_key(self, key: &str, used: bool) -> Self {
        self.add_key(key, used);
        self
    }

    pub fn add_identifier(&self, private_id: &str) {
        self.state.lock().identifiers.insert(private_id.to_string());
    }

    pub fn remove_identifier(&self, private_id: &str) {
        self.state.lock().identifiers.remove(private_id);
    }

    pub fn add_key(&self, key: &str, used: bool) {
        self.state.lock().keys.insert(key.to_string(), used);
    }

    /// Mark a key used out-of-band, as another client would.
    pub fn consume_elsewhere(&self, key: &str) {
        if let Some(used) = self.state.lock().keys.get_mut(key) {
            *used = true;
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// The next `n` consume calls fail with a backend error after the key check.
    pub fn fail_next_consumes(&self, n: u32) {
        self.fail_consumes.store(n, Ordering::SeqCst);
    }

    /// The next `n` key status calls fail with a transport error.
    pub fn fail_next_key_checks(&self, n: u32) {
        self.fail_key_checks.store(n, Ordering::SeqCst);
    }

    /// `Some(is_used)` for a known key.
    #[must_use]
    pub fn key_used(&self, key: &str) -> Option<bool> {
        self.state.lock().keys.get(key).copied()
    }

    /// Every history row in insertion order.
    #[must_use]
    pub fn history_rows(&self) -> Vec<SubmissionRecord> {
        self.state.lock().history.clone()
    }

    /// History rows written for `key`.
    #[must_use]
    pub fn inserts_for(&self, key: &str) -> usize {
        self.state
            .lock()
            .history
            .iter()
            .filter(|r| r.healthing_key == key)
            .count()
    }

    #[must_use]
    pub fn calls(&self) -> CallCounts {
        CallCounts {
            identifier_exists: self.calls.identifier_exists.load(Ordering::SeqCst),
            valid_identifiers: self.calls.valid_identifiers.load(Ordering::SeqCst),
            key_status: self.calls.key_status.load(Ordering::SeqCst),
            consume_key: self.calls.consume_key.load(Ordering::SeqCst),
            history: self.calls.history.load(Ordering::SeqCst),
            ping: self.calls.ping.load(Ordering::SeqCst),
        }
    }

    async fn enter(&self, counter: &AtomicU64) -> Result<(), RemoteError> {
        counter.fetch_add(1, Ordering::SeqCst);
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RemoteError::Transport("connection refused".to_string()))
        }
    }

    fn take_injected(flag: &AtomicU32) -> bool {
        flag.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl RemoteService for MemoryRemote {
    async fn identifier_exists(&self, private_id: &str) -> Result<bool, RemoteError> {
        self.enter(&self.calls.identifier_exists).await?;
        Ok(self.state.lock().identifiers.contains(private_id))
    }

    async fn valid_identifiers(&self) -> Result<Vec<String>, RemoteError> {
        self.enter(&self.calls.valid_identifiers).await?;
        Ok(self.state.lock().identifiers.iter().cloned().collect())
    }

    async fn key_status(&self, key: &str) -> Result<KeyStatus, RemoteError> {
        self.enter(&self.calls.key_status).await?;
        if Self::take_injected(&self.fail_key_checks) {
            return Err(RemoteError::Transport("injected key check failure".to_string()));
        }
        Ok(match self.state.lock().keys.get(key).copied() {
            None => KeyStatus::Missing,
            Some(true) => KeyStatus::Used,
            Some(false) => KeyStatus::Free,
        })
    }

    async fn consume_key(&self, record: &SubmissionRecord) -> Result<ConsumeOutcome, RemoteError> {
        self.enter(&self.calls.consume_key).await?;
        if Self::take_injected(&self.fail_consumes) {
            return Err(RemoteError::Backend("injected consume failure".to_string()));
        }

        let mut guard = self.state.lock();
        let state = &mut *guard;
        match state.keys.get_mut(&record.healthing_key) {
            None => Ok(ConsumeOutcome::KeyMissing),
            Some(used) if *used => Ok(ConsumeOutcome::KeyAlreadyUsed),
            Some(used) => {
                *used = true;
                state.history.push(record.clone());
                Ok(ConsumeOutcome::Consumed)
            }
        }
    }

    async fn history(&self, private_id: &str) -> Result<Vec<SubmissionRecord>, RemoteError> {
        self.enter(&self.calls.history).await?;
        let mut rows: Vec<SubmissionRecord> = self
            .state
            .lock()
            .history
            .iter()
            .filter(|r| r.private_id == private_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(rows)
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        self.enter(&self.calls.ping).await
    }
}
