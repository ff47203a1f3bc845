// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Online/offline tracking.
//!
//! Two inputs drive the state:
//! - platform events ([`set_online`](ConnectivityMonitor::set_online))
//! - remote call health: a success marks the link up, and
//!   `failure_threshold` consecutive connectivity failures mark it down
//!
//! Transitions are published on a `tokio::sync::watch` channel; subscribers
//! only ever see the latest state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::remote::traits::{RemoteError, RemoteService};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    Online,
    Offline,
}

impl Connectivity {
    #[must_use]
    pub fn from_online(online: bool) -> Self {
        if online {
            Self::Online
        } else {
            Self::Offline
        }
    }

    #[must_use]
    pub fn is_online(self) -> bool {
        self == Self::Online
    }
}

impl std::fmt::Display for Connectivity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

pub struct ConnectivityMonitor {
    state: watch::Sender<Connectivity>,
    /// Consecutive connectivity failures
    failures: AtomicU64,
    failure_threshold: u64,
    /// Lock for probes (prevent overlapping pings)
    probing: Mutex<()>,
}

impl ConnectivityMonitor {
    pub fn new(initial: Connectivity, failure_threshold: u64) -> Self {
        let (state, _) = watch::channel(initial);
        crate::metrics::set_connectivity(initial.is_online());
        Self {
            state,
            failures: AtomicU64::new(0),
            failure_threshold: failure_threshold.max(1),
            probing: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn current(&self) -> Connectivity {
        *self.state.borrow()
    }

    #[must_use]
    pub fn is_online(&self) -> bool {
        self.current().is_online()
    }

    /// Receiver that wakes on every transition.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Connectivity> {
        self.state.subscribe()
    }

    /// Apply a platform-reported state. Returns true if the state changed.
    pub fn set_online(&self, online: bool) -> bool {
        let next = Connectivity::from_online(online);
        if online {
            self.failures.store(0, Ordering::Release);
        }
        let changed = self.state.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            info!(state = %next, "Connectivity changed");
            crate::metrics::set_connectivity(online);
            crate::metrics::record_connectivity_transition(&next.to_string());
        }
        changed
    }

    /// A remote call went through.
    pub fn record_success(&self) {
        self.failures.store(0, Ordering::Release);
        if !self.is_online() {
            self.set_online(true);
        }
    }

    /// A remote call failed. Only connectivity failures count toward going offline.
    pub fn record_failure(&self, error: &RemoteError) {
        if !error.is_connectivity() {
            return;
        }
        let failures = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(failures, threshold = self.failure_threshold, error = %error, "Remote connectivity failure");
        if failures >= self.failure_threshold && self.is_online() {
            warn!(failures, "Remote unreachable, switching to offline mode");
            self.set_online(false);
        }
    }

    #[must_use]
    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Acquire)
    }

    /// Ping the remote and fold the result into the state.
    pub async fn probe(&self, remote: &dyn RemoteService) -> bool {
        let _guard = self.probing.lock().await;

        match remote.ping().await {
            Ok(()) => {
                self.record_success();
                true
            }
            Err(e) => {
                self.record_failure(&e);
                false
            }
        }
    }

    /// Probe every `interval` until `shutdown` flips to true.
    pub fn spawn_probe_loop(
        self: &Arc<Self>,
        remote: Arc<dyn RemoteService>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        monitor.probe(remote.as_ref()).await;
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            debug!("Connectivity probe loop stopped");
                            break;
                        }
                    }
                }
            }
        })
    }
}
