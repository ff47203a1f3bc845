// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Client lifecycle management: start, connectivity transitions, shutdown.

use std::sync::Arc;
use tracing::{debug, error, info};

use crate::cache::ValidationCache;
use crate::connectivity::Connectivity;
use crate::notice::Notice;
use crate::reconciler::{Reconciler, Trigger};

use super::{ClientState, SubmitClient, SubmitError};

/// What runs on each online/offline transition.
struct TransitionHandler {
    cache: Arc<ValidationCache>,
    reconciler: Arc<Reconciler>,
    notices: tokio::sync::broadcast::Sender<Notice>,
}

impl TransitionHandler {
    async fn handle(&self, state: Connectivity) {
        match state {
            Connectivity::Online => {
                let _ = self.notices.send(Notice::Online);
                // No ordering dependency between the two
                let (refresh, report) = tokio::join!(
                    self.cache.refresh(),
                    self.reconciler.run(Trigger::Connectivity)
                );
                debug!(?refresh, synced = report.synced, "Online transition handled");
            }
            Connectivity::Offline => {
                let _ = self.notices.send(Notice::Offline);
            }
        }
    }
}

impl SubmitClient {
    /// Start the client.
    ///
    /// Startup flow:
    /// 1. Open the local store and count submissions left by a previous run
    ///    (failure → `Degraded`, error returned)
    /// 2. Probe the remote once to learn the initial connectivity
    /// 3. Handle the initial state (online → refresh cache + reconcile,
    ///    offline → offline notice), then follow transitions in the background
    /// 4. Start the periodic probe loop if `probe_interval_ms > 0`
    #[tracing::instrument(skip(self))]
    pub async fn start(&self) -> Result<(), SubmitError> {
        let start = std::time::Instant::now();
        info!("Starting submission client...");
        self.set_state(ClientState::Starting);

        let pending = match self.queue.pending_count().await {
            Ok(pending) => pending,
            Err(e) => {
                error!(error = %e, "Local store failed to open");
                self.degrade(&e);
                return Err(e.into());
            }
        };
        if pending > 0 {
            info!(pending, "Submissions from a previous run are waiting to sync");
        }
        self.notify(Notice::Pending { count: pending });

        self.connectivity.probe(self.remote.as_ref()).await;

        let handler = TransitionHandler {
            cache: Arc::clone(&self.cache),
            reconciler: Arc::clone(&self.reconciler),
            notices: self.notices.clone(),
        };
        let mut transitions = self.connectivity.subscribe();
        let mut shutdown = self.shutdown.subscribe();

        let transition_task = tokio::spawn(async move {
            let mut current = *transitions.borrow_and_update();
            handler.handle(current).await;

            loop {
                tokio::select! {
                    changed = transitions.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let next = *transitions.borrow_and_update();
                        if next != current {
                            current = next;
                            handler.handle(next).await;
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Connectivity transition task stopped");
        });
        self.tasks.lock().push(transition_task);

        if let Some(interval) = self.config.probe_interval() {
            let probe_task = self.connectivity.spawn_probe_loop(
                Arc::clone(&self.remote),
                interval,
                self.shutdown.subscribe(),
            );
            self.tasks.lock().push(probe_task);
        }

        self.set_state(ClientState::Running);
        info!(
            online = self.connectivity.is_online(),
            pending,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Submission client running"
        );
        Ok(())
    }

    /// Initiate graceful shutdown. An in-flight reconciliation runs to completion.
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        info!("Initiating submission client shutdown...");
        self.set_state(ClientState::ShuttingDown);
        let _ = self.shutdown.send(true);

        let tasks: Vec<_> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Background task ended abnormally");
            }
        }

        if let Some(local) = &self.local {
            local.close().await;
        }

        self.set_state(ClientState::Stopped);
        info!("Submission client shutdown complete");
    }
}
