// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Local cache of identifiers known to be valid remotely.
//!
//! Lets a private id be validated while offline. Presence means "valid as
//! of the last refresh"; an entry may be stale but is never invented, since
//! everything in the cache came from the remote service.
//!
//! Refresh policy: a refresh replaces the whole set in one transaction, so
//! identifiers revoked remotely drop out. Between refreshes,
//! [`record_valid`](ValidationCache::record_valid) adds ids confirmed by a
//! live remote lookup.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::connectivity::ConnectivityMonitor;
use crate::remote::traits::RemoteService;
use crate::storage::traits::IdentifierCacheStore;

/// What a refresh did. Informational only; refresh never fails the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// Offline, nothing attempted
    Skipped,
    /// Cache replaced with this many identifiers
    Refreshed(usize),
    /// Remote or local failure (already logged)
    Failed(String),
}

pub struct ValidationCache {
    store: Arc<dyn IdentifierCacheStore>,
    remote: Arc<dyn RemoteService>,
    connectivity: Arc<ConnectivityMonitor>,
}

impl ValidationCache {
    pub fn new(
        store: Arc<dyn IdentifierCacheStore>,
        remote: Arc<dyn RemoteService>,
        connectivity: Arc<ConnectivityMonitor>,
    ) -> Self {
        Self {
            store,
            remote,
            connectivity,
        }
    }

    /// Fetch the full identifier set and replace the local copy.
    #[tracing::instrument(skip(self))]
    pub async fn refresh(&self) -> RefreshOutcome {
        if !self.connectivity.is_online() {
            debug!("Offline, skipping identifier cache refresh");
            crate::metrics::record_cache_refresh("skipped");
            return RefreshOutcome::Skipped;
        }

        let ids = match self.remote.valid_identifiers().await {
            Ok(ids) => {
                self.connectivity.record_success();
                ids
            }
            Err(e) => {
                self.connectivity.record_failure(&e);
                warn!(error = %e, "Could not fetch valid identifiers");
                crate::metrics::record_cache_refresh("failed");
                return RefreshOutcome::Failed(e.to_string());
            }
        };

        match self.store.replace_identifiers(&ids).await {
            Ok(count) => {
                info!(count, "Identifier cache refreshed");
                crate::metrics::record_cache_refresh("refreshed");
                crate::metrics::set_identifier_cache_entries(count as u64);
                RefreshOutcome::Refreshed(count)
            }
            Err(e) => {
                warn!(error = %e, "Could not store refreshed identifiers");
                crate::metrics::record_cache_refresh("failed");
                RefreshOutcome::Failed(e.to_string())
            }
        }
    }

    /// Local lookup only. A local read error counts as a miss.
    pub async fn is_known_valid(&self, private_id: &str) -> bool {
        match self.store.contains_identifier(private_id).await {
            Ok(hit) => hit,
            Err(e) => {
                warn!(error = %e, "Identifier cache read failed, treating as miss");
                false
            }
        }
    }

    /// Memoize an identifier the remote just confirmed.
    pub async fn record_valid(&self, private_id: &str) {
        if let Err(e) = self.store.remember_identifier(private_id).await {
            warn!(private_id, error = %e, "Could not cache validated identifier");
        }
    }

    pub async fn entry_count(&self) -> u64 {
        self.store.count_identifiers().await.unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connectivity::Connectivity;
    use crate::remote::memory::MemoryRemote;
    use crate::storage::memory::MemoryStore;

    fn cache(remote: Arc<MemoryRemote>, online: bool) -> (ValidationCache, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let monitor = Arc::new(ConnectivityMonitor::new(Connectivity::from_online(online), 3));
        (ValidationCache::new(store.clone(), remote, monitor), store)
    }

    #[tokio::test]
    async fn test_refresh_replaces_whole_set() {
        let remote = Arc::new(MemoryRemote::new().with_identifier("P1").with_identifier("P2"));
        let (cache, _) = cache(remote.clone(), true);

        assert_eq!(cache.refresh().await, RefreshOutcome::Refreshed(2));
        assert!(cache.is_known_valid("P1").await);

        remote.remove_identifier("P1");
        assert_eq!(cache.refresh().await, RefreshOutcome::Refreshed(1));
        assert!(!cache.is_known_valid("P1").await);
        assert!(cache.is_known_valid("P2").await);
    }

    #[tokio::test]
    async fn test_refresh_offline_is_noop() {
        let remote = Arc::new(MemoryRemote::new().with_identifier("P1"));
        let (cache, _) = cache(remote.clone(), false);

        assert_eq!(cache.refresh().await, RefreshOutcome::Skipped);
        assert_eq!(remote.calls().total(), 0);
        assert_eq!(cache.entry_count().await, 0);
    }

    #[tokio::test]
    async fn test_refresh_failure_keeps_old_entries() {
        let remote = Arc::new(MemoryRemote::new().with_identifier("P1"));
        let (cache, _) = cache(remote.clone(), true);
        cache.refresh().await;

        remote.set_reachable(false);
        assert!(matches!(cache.refresh().await, RefreshOutcome::Failed(_)));
        assert!(cache.is_known_valid("P1").await);
    }

    #[tokio::test]
    async fn test_record_valid_is_local_and_idempotent() {
        let remote = Arc::new(MemoryRemote::new());
        let (cache, _) = cache(remote.clone(), false);

        cache.record_valid("P9").await;
        cache.record_valid("P9").await;
        assert!(cache.is_known_valid("P9").await);
        assert_eq!(cache.entry_count().await, 1);
        assert_eq!(remote.calls().total(), 0);
    }
}
