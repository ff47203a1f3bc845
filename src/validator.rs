// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Private id validation: local cache first, remote on a miss.
//!
//! ```text
//! empty?            -> EmptyIdentifier
//! cache hit?        -> valid (Cache)
//! offline?          -> CannotValidateOffline
//! remote exists?    -> record_valid, valid (Remote)
//! remote not found  -> UnknownIdentifier
//! remote failed     -> Unavailable
//! ```

use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cache::ValidationCache;
use crate::connectivity::ConnectivityMonitor;
use crate::remote::traits::{RemoteError, RemoteService};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Private ID is required")]
    EmptyIdentifier,
    #[error("Cannot validate this Private ID while offline")]
    CannotValidateOffline,
    #[error("Unknown Private ID")]
    UnknownIdentifier,
    /// The remote could not answer; the id may well be valid.
    #[error("Private ID validation is unavailable right now")]
    Unavailable(#[source] RemoteError),
}

/// Where a positive answer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationSource {
    Cache,
    Remote,
}

pub struct IdentifierValidator {
    cache: Arc<ValidationCache>,
    remote: Arc<dyn RemoteService>,
    connectivity: Arc<ConnectivityMonitor>,
}

impl IdentifierValidator {
    pub fn new(
        cache: Arc<ValidationCache>,
        remote: Arc<dyn RemoteService>,
        connectivity: Arc<ConnectivityMonitor>,
    ) -> Self {
        Self {
            cache,
            remote,
            connectivity,
        }
    }

    #[tracing::instrument(skip(self))]
    pub async fn validate(&self, private_id: &str) -> Result<ValidationSource, ValidationError> {
        let private_id = private_id.trim();
        if private_id.is_empty() {
            crate::metrics::record_validation("empty");
            return Err(ValidationError::EmptyIdentifier);
        }

        if self.cache.is_known_valid(private_id).await {
            debug!("Identifier cache hit");
            crate::metrics::record_validation("cache_hit");
            return Ok(ValidationSource::Cache);
        }

        if !self.connectivity.is_online() {
            crate::metrics::record_validation("offline");
            return Err(ValidationError::CannotValidateOffline);
        }

        match self.remote.identifier_exists(private_id).await {
            Ok(true) => {
                self.connectivity.record_success();
                self.cache.record_valid(private_id).await;
                crate::metrics::record_validation("remote_valid");
                Ok(ValidationSource::Remote)
            }
            Ok(false) => {
                self.connectivity.record_success();
                info!("Identifier not found remotely");
                crate::metrics::record_validation("unknown");
                Err(ValidationError::UnknownIdentifier)
            }
            Err(e) => {
                self.connectivity.record_failure(&e);
                warn!(error = %e, "Identifier validation unavailable");
                crate::metrics::record_validation("unavailable");
                Err(ValidationError::Unavailable(e))
            }
        }
    }
}
