// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Circuit-breaker decorator for a [`RemoteService`].
//!
//! Only connectivity failures count against the breaker. A backend error on
//! a healthy link (say, a constraint violation) passes through without
//! tripping it.

use async_trait::async_trait;
use std::future::Future;

use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitConfig, CircuitError, CircuitState};
use crate::submission::SubmissionRecord;
use super::traits::{ConsumeOutcome, KeyStatus, RemoteError, RemoteService};

pub struct GuardedRemote<R> {
    inner: R,
    breaker: CircuitBreaker,
}

impl<R: RemoteService> GuardedRemote<R> {
    pub fn new(inner: R, config: CircuitConfig) -> Self {
        Self {
            inner,
            breaker: CircuitBreaker::new("remote", config),
        }
    }

    #[must_use]
    pub fn inner(&self) -> &R {
        &self.inner
    }

    #[must_use]
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    #[must_use]
    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    async fn guard<T, F, Fut>(&self, f: F) -> Result<T, RemoteError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        // Backend errors ride through the Ok side so the breaker sees a success.
        let outcome = self
            .breaker
            .call(|| async {
                match f().await {
                    Err(e) if e.is_connectivity() => Err(e),
                    other => Ok(other),
                }
            })
            .await;

        match outcome {
            Ok(result) => result,
            Err(CircuitError::Rejected) => Err(RemoteError::CircuitOpen),
            Err(CircuitError::Inner(e)) => Err(e),
        }
    }
}

#[async_trait]
impl<R: RemoteService> RemoteService for GuardedRemote<R> {
    async fn identifier_exists(&self, private_id: &str) -> Result<bool, RemoteError> {
        self.guard(|| self.inner.identifier_exists(private_id)).await
    }

    async fn valid_identifiers(&self) -> Result<Vec<String>, RemoteError> {
        self.guard(|| self.inner.valid_identifiers()).await
    }

    async fn key_status(&self, key: &str) -> Result<KeyStatus, RemoteError> {
        self.guard(|| self.inner.key_status(key)).await
    }

    async fn consume_key(&self, record: &SubmissionRecord) -> Result<ConsumeOutcome, RemoteError> {
        self.guard(|| self.inner.consume_key(record)).await
    }

    async fn history(&self, private_id: &str) -> Result<Vec<SubmissionRecord>, RemoteError> {
        self.guard(|| self.inner.history(private_id)).await
    }

    async fn ping(&self) -> Result<(), RemoteError> {
        self.guard(|| self.inner.ping()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::memory::MemoryRemote;

    #[tokio::test]
    async fn test_trips_on_transport_failures_and_rejects() {
        let remote = GuardedRemote::new(
            MemoryRemote::new().with_key("K1", false),
            CircuitConfig::test(),
        );
        remote.inner().set_reachable(false);

        for _ in 0..4 {
            let _ = remote.key_status("K1").await;
        }
        let before = remote.inner().calls().key_status;

        let err = remote.key_status("K1").await.unwrap_err();
        assert_eq!(err, RemoteError::CircuitOpen);
        assert!(err.is_connectivity());
        assert_eq!(remote.inner().calls().key_status, before, "rejected call never reaches the remote");
        assert_eq!(remote.circuit_state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_backend_errors_do_not_trip() {
        let remote = GuardedRemote::new(
            MemoryRemote::new().with_key("K1", false),
            CircuitConfig::test(),
        );
        remote.inner().fail_next_consumes(10);
        let record = SubmissionRecord::now("P1", "K1");

        for _ in 0..10 {
            assert!(matches!(remote.consume_key(&record).await, Err(RemoteError::Backend(_))));
        }
        assert_eq!(remote.circuit_state(), CircuitState::Closed);
        assert_eq!(remote.breaker().rejections(), 0);
    }

    #[tokio::test]
    async fn test_recovers_after_timeout() {
        let remote = GuardedRemote::new(MemoryRemote::new(), CircuitConfig::test());
        remote.inner().set_reachable(false);
        for _ in 0..4 {
            let _ = remote.ping().await;
        }
        assert_eq!(remote.ping().await, Err(RemoteError::CircuitOpen));

        remote.inner().set_reachable(true);
        tokio::time::sleep(std::time::Duration::from_millis(80)).await;
        assert!(remote.ping().await.is_ok());
        assert_eq!(remote.circuit_state(), CircuitState::Closed);
    }
}
