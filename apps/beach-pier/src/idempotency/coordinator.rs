use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::store::{KeyStore, MemoryKeyStore, StoreError};

/// One accepted mutating request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdempotencyRecord {
    pub key: String,
    pub accepted_at: DateTime<Utc>,
}

impl IdempotencyRecord {
    pub fn new(key: String) -> Self {
        Self {
            key,
            accepted_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// The key was already accepted within the retention window
    DuplicateKey,
    /// No key, or an empty one, was supplied
    MissingKey,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acceptance {
    Accepted(IdempotencyRecord),
    Rejected(Rejection),
}

impl Acceptance {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Acceptance::Accepted(_))
    }
}

/// Admits each idempotency key at most once.
///
/// Payloads are never compared: two different bodies under one key are the same
/// request as far as the coordinator is concerned.
#[derive(Clone)]
pub struct IdempotencyCoordinator {
    store: Arc<dyn KeyStore>,
}

impl IdempotencyCoordinator {
    pub fn new(store: Arc<dyn KeyStore>) -> Self {
        Self { store }
    }

    /// Coordinator over a fresh in-process store.
    pub fn in_memory(retention: Option<Duration>, max_keys: Option<usize>) -> Self {
        Self::new(Arc::new(MemoryKeyStore::new(retention, max_keys)))
    }

    pub async fn try_accept(&self, key: Option<&str>) -> Result<Acceptance, StoreError> {
        let Some(key) = key.filter(|k| !k.is_empty()) else {
            counter!("beach_pier_idempotency_total", 1, "outcome" => "missing_key");
            return Ok(Acceptance::Rejected(Rejection::MissingKey));
        };

        let record = IdempotencyRecord::new(key.to_string());
        match self.store.insert_if_absent(&record).await {
            Ok(true) => {
                counter!("beach_pier_idempotency_total", 1, "outcome" => "accepted");
                debug!(key = %record.key, "idempotency key accepted");
                Ok(Acceptance::Accepted(record))
            }
            Ok(false) => {
                counter!("beach_pier_idempotency_total", 1, "outcome" => "duplicate");
                debug!(key = %record.key, "duplicate idempotency key rejected");
                Ok(Acceptance::Rejected(Rejection::DuplicateKey))
            }
            Err(err) => {
                counter!("beach_pier_idempotency_total", 1, "outcome" => "store_error");
                warn!(key = %record.key, error = %err, "idempotency store failure");
                Err(err)
            }
        }
    }

    /// Forget every key. Meant for test isolation, not for request paths.
    pub async fn reset(&self) -> Result<(), StoreError> {
        self.store.clear().await
    }

    pub async fn len(&self) -> Result<usize, StoreError> {
        self.store.len().await
    }

    /// Periodically drop expired keys until the returned handle is aborted.
    pub fn spawn_purger(&self, interval: Duration) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match store.purge_expired().await {
                    Ok(0) => {}
                    Ok(purged) => {
                        counter!("beach_pier_idempotency_keys_purged_total", purged as u64);
                        debug!(purged, "expired idempotency keys purged");
                    }
                    Err(err) => warn!(error = %err, "idempotency key purge failed"),
                }
            }
        })
    }
}

impl Default for IdempotencyCoordinator {
    fn default() -> Self {
        Self::new(Arc::new(MemoryKeyStore::unbounded()))
    }
}
