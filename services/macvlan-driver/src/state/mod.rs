//! Persistent driver state.
//!
//! Network configurations and endpoints are kept in a versioned
//! key-value store so the driver can rebuild its registry after a
//! restart:
//! - [`KvStore`] is the backend seam ([`SqliteStore`] on disk,
//!   [`MemoryStore`] in tests)
//! - [`RecordStore`] encodes typed records and implements
//!   compare-and-delete with a bounded retry

mod memory;
mod record;
mod store;

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

pub use memory::MemoryStore;
pub use record::{Record, ENDPOINT_PREFIX, NETWORK_CONFIG_PREFIX};
pub use store::{KvEntry, KvStore, SqliteStore, StoreError};

/// Default number of compare-and-delete attempts.
pub const DEFAULT_DELETE_ATTEMPTS: u32 = 16;

/// Default pause between compare-and-delete attempts.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(10);

/// Bound on the compare-and-delete loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_DELETE_ATTEMPTS,
            backoff: DEFAULT_RETRY_BACKOFF,
        }
    }
}

/// Typed access to the key-value store.
#[derive(Clone)]
pub struct RecordStore {
    kv: Arc<dyn KvStore>,
    retry: RetryPolicy,
}

impl RecordStore {
    pub fn new(kv: Arc<dyn KvStore>, retry: RetryPolicy) -> Self {
        Self { kv, retry }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Write a record at its current version and adopt the new one.
    pub async fn put<R: Record>(&self, record: &mut R) -> Result<(), StoreError> {
        let key = record.key();
        let value = record.encode()?;
        let version = self
            .kv
            .put_atomic(&key, &value, record.store_version())
            .await?;
        record.set_store_version(version);
        debug!(key = %key, version, "Record stored");
        Ok(())
    }

    /// Delete a record, re-reading it on every version conflict.
    ///
    /// A record that is already gone counts as deleted. Backend failures end
    /// the loop immediately; running out of attempts yields
    /// [`StoreError::RetriesExhausted`].
    pub async fn delete<R: Record>(&self, record: &mut R) -> Result<(), StoreError> {
        let key = record.key();
        let attempts = self.retry.max_attempts.max(1);

        for attempt in 1..=attempts {
            match self.kv.delete_atomic(&key, record.store_version()).await {
                Ok(()) => {
                    debug!(key = %key, attempt, "Record deleted");
                    return Ok(());
                }
                Err(StoreError::NotFound(_)) => {
                    debug!(key = %key, "Record already deleted");
                    return Ok(());
                }
                Err(e) if e.is_conflict() => {
                    debug!(key = %key, attempt, error = %e, "Delete conflicted, refreshing record");
                    match self.kv.get(&key).await? {
                        None => return Ok(()),
                        Some(entry) => {
                            *record = R::decode(&entry.value)?;
                            record.set_store_version(entry.version);
                        }
                    }
                    if attempt < attempts && !self.retry.backoff.is_zero() {
                        tokio::time::sleep(self.retry.backoff).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        warn!(key = %key, attempts, "Giving up on record delete");
        Err(StoreError::RetriesExhausted { key, attempts })
    }

    /// Every record of one kind. Undecodable entries are skipped.
    pub async fn list<R: Record>(&self) -> Result<Vec<R>, StoreError> {
        let entries = self.kv.list(&R::list_prefix()).await?;
        let mut records = Vec::with_capacity(entries.len());

        for entry in entries {
            match R::decode(&entry.value) {
                Ok(mut record) => {
                    record.set_store_version(entry.version);
                    records.push(record);
                }
                Err(e) => {
                    warn!(key = %entry.key, kind = R::KIND, error = %e, "Skipping undecodable record");
                }
            }
        }

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Endpoint, JoinState, NetworkConfig};

    fn store(kv: &Arc<MemoryStore>) -> RecordStore {
        RecordStore::new(
            kv.clone(),
            RetryPolicy {
                max_attempts: 4,
                backoff: Duration::ZERO,
            },
        )
    }

    #[tokio::test]
    async fn test_put_tracks_version() {
        let kv = Arc::new(MemoryStore::new());
        let records = store(&kv);

        let mut ep = Endpoint::new("e1", "n1");
        records.put(&mut ep).await.unwrap();
        assert_eq!(ep.store_version, 1);

        ep.state = JoinState::Joined;
        records.put(&mut ep).await.unwrap();
        assert_eq!(ep.store_version, 2);
    }

    #[tokio::test]
    async fn test_put_with_stale_version_conflicts() {
        let kv = Arc::new(MemoryStore::new());
        let records = store(&kv);

        let mut ep = Endpoint::new("e1", "n1");
        records.put(&mut ep).await.unwrap();
        kv.touch(&ep.key());

        let err = records.put(&mut ep).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_delete_refreshes_on_conflict() {
        let kv = Arc::new(MemoryStore::new());
        let records = store(&kv);

        let mut ep = Endpoint::new("e1", "n1");
        records.put(&mut ep).await.unwrap();
        kv.touch(&ep.key());
        kv.touch(&ep.key());

        records.delete(&mut ep).await.unwrap();
        assert!(kv.is_empty());
        assert_eq!(ep.store_version, 3);
    }

    #[tokio::test]
    async fn test_delete_missing_is_success() {
        let kv = Arc::new(MemoryStore::new());
        let mut ep = Endpoint::new("e1", "n1");
        store(&kv).delete(&mut ep).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_backend_failure_is_immediate() {
        let kv = Arc::new(MemoryStore::new());
        let records = store(&kv);
        let mut config = NetworkConfig::new("n1");
        records.put(&mut config).await.unwrap();

        kv.set_available(false);
        let err = records.delete(&mut config).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_list_skips_garbage() {
        let kv = Arc::new(MemoryStore::new());
        let records = store(&kv);

        let mut ep = Endpoint::new("e1", "n1");
        records.put(&mut ep).await.unwrap();
        kv.put_atomic("macvlan/endpoint/broken", "{not json", 0)
            .await
            .unwrap();

        let listed: Vec<Endpoint> = records.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "e1");
        assert_eq!(listed[0].store_version, 1);

        let networks: Vec<NetworkConfig> = records.list().await.unwrap();
        assert!(networks.is_empty());
    }
}
