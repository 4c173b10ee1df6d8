//! In-memory store for tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;

use super::store::{KvEntry, KvStore, StoreError};

/// In-memory [`KvStore`] that can be switched offline.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, (String, u64)>>,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.offline.store(!available, Ordering::SeqCst);
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Whether `key` is stored.
    pub fn contains(&self, key: &str) -> bool {
        self.entries().contains_key(key)
    }

    /// Bump the version of `key` as a concurrent writer would.
    ///
    /// Returns the new version, or `None` if the key is absent.
    pub fn touch(&self, key: &str) -> Option<u64> {
        let mut entries = self.entries();
        let (_, version) = entries.get_mut(key)?;
        *version += 1;
        Some(*version)
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<String, (String, u64)>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store is offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>, StoreError> {
        self.check_online()?;
        Ok(self.entries().get(key).map(|(value, version)| KvEntry {
            key: key.to_string(),
            value: value.clone(),
            version: *version,
        }))
    }

    async fn put_atomic(&self, key: &str, value: &str, expected: u64) -> Result<u64, StoreError> {
        self.check_online()?;
        let mut entries = self.entries();
        let actual = entries.get(key).map(|(_, v)| *v).unwrap_or(0);
        if actual != expected {
            return Err(StoreError::Conflict {
                key: key.to_string(),
                expected,
                actual,
            });
        }
        let next = actual + 1;
        entries.insert(key.to_string(), (value.to_string(), next));
        Ok(next)
    }

    async fn delete_atomic(&self, key: &str, expected: u64) -> Result<(), StoreError> {
        self.check_online()?;
        let mut entries = self.entries();
        let Some((_, actual)) = entries.get(key) else {
            return Err(StoreError::NotFound(key.to_string()));
        };
        if *actual != expected {
            return Err(StoreError::Conflict {
                key: key.to_string(),
                expected,
                actual: *actual,
            });
        }
        entries.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KvEntry>, StoreError> {
        self.check_online()?;
        Ok(self
            .entries()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(key, (value, version))| KvEntry {
                key: key.clone(),
                value: value.clone(),
                version: *version,
            })
            .collect())
    }
}
