//! Durable key/value abstraction backing the cache across restarts.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use bytes::Bytes;
use metrics::counter;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::warn;

use crate::domain::types::ResourceType;

use super::lock;

const SOURCE: &str = "cache::kv";
const METRIC_PERSIST_ERROR_TOTAL: &str = "storefront_cache_persist_error_total";

/// Key of the per-resource fetch timestamp table. Doubles as the index of
/// page keys written in earlier sessions.
pub const FETCHED_AT_KEY: &str = "meta:fetched_at";
/// Key of the per-context freshness table.
pub const FRESHNESS_KEY: &str = "meta:context_freshness";

pub fn resource_key(resource: &ResourceType) -> String {
    format!("resource:{resource}")
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PersistenceError {
    #[error("failed to read `{key}`: {message}")]
    ReadFailed { key: String, message: String },
    #[error("failed to write `{key}`: {message}")]
    WriteFailed { key: String, message: String },
}

impl PersistenceError {
    pub fn read_failed(key: &str, message: impl std::fmt::Display) -> Self {
        Self::ReadFailed {
            key: key.to_string(),
            message: message.to_string(),
        }
    }

    pub fn write_failed(key: &str, message: impl std::fmt::Display) -> Self {
        Self::WriteFailed {
            key: key.to_string(),
            message: message.to_string(),
        }
    }
}

pub trait PersistentKv: Send + Sync {
    fn load(&self, key: &str) -> Result<Option<Bytes>, PersistenceError>;
    fn store(&self, key: &str, value: Bytes) -> Result<(), PersistenceError>;
    /// Deleting an absent key succeeds.
    fn delete(&self, key: &str) -> Result<(), PersistenceError>;
}

/// Process-local store; contents vanish with the process.
#[derive(Default)]
pub struct MemoryKv {
    entries: RwLock<HashMap<String, Bytes>>,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        lock::read(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &str) -> bool {
        lock::read(&self.entries, SOURCE, "contains").contains_key(key)
    }
}

impl PersistentKv for MemoryKv {
    fn load(&self, key: &str) -> Result<Option<Bytes>, PersistenceError> {
        Ok(lock::read(&self.entries, SOURCE, "load").get(key).cloned())
    }

    fn store(&self, key: &str, value: Bytes) -> Result<(), PersistenceError> {
        lock::write(&self.entries, SOURCE, "store").insert(key.to_string(), value);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), PersistenceError> {
        lock::write(&self.entries, SOURCE, "delete").remove(key);
        Ok(())
    }
}

/// JSON codec over an optional [`PersistentKv`].
///
/// Read problems degrade to "absent" and write problems are logged and
/// counted; neither ever reaches the caller.
#[derive(Clone, Default)]
pub(crate) struct Persistence {
    kv: Option<Arc<dyn PersistentKv>>,
}

impl Persistence {
    pub(crate) fn new(kv: Arc<dyn PersistentKv>) -> Self {
        Self { kv: Some(kv) }
    }

    pub(crate) fn disabled() -> Self {
        Self { kv: None }
    }

    pub(crate) fn read_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let kv = self.kv.as_ref()?;
        let bytes = match kv.load(key) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(err) => {
                warn!(key, error = %err, "Persisted cache entry unreadable; treating as absent");
                return None;
            }
        };

        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(err) => {
                warn!(key, error = %err, "Persisted cache entry corrupt; treating as absent");
                None
            }
        }
    }

    pub(crate) fn write_json<T: Serialize>(&self, key: &str, value: &T) {
        let Some(kv) = self.kv.as_ref() else {
            return;
        };

        let result = serde_json::to_vec(value)
            .map_err(|err| PersistenceError::write_failed(key, err))
            .and_then(|bytes| kv.store(key, Bytes::from(bytes)));

        if let Err(err) = result {
            counter!(METRIC_PERSIST_ERROR_TOTAL, "op" => "store").increment(1);
            warn!(key, error = %err, "Cache write-through failed; in-memory value kept");
        }
    }

    pub(crate) fn delete(&self, key: &str) {
        let Some(kv) = self.kv.as_ref() else {
            return;
        };

        if let Err(err) = kv.delete(key) {
            counter!(METRIC_PERSIST_ERROR_TOTAL, "op" => "delete").increment(1);
            warn!(key, error = %err, "Failed to delete persisted cache entry");
        }
    }
}

/// Run synchronous persistence work from a caller that may sit on an async
/// worker. On a multi-threaded runtime the worker hands its other tasks off
/// while `work` blocks; elsewhere `work` simply runs inline.
pub(crate) fn blocking_io<T>(work: impl FnOnce() -> T) -> T {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(work)
        }
        _ => work(),
    }
}

/// Group `(key, value)` rows by key, keeping the latest value per key.
pub(crate) fn latest_by<K: Ord, V: Ord>(rows: impl IntoIterator<Item = (K, V)>) -> BTreeMap<K, V> {
    let mut latest = BTreeMap::new();
    for (key, value) in rows {
        match latest.get(&key) {
            Some(current) if *current >= value => {}
            _ => {
                latest.insert(key, value);
            }
        }
    }
    latest
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BrokenKv;

    impl PersistentKv for BrokenKv {
        fn load(&self, key: &str) -> Result<Option<Bytes>, PersistenceError> {
            Err(PersistenceError::read_failed(key, "disk on fire"))
        }

        fn store(&self, key: &str, _value: Bytes) -> Result<(), PersistenceError> {
            Err(PersistenceError::write_failed(key, "disk on fire"))
        }

        fn delete(&self, key: &str) -> Result<(), PersistenceError> {
            Err(PersistenceError::write_failed(key, "disk on fire"))
        }
    }

    #[test]
    fn resource_keys_are_namespaced() {
        assert_eq!(resource_key(&ResourceType::Theme), "resource:theme");
        assert_eq!(
            resource_key(&ResourceType::page("/about")),
            "resource:page:/about"
        );
    }

    #[test]
    fn memory_kv_roundtrip_and_delete() {
        let kv = MemoryKv::new();
        kv.store("a", Bytes::from_static(b"1")).unwrap();
        assert_eq!(kv.load("a").unwrap(), Some(Bytes::from_static(b"1")));

        kv.delete("a").unwrap();
        kv.delete("a").unwrap();
        assert!(kv.load("a").unwrap().is_none());
        assert!(kv.is_empty());
    }

    #[test]
    fn corrupt_json_reads_as_absent() {
        let kv = Arc::new(MemoryKv::new());
        kv.store("k", Bytes::from_static(b"{not json")).unwrap();

        let persistence = Persistence::new(kv);
        assert!(persistence.read_json::<Vec<u32>>("k").is_none());
    }

    #[test]
    fn failing_backend_never_surfaces() {
        let persistence = Persistence::new(Arc::new(BrokenKv));

        persistence.write_json("k", &vec![1, 2, 3]);
        persistence.delete("k");
        assert!(persistence.read_json::<Vec<u32>>("k").is_none());
    }

    #[test]
    fn disabled_persistence_is_inert() {
        let persistence = Persistence::disabled();
        persistence.write_json("k", &1u32);
        assert!(persistence.read_json::<u32>("k").is_none());
    }

    #[test]
    fn blocking_io_runs_inline_outside_a_runtime() {
        assert_eq!(blocking_io(|| 7), 7);
    }

    #[tokio::test]
    async fn blocking_io_runs_inline_on_current_thread_runtime() {
        assert_eq!(blocking_io(|| 7), 7);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocking_io_releases_multi_thread_worker() {
        let kv = Arc::new(MemoryKv::new());
        let persistence = Persistence::new(kv.clone());

        let task = tokio::spawn(async move {
            blocking_io(|| persistence.write_json("k", &1u32));
        });
        task.await.expect("task completes");

        assert!(kv.contains("k"));
    }

    #[test]
    fn latest_by_keeps_newest() {
        let latest = latest_by([("a", 1), ("b", 5), ("a", 3), ("a", 2)]);
        assert_eq!(latest.get("a"), Some(&3));
        assert_eq!(latest.get("b"), Some(&5));
    }
}
