//! In-memory resource cache with write-through persistence.
//!
//! The store is the single source of truth for what the process currently
//! believes about every resource. Reads never block on the network.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use tracing::{debug, info, warn};

use crate::domain::types::{ResourceType, ResourceValue};

use super::clock::Clock;
use super::kv::{FETCHED_AT_KEY, Persistence, resource_key};
use super::lock;
use super::profile;
use super::provider::FetchError;

const SOURCE: &str = "cache::store";

/// What the store currently holds for one resource type.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub value: ResourceValue,
    /// `None` while the entry still holds its fallback value.
    pub fetched_at: Option<OffsetDateTime>,
    pub last_error: Option<FetchError>,
    /// Bumped by every write-through. A fetch only commits over the
    /// revision it was dispatched against.
    pub revision: u64,
}

impl CacheEntry {
    fn fallback(resource: &ResourceType) -> Self {
        Self {
            value: resource.fallback(),
            fetched_at: None,
            last_error: None,
            revision: 0,
        }
    }

    pub fn has_value(&self) -> bool {
        self.fetched_at.is_some()
    }
}

/// Where a fetched value ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Committed {
    /// Stored and stamped at this instant.
    Stored(OffsetDateTime),
    /// Dropped because a write-through landed while the fetch ran. Carries
    /// the stamp of the value that was kept.
    Superseded(OffsetDateTime),
}

impl Committed {
    pub fn at(self) -> OffsetDateTime {
        match self {
            Committed::Stored(at) | Committed::Superseded(at) => at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FetchStamp {
    resource: ResourceType,
    fetched_at: OffsetDateTime,
}

pub struct CacheStore {
    entries: RwLock<HashMap<ResourceType, CacheEntry>>,
    persistence: Persistence,
    // Serializes snapshot+write so an older table never overwrites a newer one.
    persist_lock: Mutex<()>,
    clock: Arc<dyn Clock>,
}

impl CacheStore {
    pub(crate) fn new(persistence: Persistence, clock: Arc<dyn Clock>) -> Self {
        let entries = profile::all_profiled_resources()
            .into_iter()
            .map(|resource| {
                let entry = CacheEntry::fallback(&resource);
                (resource, entry)
            })
            .collect();

        Self {
            entries: RwLock::new(entries),
            persistence,
            persist_lock: Mutex::new(()),
            clock,
        }
    }

    /// Restore values written by a previous process. Returns how many
    /// entries were restored.
    pub(crate) fn seed(&self) -> usize {
        let stamps: Vec<FetchStamp> = self.persistence.read_json(FETCHED_AT_KEY).unwrap_or_default();

        let mut restored = 0;
        let mut entries = lock::write(&self.entries, SOURCE, "seed");
        for stamp in stamps {
            let key = resource_key(&stamp.resource);
            let Some(value) = self.persistence.read_json::<ResourceValue>(&key) else {
                continue;
            };
            if value.kind() != stamp.resource.kind() {
                warn!(
                    key,
                    stored_kind = %value.kind(),
                    "Persisted value does not match its resource type; ignoring"
                );
                continue;
            }

            entries.insert(
                stamp.resource,
                CacheEntry {
                    value,
                    fetched_at: Some(stamp.fetched_at),
                    last_error: None,
                    revision: 0,
                },
            );
            restored += 1;
        }

        info!(restored, "Cache store seeded from persistent storage");
        restored
    }

    /// Current value, or the fallback when nothing was fetched yet. Unknown
    /// resources are not tracked by reading them.
    pub fn get(&self, resource: &ResourceType) -> ResourceValue {
        lock::read(&self.entries, SOURCE, "get")
            .get(resource)
            .map_or_else(|| resource.fallback(), |entry| entry.value.clone())
    }

    pub fn entry(&self, resource: &ResourceType) -> CacheEntry {
        lock::read(&self.entries, SOURCE, "entry")
            .get(resource)
            .cloned()
            .unwrap_or_else(|| CacheEntry::fallback(resource))
    }

    pub fn revision(&self, resource: &ResourceType) -> u64 {
        lock::read(&self.entries, SOURCE, "revision")
            .get(resource)
            .map_or(0, |entry| entry.revision)
    }

    /// Overwrite `resource` out of band, stamp it with the current time and
    /// write it through. Returns the stamp.
    pub fn set(&self, resource: &ResourceType, value: ResourceValue) -> OffsetDateTime {
        debug_assert_eq!(value.kind(), resource.kind(), "value kind mismatch");

        let now = self.clock.now();
        {
            let mut entries = lock::write(&self.entries, SOURCE, "set");
            let revision = entries.get(resource).map_or(0, |entry| entry.revision) + 1;
            entries.insert(
                resource.clone(),
                CacheEntry {
                    value,
                    fetched_at: Some(now),
                    last_error: None,
                    revision,
                },
            );
        }
        self.persist_resource(resource);

        debug!(resource = %resource, "Cache entry replaced");
        now
    }

    /// Store a fetched value unless a write-through replaced the entry after
    /// the fetch was dispatched at `dispatched_revision`.
    pub fn commit_fetch(
        &self,
        resource: &ResourceType,
        value: ResourceValue,
        dispatched_revision: u64,
    ) -> Committed {
        debug_assert_eq!(value.kind(), resource.kind(), "value kind mismatch");

        let now = self.clock.now();
        {
            let mut entries = lock::write(&self.entries, SOURCE, "commit_fetch");
            let current = entries.get(resource);
            if let Some(entry) = current
                && entry.revision != dispatched_revision
                && let Some(written_at) = entry.fetched_at
            {
                return Committed::Superseded(written_at);
            }

            let revision = current.map_or(0, |entry| entry.revision);
            entries.insert(
                resource.clone(),
                CacheEntry {
                    value,
                    fetched_at: Some(now),
                    last_error: None,
                    revision,
                },
            );
        }
        self.persist_resource(resource);

        debug!(resource = %resource, "Cache entry updated");
        Committed::Stored(now)
    }

    /// Remember a failed fetch without touching the held value.
    pub fn record_error(&self, resource: &ResourceType, error: FetchError) {
        lock::write(&self.entries, SOURCE, "record_error")
            .entry(resource.clone())
            .or_insert_with(|| CacheEntry::fallback(resource))
            .last_error = Some(error);
    }

    pub fn entry_age(&self, resource: &ResourceType) -> Option<Duration> {
        let fetched_at = self.entry(resource).fetched_at?;
        Some(self.clock.now() - fetched_at)
    }

    /// Every resource type with an entry, in a stable order.
    pub fn resources(&self) -> Vec<ResourceType> {
        let mut resources: Vec<ResourceType> = lock::read(&self.entries, SOURCE, "resources")
            .keys()
            .cloned()
            .collect();
        resources.sort();
        resources
    }

    /// Reset every entry to its fallback and drop the persisted copies.
    pub fn clear(&self) {
        let _persist = lock::lock(&self.persist_lock, SOURCE, "clear.persist");
        let mut entries = lock::write(&self.entries, SOURCE, "clear");
        for (resource, entry) in entries.iter_mut() {
            self.persistence.delete(&resource_key(resource));
            // Fetches dispatched before the reset may still commit.
            *entry = CacheEntry {
                revision: entry.revision,
                ..CacheEntry::fallback(resource)
            };
        }
        entries.retain(|resource, _| !matches!(resource, ResourceType::Page(_)));
        self.persistence.delete(FETCHED_AT_KEY);
    }

    /// Write the fetch timestamp table.
    pub fn flush(&self) {
        let _persist = lock::lock(&self.persist_lock, SOURCE, "flush");
        self.persistence
            .write_json(FETCHED_AT_KEY, &self.fetch_stamps());
    }

    fn persist_resource(&self, resource: &ResourceType) {
        let _persist = lock::lock(&self.persist_lock, SOURCE, "persist_resource");
        // Re-read under the persist lock so the newest value is the one written.
        let entry = self.entry(resource);
        if entry.has_value() {
            self.persistence
                .write_json(&resource_key(resource), &entry.value);
        }
        self.persistence
            .write_json(FETCHED_AT_KEY, &self.fetch_stamps());
    }

    fn fetch_stamps(&self) -> Vec<FetchStamp> {
        let stamps: BTreeMap<ResourceType, OffsetDateTime> =
            lock::read(&self.entries, SOURCE, "fetch_stamps")
                .iter()
                .filter_map(|(resource, entry)| {
                    entry
                        .fetched_at
                        .map(|fetched_at| (resource.clone(), fetched_at))
                })
                .collect();

        stamps
            .into_iter()
            .map(|(resource, fetched_at)| FetchStamp {
                resource,
                fetched_at,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use super::*;
    use crate::cache::clock::ManualClock;
    use crate::cache::kv::{MemoryKv, PersistentKv};
    use crate::domain::entities::{Banner, Theme, ThemeMode};

    fn store_with(kv: Arc<MemoryKv>, clock: ManualClock) -> CacheStore {
        CacheStore::new(Persistence::new(kv), Arc::new(clock))
    }

    fn banners(ids: &[&str]) -> ResourceValue {
        ResourceValue::Banners(
            ids.iter()
                .map(|id| Banner {
                    id: id.to_string(),
                    ..Banner::default()
                })
                .collect(),
        )
    }

    #[test]
    fn get_before_fetch_returns_fallback() {
        let store = store_with(Arc::new(MemoryKv::new()), ManualClock::default());

        for resource in ResourceType::SINGLETONS {
            assert_eq!(store.get(&resource), resource.fallback());
            assert!(!store.entry(&resource).has_value());
        }

        let page = ResourceType::page("/about");
        assert_eq!(store.get(&page), page.fallback());
        assert!(!store.resources().contains(&page));
    }

    #[test]
    fn set_stamps_and_writes_through() {
        let kv = Arc::new(MemoryKv::new());
        let clock = ManualClock::default();
        let store = store_with(kv.clone(), clock.clone());

        let stamped = store.set(&ResourceType::Banners, banners(&["b1"]));

        assert_eq!(stamped, clock.now());
        assert_eq!(store.get(&ResourceType::Banners), banners(&["b1"]));
        assert!(kv.contains("resource:banners"));
        assert!(kv.contains(FETCHED_AT_KEY));

        clock.advance(Duration::minutes(3));
        assert_eq!(
            store.entry_age(&ResourceType::Banners),
            Some(Duration::minutes(3))
        );
    }

    #[test]
    fn seed_restores_previous_session() {
        let kv = Arc::new(MemoryKv::new());
        let clock = ManualClock::default();
        let theme = ResourceValue::Theme(Theme {
            mode: ThemeMode::Dark,
            ..Theme::default()
        });
        let page = ResourceType::page("/shipping");

        {
            let store = store_with(kv.clone(), clock.clone());
            store.set(&ResourceType::Theme, theme.clone());
            store.set(&page, page.fallback());
        }

        let restarted = store_with(kv, clock.clone());
        assert_eq!(restarted.seed(), 2);
        assert_eq!(restarted.get(&ResourceType::Theme), theme);
        assert_eq!(
            restarted.entry(&ResourceType::Theme).fetched_at,
            Some(clock.now())
        );
        assert!(restarted.entry(&page).has_value());
    }

    #[test]
    fn seed_skips_corrupt_values() {
        let kv = Arc::new(MemoryKv::new());
        let clock = ManualClock::default();
        {
            let store = store_with(kv.clone(), clock.clone());
            store.set(&ResourceType::Banners, banners(&["b1"]));
        }
        kv.store("resource:banners", bytes::Bytes::from_static(b"\x00garbage"))
            .unwrap();

        let restarted = store_with(kv, clock);
        assert_eq!(restarted.seed(), 0);
        assert_eq!(
            restarted.get(&ResourceType::Banners),
            ResourceType::Banners.fallback()
        );
    }

    #[test]
    fn record_error_keeps_value() {
        let store = store_with(Arc::new(MemoryKv::new()), ManualClock::default());
        store.set(&ResourceType::Banners, banners(&["old"]));

        store.record_error(&ResourceType::Banners, FetchError::transient("503"));

        let entry = store.entry(&ResourceType::Banners);
        assert_eq!(entry.value, banners(&["old"]));
        assert_eq!(entry.last_error, Some(FetchError::transient("503")));
    }

    #[test]
    fn clear_resets_to_fallback_and_drops_persisted_copies() {
        let kv = Arc::new(MemoryKv::new());
        let store = store_with(kv.clone(), ManualClock::default());
        store.set(&ResourceType::Banners, banners(&["b1"]));
        store.set(&ResourceType::page("/faq"), ResourceType::page("/faq").fallback());

        store.clear();

        assert_eq!(
            store.get(&ResourceType::Banners),
            ResourceType::Banners.fallback()
        );
        assert!(!store.entry(&ResourceType::Banners).has_value());
        assert!(kv.is_empty());
    }

    #[test]
    fn fetch_commit_yields_to_newer_write_through() {
        let clock = ManualClock::default();
        let store = store_with(Arc::new(MemoryKv::new()), clock.clone());
        let dispatched = store.revision(&ResourceType::Banners);

        clock.advance(Duration::seconds(1));
        let written_at = store.set(&ResourceType::Banners, banners(&["admin"]));
        clock.advance(Duration::seconds(1));

        let committed = store.commit_fetch(&ResourceType::Banners, banners(&["old"]), dispatched);

        assert_eq!(committed, Committed::Superseded(written_at));
        assert_eq!(store.get(&ResourceType::Banners), banners(&["admin"]));
        assert_eq!(store.entry(&ResourceType::Banners).fetched_at, Some(written_at));
    }

    #[test]
    fn fetch_commit_lands_when_nothing_intervened() {
        let clock = ManualClock::default();
        let store = store_with(Arc::new(MemoryKv::new()), clock.clone());
        store.set(&ResourceType::Banners, banners(&["admin"]));
        let dispatched = store.revision(&ResourceType::Banners);

        clock.advance(Duration::minutes(1));
        let committed = store.commit_fetch(&ResourceType::Banners, banners(&["new"]), dispatched);

        assert_eq!(committed, Committed::Stored(clock.now()));
        assert_eq!(store.get(&ResourceType::Banners), banners(&["new"]));
        assert_eq!(store.revision(&ResourceType::Banners), dispatched);
    }

    #[test]
    fn fetch_commit_after_clear_is_kept() {
        let store = store_with(Arc::new(MemoryKv::new()), ManualClock::default());
        let dispatched = store.revision(&ResourceType::Theme);
        store.set(&ResourceType::Theme, ResourceType::Theme.fallback());

        // Nothing newer than the fallback is left to protect.
        store.clear();
        let committed =
            store.commit_fetch(&ResourceType::Theme, ResourceType::Theme.fallback(), dispatched);

        assert!(matches!(committed, Committed::Stored(_)));
        assert!(store.entry(&ResourceType::Theme).has_value());
    }

    #[test]
    fn store_recovers_from_poisoned_lock() {
        let store = store_with(Arc::new(MemoryKv::new()), ManualClock::default());

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = store
                .entries
                .write()
                .expect("entries lock should be acquired");
            panic!("poison entries lock");
        }));

        store.set(&ResourceType::Banners, banners(&["b1"]));
        assert_eq!(store.get(&ResourceType::Banners), banners(&["b1"]));
    }
}
