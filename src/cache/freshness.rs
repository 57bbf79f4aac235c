//! Per-context freshness bookkeeping.
//!
//! Records, for each context, the last moment it is known to hold a fresh
//! copy of a resource type, whether it fetched the resource itself or a
//! sibling context's fetch was propagated to it.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::domain::types::{ContextName, ResourceType};

use super::kv::{FRESHNESS_KEY, Persistence, latest_by};
use super::lock;
use super::policy::StalenessPolicy;
use super::profile;

const SOURCE: &str = "cache::freshness";

type Stamps = HashMap<ContextName, HashMap<ResourceType, OffsetDateTime>>;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FreshnessRecord {
    context: ContextName,
    resource: ResourceType,
    stamped_at: OffsetDateTime,
}

pub struct ContextFreshness {
    stamps: RwLock<Stamps>,
    persistence: Persistence,
    persist_lock: Mutex<()>,
}

impl ContextFreshness {
    pub(crate) fn new(persistence: Persistence) -> Self {
        Self {
            stamps: RwLock::new(HashMap::new()),
            persistence,
            persist_lock: Mutex::new(()),
        }
    }

    /// Restore the table written by a previous process.
    pub(crate) fn seed(&self) -> usize {
        let records: Vec<FreshnessRecord> =
            self.persistence.read_json(FRESHNESS_KEY).unwrap_or_default();
        let latest = latest_by(
            records
                .into_iter()
                .map(|record| ((record.context, record.resource), record.stamped_at)),
        );

        let restored = latest.len();
        let mut stamps = lock::write(&self.stamps, SOURCE, "seed");
        for ((context, resource), stamped_at) in latest {
            stamps
                .entry(context)
                .or_default()
                .insert(resource, stamped_at);
        }
        restored
    }

    #[cfg(test)]
    pub fn get(&self, context: ContextName, resource: &ResourceType) -> Option<OffsetDateTime> {
        lock::read(&self.stamps, SOURCE, "get")
            .get(&context)
            .and_then(|resources| resources.get(resource))
            .copied()
    }

    /// True when any context holds a stamp for `resource` within its TTL.
    pub fn any_fresh(
        &self,
        resource: &ResourceType,
        policy: &StalenessPolicy,
        now: OffsetDateTime,
    ) -> bool {
        lock::read(&self.stamps, SOURCE, "any_fresh")
            .values()
            .filter_map(|resources| resources.get(resource))
            .any(|stamped_at| policy.is_fresh(resource.kind(), *stamped_at, now))
    }

    /// Stamp `resource` fresh for `origin` and for every context whose
    /// profile requires it. Returns the contexts that were stamped. The
    /// table is only rewritten when a stamp moved.
    pub fn stamp_propagated(
        &self,
        origin: Option<ContextName>,
        resource: &ResourceType,
        at: OffsetDateTime,
    ) -> Vec<ContextName> {
        let mut contexts: Vec<ContextName> = profile::contexts_requiring(resource).collect();
        if let Some(origin) = origin
            && !contexts.contains(&origin)
        {
            contexts.push(origin);
        }

        let mut moved = false;
        {
            let mut stamps = lock::write(&self.stamps, SOURCE, "stamp_propagated");
            for context in &contexts {
                moved |= stamp_one(&mut stamps, *context, resource, at);
            }
        }
        if moved {
            self.persist();
        }
        contexts
    }

    /// Stamp a single context.
    pub fn stamp(&self, context: ContextName, resource: &ResourceType, at: OffsetDateTime) {
        let moved = stamp_one(
            &mut lock::write(&self.stamps, SOURCE, "stamp"),
            context,
            resource,
            at,
        );
        if moved {
            self.persist();
        }
    }

    /// Contexts currently holding a fresh stamp for `resource`.
    pub fn fresh_contexts(
        &self,
        resource: &ResourceType,
        policy: &StalenessPolicy,
        now: OffsetDateTime,
    ) -> Vec<ContextName> {
        let stamps = lock::read(&self.stamps, SOURCE, "fresh_contexts");
        let mut contexts: Vec<ContextName> = stamps
            .iter()
            .filter(|(_, resources)| {
                resources
                    .get(resource)
                    .is_some_and(|stamped_at| policy.is_fresh(resource.kind(), *stamped_at, now))
            })
            .map(|(context, _)| *context)
            .collect();
        contexts.sort();
        contexts
    }

    pub fn clear(&self) {
        let _persist = lock::lock(&self.persist_lock, SOURCE, "clear.persist");
        lock::write(&self.stamps, SOURCE, "clear").clear();
        self.persistence.delete(FRESHNESS_KEY);
    }

    pub fn flush(&self) {
        self.persist();
    }

    fn persist(&self) {
        let _persist = lock::lock(&self.persist_lock, SOURCE, "persist");
        let mut records: Vec<FreshnessRecord> = lock::read(&self.stamps, SOURCE, "persist")
            .iter()
            .flat_map(|(context, resources)| {
                resources
                    .iter()
                    .map(|(resource, stamped_at)| FreshnessRecord {
                        context: *context,
                        resource: resource.clone(),
                        stamped_at: *stamped_at,
                    })
            })
            .collect();
        records.sort_by(|a, b| (a.context, &a.resource).cmp(&(b.context, &b.resource)));
        self.persistence.write_json(FRESHNESS_KEY, &records);
    }
}

// Stamps only move forward. Returns whether the table changed.
fn stamp_one(
    stamps: &mut Stamps,
    context: ContextName,
    resource: &ResourceType,
    at: OffsetDateTime,
) -> bool {
    let resources = stamps.entry(context).or_default();
    match resources.get_mut(resource) {
        Some(slot) if *slot >= at => false,
        Some(slot) => {
            *slot = at;
            true
        }
        None => {
            resources.insert(resource.clone(), at);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bytes::Bytes;
    use time::Duration;

    use super::*;
    use crate::cache::kv::{MemoryKv, PersistenceError, PersistentKv};

    fn now() -> OffsetDateTime {
        time::macros::datetime!(2026-05-10 08:00 UTC)
    }

    #[test]
    fn propagation_reaches_every_profile_owner() {
        let freshness = ContextFreshness::new(Persistence::disabled());

        let stamped =
            freshness.stamp_propagated(Some(ContextName::Storefront), &ResourceType::Footer, now());

        assert_eq!(stamped, vec![ContextName::Storefront, ContextName::Admin]);
        assert_eq!(
            freshness.get(ContextName::Admin, &ResourceType::Footer),
            Some(now())
        );
        assert_eq!(
            freshness.get(ContextName::Delivery, &ResourceType::Footer),
            None
        );
    }

    #[test]
    fn pages_stamp_only_the_origin() {
        let freshness = ContextFreshness::new(Persistence::disabled());
        let page = ResourceType::page("/about");

        let stamped = freshness.stamp_propagated(Some(ContextName::Delivery), &page, now());

        assert_eq!(stamped, vec![ContextName::Delivery]);
    }

    #[test]
    fn stamps_are_never_backdated() {
        let freshness = ContextFreshness::new(Persistence::disabled());
        freshness.stamp(ContextName::Admin, &ResourceType::Logo, now());
        freshness.stamp(
            ContextName::Admin,
            &ResourceType::Logo,
            now() - Duration::hours(1),
        );

        assert_eq!(
            freshness.get(ContextName::Admin, &ResourceType::Logo),
            Some(now())
        );
    }

    #[test]
    fn any_fresh_respects_ttl() {
        let policy = StalenessPolicy::default();
        let freshness = ContextFreshness::new(Persistence::disabled());
        freshness.stamp(ContextName::Storefront, &ResourceType::HomepageSections, now());

        assert!(freshness.any_fresh(
            &ResourceType::HomepageSections,
            &policy,
            now() + Duration::minutes(40)
        ));
        assert!(!freshness.any_fresh(
            &ResourceType::HomepageSections,
            &policy,
            now() + Duration::hours(3)
        ));
        assert!(!freshness.any_fresh(&ResourceType::Banners, &policy, now()));
    }

    #[test]
    fn table_survives_restart() {
        let kv = Arc::new(MemoryKv::new());
        let freshness = ContextFreshness::new(Persistence::new(kv.clone()));
        freshness.stamp_propagated(None, &ResourceType::Theme, now());

        let restarted = ContextFreshness::new(Persistence::new(kv));
        assert_eq!(restarted.seed(), ContextName::ALL.len());
        assert_eq!(
            restarted.get(ContextName::Delivery, &ResourceType::Theme),
            Some(now())
        );
    }

    #[derive(Default)]
    struct CountingKv {
        inner: MemoryKv,
        stores: AtomicUsize,
    }

    impl PersistentKv for CountingKv {
        fn load(&self, key: &str) -> Result<Option<Bytes>, PersistenceError> {
            self.inner.load(key)
        }

        fn store(&self, key: &str, value: Bytes) -> Result<(), PersistenceError> {
            self.stores.fetch_add(1, Ordering::SeqCst);
            self.inner.store(key, value)
        }

        fn delete(&self, key: &str) -> Result<(), PersistenceError> {
            self.inner.delete(key)
        }
    }

    #[test]
    fn unchanged_stamps_do_not_rewrite_the_table() {
        let kv = Arc::new(CountingKv::default());
        let freshness = ContextFreshness::new(Persistence::new(kv.clone()));

        freshness.stamp_propagated(Some(ContextName::Admin), &ResourceType::Theme, now());
        assert_eq!(kv.stores.load(Ordering::SeqCst), 1);

        // A joiner re-stamping the same fetch, or an older one, changes nothing.
        freshness.stamp(ContextName::Admin, &ResourceType::Theme, now());
        freshness.stamp(ContextName::Delivery, &ResourceType::Theme, now() - Duration::minutes(1));
        freshness.stamp_propagated(Some(ContextName::Shared), &ResourceType::Theme, now());
        assert_eq!(kv.stores.load(Ordering::SeqCst), 1);

        freshness.stamp(ContextName::Admin, &ResourceType::Theme, now() + Duration::minutes(1));
        assert_eq!(kv.stores.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn clear_forgets_everything() {
        let kv = Arc::new(MemoryKv::new());
        let freshness = ContextFreshness::new(Persistence::new(kv.clone()));
        freshness.stamp(ContextName::Admin, &ResourceType::Theme, now());

        freshness.clear();

        assert_eq!(freshness.get(ContextName::Admin, &ResourceType::Theme), None);
        assert!(kv.is_empty());
    }
}
