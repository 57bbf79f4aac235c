//! Write-through invalidation for out-of-band resource mutations.

use std::sync::Arc;

use metrics::counter;
use tracing::info;

use crate::domain::types::{ResourceType, ResourceValue};

use super::events::{NotificationBus, Topic};
use super::freshness::ContextFreshness;
use super::store::CacheStore;

const METRIC_INVALIDATION_TOTAL: &str = "storefront_cache_invalidation_total";

/// Applies admin-side writes to the cache without going through a fetch,
/// then tells whoever subscribed.
pub struct InvalidationBroadcaster {
    store: Arc<CacheStore>,
    freshness: Arc<ContextFreshness>,
    bus: Arc<NotificationBus>,
}

impl InvalidationBroadcaster {
    pub fn new(
        store: Arc<CacheStore>,
        freshness: Arc<ContextFreshness>,
        bus: Arc<NotificationBus>,
    ) -> Self {
        Self {
            store,
            freshness,
            bus,
        }
    }

    pub fn invalidate_and_set(&self, resource: &ResourceType, value: ResourceValue) {
        let stamped_at = self.store.set(resource, value);
        let contexts = self.freshness.stamp_propagated(None, resource, stamped_at);

        counter!(METRIC_INVALIDATION_TOTAL, "resource" => resource.kind().as_str()).increment(1);
        info!(
            resource = %resource,
            contexts = ?contexts,
            "Cache entry replaced by write-through"
        );

        self.bus.publish(Topic::CacheChanged, Some(resource.clone()));
    }

    /// Announce that the reward settings changed. No cache entry is touched.
    pub fn gamification_updated(&self) {
        self.bus.publish(Topic::GamificationUpdated, None);
    }

    /// Announce a full reset.
    pub fn cache_cleared(&self) {
        self.bus.publish(Topic::CacheChanged, None);
    }
}
