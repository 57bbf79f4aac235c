//! Public face of the cache: typed reads for rendering, typed writes for
//! admin save paths and the control surface used by each UI shell.

use std::sync::Arc;

use time::Duration;
use tracing::{info, instrument, warn};

use crate::domain::entities::{
    Banner, Brand, Category, Footer, HomepageSection, Logo, StaticPage, Theme,
};
use crate::domain::types::{ContextName, ResourceType, ResourceValue};

use super::clock::Clock;
use super::config::CacheConfig;
use super::debounce::DebounceGuard;
use super::events::{Notification, NotificationBus, Subscription, Topic};
use super::freshness::ContextFreshness;
use super::initializer::{ContextInitializer, InitializeReport};
use super::invalidation::InvalidationBroadcaster;
use super::kv::{Persistence, PersistentKv, blocking_io};
use super::policy::StalenessPolicy;
use super::provider::{FetchError, ResourceProvider};
use super::stats::{CacheStats, ResourceStats};
use super::store::{CacheEntry, CacheStore};

/// Shared configuration cache for the storefront, admin and delivery shells.
///
/// Construct one per process and hand out references; there is no global
/// instance.
pub struct CacheService {
    store: Arc<CacheStore>,
    freshness: Arc<ContextFreshness>,
    debounce: Arc<DebounceGuard>,
    policy: Arc<StalenessPolicy>,
    bus: Arc<NotificationBus>,
    initializer: ContextInitializer,
    broadcaster: InvalidationBroadcaster,
    clock: Arc<dyn Clock>,
}

impl CacheService {
    /// Build the service and seed it from `kv`.
    ///
    /// Persistence is skipped when `kv` is `None` or `config.persist` is off.
    ///
    /// # Panics
    ///
    /// Panics if `config` carries a non-positive TTL. Settings loaded through
    /// [`crate::config`] are validated before they get here.
    pub fn new(
        config: &CacheConfig,
        provider: Arc<dyn ResourceProvider>,
        kv: Option<Arc<dyn PersistentKv>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let persistence = match kv {
            Some(kv) if config.persist => Persistence::new(kv),
            _ => Persistence::disabled(),
        };

        let policy = Arc::new(config.staleness_policy());
        let store = Arc::new(CacheStore::new(persistence.clone(), clock.clone()));
        let freshness = Arc::new(ContextFreshness::new(persistence));
        let debounce = Arc::new(DebounceGuard::new(config.debounce_window()));
        let bus = Arc::new(NotificationBus::new(clock.clone()));

        let (restored, stamps) = blocking_io(|| (store.seed(), freshness.seed()));
        info!(
            restored,
            freshness_stamps = stamps,
            debounce_window = %debounce.window(),
            fetch_timeout_ms = config.fetch_timeout_ms,
            "Cache service ready"
        );

        let initializer = ContextInitializer::new(
            store.clone(),
            freshness.clone(),
            debounce.clone(),
            provider,
            policy.clone(),
            clock.clone(),
            config.fetch_timeout(),
        );
        let broadcaster = InvalidationBroadcaster::new(store.clone(), freshness.clone(), bus.clone());

        Self {
            store,
            freshness,
            debounce,
            policy,
            bus,
            initializer,
            broadcaster,
            clock,
        }
    }

    pub fn get(&self, resource: &ResourceType) -> ResourceValue {
        self.store.get(resource)
    }

    pub fn entry(&self, resource: &ResourceType) -> CacheEntry {
        self.store.entry(resource)
    }

    /// Time since `resource` was last fetched or written; `None` while it
    /// still holds its fallback.
    pub fn entry_age(&self, resource: &ResourceType) -> Option<Duration> {
        self.store.entry_age(resource)
    }

    pub fn get_theme(&self) -> Theme {
        match self.store.get(&ResourceType::Theme) {
            ResourceValue::Theme(theme) => theme,
            _ => Theme::default(),
        }
    }

    pub fn get_banners(&self) -> Vec<Banner> {
        match self.store.get(&ResourceType::Banners) {
            ResourceValue::Banners(banners) => banners,
            _ => Vec::new(),
        }
    }

    pub fn get_footer(&self) -> Footer {
        match self.store.get(&ResourceType::Footer) {
            ResourceValue::Footer(footer) => footer,
            _ => Footer::default(),
        }
    }

    pub fn get_homepage_sections(&self) -> Vec<HomepageSection> {
        match self.store.get(&ResourceType::HomepageSections) {
            ResourceValue::HomepageSections(sections) => sections,
            _ => Vec::new(),
        }
    }

    pub fn get_brands(&self) -> Vec<Brand> {
        match self.store.get(&ResourceType::Brands) {
            ResourceValue::Brands(brands) => brands,
            _ => Vec::new(),
        }
    }

    pub fn get_categories(&self) -> Vec<Category> {
        match self.store.get(&ResourceType::Categories) {
            ResourceValue::Categories(categories) => categories,
            _ => Vec::new(),
        }
    }

    pub fn get_logo(&self) -> Logo {
        match self.store.get(&ResourceType::Logo) {
            ResourceValue::Logo(logo) => logo,
            _ => Logo::default(),
        }
    }

    /// Cached page for `path`, or an empty page when it was never loaded.
    /// Use [`CacheService::load_page`] to fetch it.
    pub fn get_page(&self, path: &str) -> StaticPage {
        match self.store.get(&ResourceType::page(path)) {
            ResourceValue::Page(page) => page,
            _ => StaticPage::empty(path),
        }
    }

    /// Replace `resource` without a fetch and notify `cacheChanged` subscribers.
    ///
    /// A value whose kind does not match `resource` is rejected with a warning.
    pub fn invalidate_and_set(&self, resource: &ResourceType, value: ResourceValue) {
        if value.kind() != resource.kind() {
            warn!(
                resource = %resource,
                value_kind = %value.kind(),
                "Rejected write with mismatched value kind"
            );
            return;
        }
        blocking_io(|| self.broadcaster.invalidate_and_set(resource, value));
    }

    pub fn update_theme(&self, theme: Theme) {
        self.invalidate_and_set(&ResourceType::Theme, ResourceValue::Theme(theme));
    }

    pub fn update_banners(&self, banners: Vec<Banner>) {
        self.invalidate_and_set(&ResourceType::Banners, ResourceValue::Banners(banners));
    }

    pub fn update_footer(&self, footer: Footer) {
        self.invalidate_and_set(&ResourceType::Footer, ResourceValue::Footer(footer));
    }

    pub fn update_homepage_sections(&self, sections: Vec<HomepageSection>) {
        self.invalidate_and_set(
            &ResourceType::HomepageSections,
            ResourceValue::HomepageSections(sections),
        );
    }

    pub fn update_brands(&self, brands: Vec<Brand>) {
        self.invalidate_and_set(&ResourceType::Brands, ResourceValue::Brands(brands));
    }

    pub fn update_categories(&self, categories: Vec<Category>) {
        self.invalidate_and_set(
            &ResourceType::Categories,
            ResourceValue::Categories(categories),
        );
    }

    pub fn update_logo(&self, logo: Logo) {
        self.invalidate_and_set(&ResourceType::Logo, ResourceValue::Logo(logo));
    }

    pub fn update_page(&self, page: StaticPage) {
        let resource = ResourceType::page(page.path.clone());
        self.invalidate_and_set(&resource, ResourceValue::Page(page));
    }

    /// Tell reward consumers their settings must be re-read.
    pub fn notify_gamification_updated(&self) {
        self.broadcaster.gamification_updated();
    }

    /// Bring `context` up to date; see [`InitializeReport`].
    pub async fn initialize_with_context(
        &self,
        context: ContextName,
        force: bool,
    ) -> InitializeReport {
        self.initializer.initialize(context, force).await
    }

    /// Fetch a single resource if no context holds a fresh copy of it.
    pub async fn fetch_if_stale(
        &self,
        resource: &ResourceType,
        context: ContextName,
    ) -> Result<bool, FetchError> {
        self.initializer.fetch_if_stale(resource, context).await
    }

    /// Make sure the page at `path` is cached, then return it. A failed
    /// fetch still yields the last known copy or an empty page.
    pub async fn load_page(&self, path: &str, context: ContextName) -> StaticPage {
        if let Err(error) = self
            .initializer
            .fetch_if_stale(&ResourceType::page(path), context)
            .await
        {
            warn!(path, context = %context, error = %error, "Page load failed; serving cached copy");
        }
        self.get_page(path)
    }

    /// Drop everything, refetch the shared profile and re-initialize every
    /// context that was active. Returns one report per initialize call, the
    /// shared one first.
    #[instrument(skip_all)]
    pub async fn force_refresh_all(&self) -> Vec<InitializeReport> {
        let active = self.initializer.active_contexts();
        warn!(active = ?active, "Force refresh: clearing cache and persisted copies");

        blocking_io(|| {
            self.store.clear();
            self.freshness.clear();
        });
        self.debounce.clear();
        self.broadcaster.cache_cleared();

        let mut reports = vec![
            self.initializer
                .initialize(ContextName::Shared, true)
                .await,
        ];
        for context in active
            .into_iter()
            .filter(|context| *context != ContextName::Shared)
        {
            reports.push(self.initializer.initialize(context, false).await);
        }
        reports
    }

    pub fn is_loading(&self, resource: &ResourceType) -> bool {
        self.initializer.is_loading(resource)
    }

    /// Whether a non-forced `initialize` for `context` would be a no-op right now.
    pub fn is_debounced(&self, context: ContextName) -> bool {
        self.debounce.should_suppress(context, self.clock.now())
    }

    pub fn active_contexts(&self) -> Vec<ContextName> {
        self.initializer.active_contexts()
    }

    pub fn cache_stats(&self) -> CacheStats {
        let now = self.clock.now();
        let resources = self
            .store
            .resources()
            .into_iter()
            .map(|resource| {
                let entry = self.store.entry(&resource);
                let kind = resource.kind();
                ResourceStats {
                    has_value: entry.has_value(),
                    age_seconds: self
                        .store
                        .entry_age(&resource)
                        .map(|age| age.whole_seconds()),
                    ttl_seconds: self.policy.ttl_for(kind).whole_seconds(),
                    stale: self.policy.is_stale(kind, entry.fetched_at, now),
                    loading: self.initializer.is_loading(&resource),
                    last_error: entry.last_error.as_ref().map(ToString::to_string),
                    fresh_in: self.freshness.fresh_contexts(&resource, &self.policy, now),
                    resource,
                }
            })
            .collect();

        CacheStats { resources }
    }

    pub fn bus(&self) -> &NotificationBus {
        &self.bus
    }

    /// Shorthand for `bus().subscribe(..)`.
    pub fn subscribe<F>(&self, topic: Topic, handler: F) -> Subscription
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        self.bus.subscribe(topic, handler)
    }

    /// Stop accepting `initialize` calls, wait for in-flight fetches and
    /// flush both timestamp tables.
    pub async fn shutdown(&self) {
        self.initializer.close().await;
        blocking_io(|| {
            self.store.flush();
            self.freshness.flush();
        });
        info!("Cache service shut down");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::FutureExt;

    use super::*;
    use crate::cache::clock::ManualClock;
    use crate::cache::kv::MemoryKv;
    use crate::cache::provider::FetchTable;
    use crate::domain::types::ResourceKind;

    fn service_with(table: FetchTable, clock: ManualClock) -> CacheService {
        CacheService::new(
            &CacheConfig::default(),
            Arc::new(table),
            Some(Arc::new(MemoryKv::new())),
            Arc::new(clock),
        )
    }

    #[test]
    fn typed_getters_serve_fallbacks_before_any_fetch() {
        let service = service_with(FetchTable::new(), ManualClock::default());

        assert_eq!(service.get_theme(), Theme::default());
        assert!(service.get_banners().is_empty());
        assert_eq!(service.get_logo(), Logo::default());
        assert_eq!(service.get_page("/faq"), StaticPage::empty("/faq"));
    }

    #[test]
    fn mismatched_write_is_ignored() {
        let service = service_with(FetchTable::new(), ManualClock::default());

        service.invalidate_and_set(&ResourceType::Theme, ResourceValue::Banners(Vec::new()));

        assert!(!service.entry(&ResourceType::Theme).has_value());
    }

    #[tokio::test]
    async fn load_page_fetches_once_and_then_serves_cache() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let table = FetchTable::new().with(ResourceKind::Page, move |resource, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                let ResourceType::Page(path) = resource else {
                    return Err(FetchError::permanent("not a page"));
                };
                Ok(ResourceValue::Page(StaticPage {
                    title: "Shipping".to_string(),
                    ..StaticPage::empty(&path)
                }))
            }
            .boxed()
        });
        let service = service_with(table, ManualClock::default());

        let first = service.load_page("/shipping", ContextName::Storefront).await;
        let second = service.load_page("/shipping", ContextName::Storefront).await;

        assert_eq!(first.title, "Shipping");
        assert_eq!(second, first);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_suppresses_later_initialize() {
        let service = service_with(FetchTable::new(), ManualClock::default());
        service.shutdown().await;

        let report = service
            .initialize_with_context(ContextName::Storefront, true)
            .await;

        assert!(report.suppressed);
        assert!(report.requested().is_empty());
    }

    #[tokio::test]
    async fn shutdown_stops_page_loads() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let table = FetchTable::new().with(ResourceKind::Page, move |resource, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Ok(resource.fallback()) }.boxed()
        });
        let kv = Arc::new(MemoryKv::new());
        let service = CacheService::new(
            &CacheConfig::default(),
            Arc::new(table),
            Some(kv.clone()),
            Arc::new(ManualClock::default()),
        );
        service.shutdown().await;

        let page = service.load_page("/returns", ContextName::Storefront).await;

        assert_eq!(page, StaticPage::empty("/returns"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(!kv.contains("resource:page:/returns"));
    }

    #[test]
    fn reading_unknown_pages_does_not_track_them() {
        let service = service_with(FetchTable::new(), ManualClock::default());

        for path in ["/a", "/b", "/c"] {
            assert_eq!(service.get_page(path), StaticPage::empty(path));
        }

        let stats = service.cache_stats();
        assert_eq!(stats.resources.len(), ResourceType::SINGLETONS.len());
        assert!(stats.get(&ResourceType::page("/a")).is_none());
    }

    #[tokio::test]
    async fn debounce_state_is_visible() {
        let clock = ManualClock::default();
        let service = service_with(FetchTable::new(), clock.clone());
        assert!(!service.is_debounced(ContextName::Delivery));

        service
            .initialize_with_context(ContextName::Delivery, false)
            .await;
        assert!(service.is_debounced(ContextName::Delivery));
        assert!(!service.is_debounced(ContextName::Admin));

        clock.advance(time::Duration::seconds(5));
        assert!(!service.is_debounced(ContextName::Delivery));
    }

    #[test]
    fn entry_age_tracks_the_clock() {
        let clock = ManualClock::default();
        let service = service_with(FetchTable::new(), clock.clone());
        assert_eq!(service.entry_age(&ResourceType::Logo), None);

        service.update_logo(Logo::default());
        clock.advance(time::Duration::seconds(90));

        assert_eq!(
            service.entry_age(&ResourceType::Logo),
            Some(time::Duration::seconds(90))
        );
    }

    #[test]
    fn stats_cover_every_profiled_resource() {
        let clock = ManualClock::default();
        let service = service_with(FetchTable::new(), clock.clone());
        service.update_banners(vec![Banner::default()]);
        clock.advance(time::Duration::minutes(5));

        let stats = service.cache_stats();
        let banners = stats.get(&ResourceType::Banners).expect("banners listed");
        assert!(banners.has_value);
        assert!(!banners.stale);
        assert_eq!(banners.age_seconds, Some(300));
        assert_eq!(banners.ttl_seconds, 12 * 3600);
        assert_eq!(banners.fresh_in, vec![ContextName::Storefront]);

        let theme = stats.get(&ResourceType::Theme).expect("theme listed");
        assert!(!theme.has_value);
        assert!(theme.stale);
        assert_eq!(stats.stale_count(), ResourceType::SINGLETONS.len() - 1);
    }
}
