//! Shared configuration cache.
//!
//! Serves slow-changing storefront configuration (theme, banners, footer,
//! homepage sections, brands, categories, logo and static pages) to several
//! UI contexts from one process-wide store:
//!
//! - **Profiles** declare which resource types each context needs.
//! - **Freshness** is tracked per context, and a successful fetch is shared
//!   with every context whose profile lists the same resource.
//! - **Persistence** mirrors the store into a key/value backend so a restart
//!   serves the last known values before any fetch completes.
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! debounce_window_ms = 5000
//! fetch_timeout_ms = 10000
//!
//! [cache.ttl_seconds]
//! homepage_sections = 3600
//! ```

pub mod clock;
mod config;
mod debounce;
mod events;
mod freshness;
mod initializer;
mod invalidation;
pub mod kv;
mod lock;
mod policy;
pub mod profile;
mod provider;
mod service;
mod singleflight;
mod stats;
mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CacheConfig;
pub use events::{Epoch, Notification, NotificationBus, Subscription, Topic};
pub use initializer::{AggregateFetchError, InitializeReport, ResourceFailure};
pub use kv::{MemoryKv, PersistenceError, PersistentKv};
pub use policy::{FAIL_CLOSED_TTL, StalenessPolicy};
pub use provider::{FetchError, FetchFn, FetchTable, ResourceProvider};
pub use service::CacheService;
pub use stats::{CacheStats, ResourceStats};
pub use store::CacheEntry;
