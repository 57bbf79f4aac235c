//! Cache coordinator configuration.
//!
//! Populated from the `[cache]` section of `storefront-cache.toml`.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::domain::types::ResourceKind;

use super::policy::StalenessPolicy;

const DEFAULT_DEBOUNCE_WINDOW_MS: u64 = 5_000;
const DEFAULT_FETCH_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Repeated non-forced `initialize` calls for one context inside this window are no-ops.
    pub debounce_window_ms: u64,
    /// Upper bound for a single provider fetch.
    pub fetch_timeout_ms: u64,
    /// Per-kind TTL overrides in seconds; kinds not listed keep their defaults.
    pub ttl_seconds: BTreeMap<ResourceKind, u64>,
    /// Mirror cache contents into the persistent key/value store.
    pub persist: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            debounce_window_ms: DEFAULT_DEBOUNCE_WINDOW_MS,
            fetch_timeout_ms: DEFAULT_FETCH_TIMEOUT_MS,
            ttl_seconds: BTreeMap::new(),
            persist: true,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            debounce_window_ms: saturating_millis(settings.debounce_window),
            fetch_timeout_ms: saturating_millis(settings.fetch_timeout),
            ttl_seconds: settings
                .ttl_overrides
                .iter()
                .map(|(kind, ttl)| (*kind, ttl.as_secs()))
                .collect(),
            persist: settings.persist,
        }
    }
}

fn saturating_millis(duration: std::time::Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

fn saturating_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

impl CacheConfig {
    pub fn debounce_window(&self) -> time::Duration {
        time::Duration::milliseconds(saturating_i64(self.debounce_window_ms))
    }

    /// Fetch timeout, clamped to at least one millisecond.
    pub fn fetch_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.fetch_timeout_ms.max(1))
    }

    pub fn staleness_policy(&self) -> StalenessPolicy {
        let overrides = self
            .ttl_seconds
            .iter()
            .map(|(kind, secs)| (*kind, time::Duration::seconds(saturating_i64(*secs))));
        StalenessPolicy::with_overrides(overrides)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_values() {
        let config = CacheConfig::default();
        assert_eq!(config.debounce_window_ms, 5_000);
        assert_eq!(config.fetch_timeout_ms, 10_000);
        assert!(config.ttl_seconds.is_empty());
        assert!(config.persist);
    }

    #[test]
    fn fetch_timeout_clamps_zero() {
        let config = CacheConfig {
            fetch_timeout_ms: 0,
            ..Default::default()
        };
        assert_eq!(config.fetch_timeout(), std::time::Duration::from_millis(1));
    }

    #[test]
    fn oversized_values_saturate_instead_of_wrapping() {
        let mut config = CacheConfig {
            debounce_window_ms: u64::MAX,
            ..Default::default()
        };
        config.ttl_seconds.insert(ResourceKind::Logo, u64::MAX);

        assert_eq!(
            config.debounce_window(),
            time::Duration::milliseconds(i64::MAX)
        );
        assert!(config.debounce_window().is_positive());
        assert_eq!(
            config.staleness_policy().ttl_for(ResourceKind::Logo),
            time::Duration::seconds(i64::MAX)
        );
        assert_eq!(saturating_millis(std::time::Duration::MAX), u64::MAX);
    }

    #[test]
    fn ttl_overrides_reach_policy() {
        let mut config = CacheConfig::default();
        config.ttl_seconds.insert(ResourceKind::Banners, 60);

        let policy = config.staleness_policy();
        assert_eq!(
            policy.ttl_for(ResourceKind::Banners),
            time::Duration::seconds(60)
        );
        assert_eq!(
            policy.ttl_for(ResourceKind::Theme),
            time::Duration::hours(24)
        );
    }
}
