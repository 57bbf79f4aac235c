//! Per-resource TTL table and the staleness predicate.

use std::collections::HashMap;

use time::{Duration, OffsetDateTime};

use crate::domain::types::ResourceKind;

/// TTL used for a kind missing from the table.
pub const FAIL_CLOSED_TTL: Duration = Duration::hours(24);

fn default_ttl(kind: ResourceKind) -> Duration {
    match kind {
        ResourceKind::Theme | ResourceKind::Footer | ResourceKind::Logo => Duration::hours(24),
        ResourceKind::Banners | ResourceKind::Brands | ResourceKind::Categories => {
            Duration::hours(12)
        }
        ResourceKind::HomepageSections => Duration::hours(2),
        ResourceKind::Page => Duration::hours(12),
    }
}

#[derive(Debug, Clone)]
pub struct StalenessPolicy {
    ttls: HashMap<ResourceKind, Duration>,
}

impl StalenessPolicy {
    /// Build the default table with `overrides` applied on top.
    ///
    /// # Panics
    ///
    /// Panics if the resulting table misses a kind or holds a non-positive TTL.
    /// Both are programming errors and must surface at startup.
    pub fn with_overrides(overrides: impl IntoIterator<Item = (ResourceKind, Duration)>) -> Self {
        let mut ttls: HashMap<ResourceKind, Duration> = ResourceKind::ALL
            .into_iter()
            .map(|kind| (kind, default_ttl(kind)))
            .collect();
        ttls.extend(overrides);

        let policy = Self { ttls };
        policy.assert_complete();
        policy
    }

    fn assert_complete(&self) {
        for kind in ResourceKind::ALL {
            match self.ttls.get(&kind) {
                Some(ttl) => assert!(
                    ttl.is_positive(),
                    "staleness policy holds a non-positive TTL for `{kind}`"
                ),
                None => panic!("staleness policy is missing resource type `{kind}`"),
            }
        }
    }

    pub fn ttl_for(&self, kind: ResourceKind) -> Duration {
        self.ttls.get(&kind).copied().unwrap_or(FAIL_CLOSED_TTL)
    }

    /// `None` (never fetched) is always stale.
    pub fn is_stale(
        &self,
        kind: ResourceKind,
        last_fetched_at: Option<OffsetDateTime>,
        now: OffsetDateTime,
    ) -> bool {
        match last_fetched_at {
            Some(fetched_at) => now - fetched_at > self.ttl_for(kind),
            None => true,
        }
    }

    /// True when `stamp` is still within the TTL of `kind`.
    pub fn is_fresh(&self, kind: ResourceKind, stamp: OffsetDateTime, now: OffsetDateTime) -> bool {
        !self.is_stale(kind, Some(stamp), now)
    }
}

impl Default for StalenessPolicy {
    fn default() -> Self {
        Self::with_overrides([])
    }
}
