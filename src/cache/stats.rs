//! Diagnostic snapshot of the cache.

use serde::Serialize;

use crate::domain::types::{ContextName, ResourceType};

/// State of one resource type at the moment the snapshot was taken.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceStats {
    pub resource: ResourceType,
    /// A fetched or written value is held, not the fallback.
    pub has_value: bool,
    pub age_seconds: Option<i64>,
    pub ttl_seconds: i64,
    pub stale: bool,
    pub loading: bool,
    pub last_error: Option<String>,
    /// Contexts whose freshness stamp for this resource is within TTL.
    pub fresh_in: Vec<ContextName>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    pub resources: Vec<ResourceStats>,
}

impl CacheStats {
    pub fn get(&self, resource: &ResourceType) -> Option<&ResourceStats> {
        self.resources
            .iter()
            .find(|stats| &stats.resource == resource)
    }

    pub fn stale_count(&self) -> usize {
        self.resources.iter().filter(|stats| stats.stale).count()
    }
}
