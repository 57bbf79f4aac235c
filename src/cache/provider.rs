//! Resource provider seam and the per-kind fetch dispatch table.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Serialize;
use thiserror::Error;

use crate::domain::types::{ContextName, ResourceKind, ResourceType, ResourceValue};

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "class", rename_all = "snake_case")]
pub enum FetchError {
    /// Worth retrying later: timeouts, connection resets, 5xx.
    #[error("transient fetch failure: {message}")]
    Transient { message: String },
    /// Retrying will not help until something changes upstream.
    #[error("permanent fetch failure: {message}")]
    Permanent { message: String },
}

impl FetchError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Permanent {
            message: message.into(),
        }
    }

    pub fn timeout(after: std::time::Duration) -> Self {
        Self::transient(format!("timed out after {} ms", after.as_millis()))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Metric label for this error class.
    pub fn class(&self) -> &'static str {
        match self {
            Self::Transient { .. } => "transient",
            Self::Permanent { .. } => "permanent",
        }
    }
}

/// Source of truth for resource values (typically the remote content API).
///
/// `context` may steer the request to an equivalent endpoint but never
/// changes which logical resource is returned.
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    async fn fetch(
        &self,
        resource: &ResourceType,
        context: ContextName,
    ) -> Result<ResourceValue, FetchError>;
}

pub type FetchFn = Arc<
    dyn Fn(ResourceType, ContextName) -> BoxFuture<'static, Result<ResourceValue, FetchError>>
        + Send
        + Sync,
>;

/// Provider assembled from one fetch function per [`ResourceKind`].
#[derive(Clone, Default)]
pub struct FetchTable {
    fetchers: HashMap<ResourceKind, FetchFn>,
}

impl FetchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the fetcher for `kind`.
    pub fn with<F, Fut>(mut self, kind: ResourceKind, fetch: F) -> Self
    where
        F: Fn(ResourceType, ContextName) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ResourceValue, FetchError>> + Send + 'static,
    {
        let fetch: FetchFn = Arc::new(move |resource, context| Box::pin(fetch(resource, context)));
        self.fetchers.insert(kind, fetch);
        self
    }

    pub fn has(&self, kind: ResourceKind) -> bool {
        self.fetchers.contains_key(&kind)
    }
}

#[async_trait]
impl ResourceProvider for FetchTable {
    async fn fetch(
        &self,
        resource: &ResourceType,
        context: ContextName,
    ) -> Result<ResourceValue, FetchError> {
        let Some(fetch) = self.fetchers.get(&resource.kind()) else {
            return Err(FetchError::permanent(format!(
                "no fetcher registered for `{}`",
                resource.kind()
            )));
        };
        fetch(resource.clone(), context).await
    }
}
