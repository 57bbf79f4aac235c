//! Context initialization: decide what a context is missing, fetch exactly
//! that in parallel, and share the results with every context that needs them.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures::FutureExt;
use futures::future::join_all;
use metrics::{counter, histogram};
use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, info, instrument, warn};

use crate::domain::types::{ContextName, ResourceType, ResourceValue};

use super::clock::Clock;
use super::debounce::DebounceGuard;
use super::freshness::ContextFreshness;
use super::lock;
use super::policy::StalenessPolicy;
use super::profile;
use super::provider::{FetchError, ResourceProvider};
use super::singleflight::{FetchOutcome, InFlightFetches, SharedFetch};
use super::store::{CacheStore, Committed};

const SOURCE: &str = "cache::initializer";
const METRIC_FETCH_TOTAL: &str = "storefront_cache_fetch_total";
const METRIC_FETCH_MS: &str = "storefront_cache_fetch_ms";
const METRIC_DEBOUNCE_SUPPRESSED_TOTAL: &str = "storefront_cache_debounce_suppressed_total";
const METRIC_SINGLEFLIGHT_JOINED_TOTAL: &str = "storefront_cache_singleflight_joined_total";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceFailure {
    pub resource: ResourceType,
    pub error: FetchError,
}

impl fmt::Display for ResourceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.resource, self.error)
    }
}

/// Every per-resource failure of one `initialize` call.
#[derive(Debug, Clone, Error)]
#[error("{} resource fetch(es) failed: {}", failures.len(), join_failures(failures))]
pub struct AggregateFetchError {
    pub context: ContextName,
    pub failures: Vec<ResourceFailure>,
}

fn join_failures(failures: &[ResourceFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Outcome of one `initialize` call. Partial failure is still a completed call.
#[derive(Debug, Clone, Serialize)]
pub struct InitializeReport {
    pub context: ContextName,
    pub forced: bool,
    /// The call was a no-op (debounced or the service is shutting down).
    pub suppressed: bool,
    /// Fetched by this call.
    pub fetched: Vec<ResourceType>,
    /// Satisfied by a fetch another caller already had in flight.
    pub joined: Vec<ResourceType>,
    /// Fetched by this call, but a write-through landed first and was kept.
    pub superseded: Vec<ResourceType>,
    pub served_from_cache: Vec<ResourceType>,
    pub failures: Vec<ResourceFailure>,
}

impl InitializeReport {
    fn new(context: ContextName, forced: bool) -> Self {
        Self {
            context,
            forced,
            suppressed: false,
            fetched: Vec::new(),
            joined: Vec::new(),
            superseded: Vec::new(),
            served_from_cache: Vec::new(),
            failures: Vec::new(),
        }
    }

    fn suppressed(context: ContextName, forced: bool) -> Self {
        Self {
            suppressed: true,
            ..Self::new(context, forced)
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Resource types this call dispatched or joined a network fetch for.
    pub fn requested(&self) -> Vec<ResourceType> {
        let mut requested: Vec<ResourceType> = self
            .fetched
            .iter()
            .chain(&self.joined)
            .chain(&self.superseded)
            .chain(self.failures.iter().map(|failure| &failure.resource))
            .cloned()
            .collect();
        requested.sort();
        requested
    }

    /// Surface failures as an error for callers that want `?`.
    pub fn into_result(self) -> Result<Self, AggregateFetchError> {
        if self.failures.is_empty() {
            Ok(self)
        } else {
            Err(AggregateFetchError {
                context: self.context,
                failures: self.failures,
            })
        }
    }
}

pub struct ContextInitializer {
    store: Arc<CacheStore>,
    freshness: Arc<ContextFreshness>,
    debounce: Arc<DebounceGuard>,
    provider: Arc<dyn ResourceProvider>,
    inflight: InFlightFetches,
    policy: Arc<StalenessPolicy>,
    clock: Arc<dyn Clock>,
    fetch_timeout: std::time::Duration,
    active: Mutex<BTreeSet<ContextName>>,
    closed: AtomicBool,
}

impl ContextInitializer {
    pub(crate) fn new(
        store: Arc<CacheStore>,
        freshness: Arc<ContextFreshness>,
        debounce: Arc<DebounceGuard>,
        provider: Arc<dyn ResourceProvider>,
        policy: Arc<StalenessPolicy>,
        clock: Arc<dyn Clock>,
        fetch_timeout: std::time::Duration,
    ) -> Self {
        Self {
            store,
            freshness,
            debounce,
            provider,
            inflight: InFlightFetches::new(),
            policy,
            clock,
            fetch_timeout,
            active: Mutex::new(BTreeSet::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Bring `context` up to date. See [`InitializeReport`] for the outcome.
    #[instrument(skip_all, fields(context = %context, force))]
    pub async fn initialize(&self, context: ContextName, force: bool) -> InitializeReport {
        if self.closed.load(Ordering::Acquire) {
            debug!("initialize ignored: cache service is shut down");
            return InitializeReport::suppressed(context, force);
        }

        let now = self.clock.now();
        // Stamped before any fetch is dispatched so concurrent callers see it.
        if !self.debounce.try_admit(context, now, force) {
            counter!(METRIC_DEBOUNCE_SUPPRESSED_TOTAL, "context" => context.as_str()).increment(1);
            debug!("initialize suppressed by debounce window");
            return InitializeReport::suppressed(context, force);
        }
        lock::lock(&self.active, SOURCE, "initialize.active").insert(context);

        let mut report = InitializeReport::new(context, force);
        let mut dispatched = Vec::new();
        for resource in profile::required_resources(context) {
            if self.needs_fetch(resource, force, now) {
                let (fetch, joined) = self.dispatch(resource, context);
                dispatched.push((resource.clone(), joined, fetch));
            } else {
                report.served_from_cache.push(resource.clone());
            }
        }

        // Settle all: one failure never cancels its siblings.
        let outcomes = join_all(
            dispatched
                .into_iter()
                .map(|(resource, joined, fetch)| async move { (resource, joined, fetch.await) }),
        )
        .await;

        for (resource, joined, outcome) in outcomes {
            self.absorb(&mut report, resource, joined, outcome);
        }

        info!(
            fetched = report.fetched.len(),
            joined = report.joined.len(),
            superseded = report.superseded.len(),
            cached = report.served_from_cache.len(),
            failed = report.failures.len(),
            "Context initialized"
        );
        report
    }

    /// Fetch a single resource for `context` if no context holds a fresh copy.
    /// Returns `Ok(false)` when the cached copy was good enough.
    pub async fn fetch_if_stale(
        &self,
        resource: &ResourceType,
        context: ContextName,
    ) -> Result<bool, FetchError> {
        if self.closed.load(Ordering::Acquire) {
            debug!(resource = %resource, "fetch ignored: cache service is shut down");
            return Ok(false);
        }
        if !self.needs_fetch(resource, false, self.clock.now()) {
            return Ok(false);
        }

        let (fetch, joined) = self.dispatch(resource, context);
        let committed = fetch.await?;
        if joined {
            self.freshness.stamp(context, resource, committed.at());
        }
        Ok(true)
    }

    fn needs_fetch(&self, resource: &ResourceType, force: bool, now: OffsetDateTime) -> bool {
        if force {
            return true;
        }

        // A sibling context refreshed this recently enough: reuse its copy.
        let shared_fresh = self.freshness.any_fresh(resource, &self.policy, now);
        if shared_fresh {
            return false;
        }

        let entry = self.store.entry(resource);
        if !entry.has_value() {
            return true;
        }
        self.policy
            .is_stale(resource.kind(), entry.fetched_at, now)
    }

    fn dispatch(&self, resource: &ResourceType, origin: ContextName) -> (SharedFetch, bool) {
        let (fetch, joined) = self.inflight.join_or_start(resource, |generation| {
            let task = FetchTask {
                resource: resource.clone(),
                origin,
                generation,
                revision: self.store.revision(resource),
                store: self.store.clone(),
                freshness: self.freshness.clone(),
                provider: self.provider.clone(),
                inflight: self.inflight.clone(),
                timeout: self.fetch_timeout,
            };
            let handle = tokio::spawn(task.run());
            handle
                .map(|joined| {
                    joined.unwrap_or_else(|err| {
                        Err(FetchError::transient(format!("fetch task aborted: {err}")))
                    })
                })
                .boxed()
        });

        if joined {
            counter!(METRIC_SINGLEFLIGHT_JOINED_TOTAL, "resource" => resource.kind().as_str())
                .increment(1);
            debug!(resource = %resource, context = %origin, "Joined in-flight fetch");
        }
        (fetch, joined)
    }

    fn absorb(
        &self,
        report: &mut InitializeReport,
        resource: ResourceType,
        joined: bool,
        outcome: FetchOutcome,
    ) {
        match outcome {
            Ok(committed) if joined => {
                self.freshness.stamp(report.context, &resource, committed.at());
                report.joined.push(resource);
            }
            Ok(Committed::Stored(_)) => report.fetched.push(resource),
            Ok(Committed::Superseded(_)) => report.superseded.push(resource),
            Err(error) => report.failures.push(ResourceFailure { resource, error }),
        }
    }

    pub fn is_loading(&self, resource: &ResourceType) -> bool {
        self.inflight.contains(resource)
    }

    /// Contexts that have run `initialize` in this process.
    pub fn active_contexts(&self) -> Vec<ContextName> {
        lock::lock(&self.active, SOURCE, "active_contexts")
            .iter()
            .copied()
            .collect()
    }

    /// Refuse new work and wait for running fetches to settle.
    pub(crate) async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let pending = self.inflight.pending();
        if !pending.is_empty() {
            info!(pending = pending.len(), "Waiting for in-flight fetches");
            join_all(pending).await;
        }
    }
}

/// One provider round-trip plus its commit. Runs as its own task so that a
/// cancelled caller cannot interrupt the commit halfway.
struct FetchTask {
    resource: ResourceType,
    origin: ContextName,
    generation: u64,
    /// Store revision of the entry when the fetch was dispatched.
    revision: u64,
    store: Arc<CacheStore>,
    freshness: Arc<ContextFreshness>,
    provider: Arc<dyn ResourceProvider>,
    inflight: InFlightFetches,
    timeout: std::time::Duration,
}

impl FetchTask {
    async fn run(self) -> FetchOutcome {
        let started_at = Instant::now();
        let kind = self.resource.kind();

        let fetched = match tokio::time::timeout(
            self.timeout,
            self.provider.fetch(&self.resource, self.origin),
        )
        .await
        {
            Ok(Ok(value)) if value.kind() == kind => Ok(value),
            Ok(Ok(value)) => Err(FetchError::permanent(format!(
                "provider returned a `{}` payload for `{}`",
                value.kind(),
                self.resource
            ))),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(FetchError::timeout(self.timeout)),
        };
        let elapsed_ms = started_at.elapsed().as_secs_f64() * 1000.0;
        histogram!(METRIC_FETCH_MS, "resource" => kind.as_str()).record(elapsed_ms);

        let outcome = match fetched {
            Ok(value) => self.commit(value).await,
            Err(error) => Err(error),
        };

        match &outcome {
            Ok(Committed::Stored(_)) => {
                counter!(METRIC_FETCH_TOTAL, "resource" => kind.as_str(), "outcome" => "success")
                    .increment(1);
                debug!(
                    resource = %self.resource,
                    context = %self.origin,
                    elapsed_ms,
                    "Resource fetched"
                );
            }
            Ok(Committed::Superseded(_)) => {
                counter!(METRIC_FETCH_TOTAL, "resource" => kind.as_str(), "outcome" => "superseded")
                    .increment(1);
                info!(
                    resource = %self.resource,
                    context = %self.origin,
                    elapsed_ms,
                    "Fetched value dropped: a newer write-through is already cached"
                );
            }
            Err(error) => {
                self.store.record_error(&self.resource, error.clone());
                counter!(METRIC_FETCH_TOTAL, "resource" => kind.as_str(), "outcome" => error.class())
                    .increment(1);
                warn!(
                    resource = %self.resource,
                    context = %self.origin,
                    error = %error,
                    elapsed_ms,
                    "Resource fetch failed; keeping previous value"
                );
            }
        }

        self.inflight.finish(&self.resource, self.generation);
        outcome
    }

    /// Write the value and its freshness stamps through on the blocking pool.
    async fn commit(&self, value: ResourceValue) -> FetchOutcome {
        let store = self.store.clone();
        let freshness = self.freshness.clone();
        let resource = self.resource.clone();
        let origin = self.origin;
        let revision = self.revision;

        tokio::task::spawn_blocking(move || {
            let committed = store.commit_fetch(&resource, value, revision);
            match committed {
                Committed::Stored(at) => {
                    freshness.stamp_propagated(Some(origin), &resource, at);
                }
                // The write-through already stamped every profile owner.
                Committed::Superseded(at) => freshness.stamp(origin, &resource, at),
            }
            committed
        })
        .await
        .map_err(|err| FetchError::transient(format!("commit task failed: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn into_result_surfaces_failures() {
        let mut report = InitializeReport::new(ContextName::Storefront, false);
        report.fetched.push(ResourceType::Theme);
        assert!(report.clone().into_result().is_ok());

        report.failures.push(ResourceFailure {
            resource: ResourceType::Banners,
            error: FetchError::transient("503 Service Unavailable"),
        });
        let err = report.into_result().expect_err("failure expected");
        assert_eq!(err.context, ContextName::Storefront);
        assert!(err.to_string().starts_with("1 resource fetch(es) failed: banners:"));
    }

    #[test]
    fn requested_lists_every_network_touch() {
        let mut report = InitializeReport::new(ContextName::Admin, false);
        report.fetched.push(ResourceType::Theme);
        report.joined.push(ResourceType::Logo);
        report.served_from_cache.push(ResourceType::Footer);

        assert_eq!(
            report.requested(),
            vec![ResourceType::Theme, ResourceType::Logo]
        );
    }
}
