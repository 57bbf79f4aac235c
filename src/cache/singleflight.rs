//! In-flight fetch de-duplication per resource type.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};

use crate::domain::types::ResourceType;

use super::provider::FetchError;
use super::store::Committed;

/// Settled outcome of one fetch.
pub type FetchOutcome = Result<Committed, FetchError>;

pub type SharedFetch = Shared<BoxFuture<'static, FetchOutcome>>;

/// Tracks resource types that currently have a fetch running.
#[derive(Default, Clone)]
pub struct InFlightFetches {
    fetches: Arc<DashMap<ResourceType, (u64, SharedFetch)>>,
    generation: Arc<AtomicU64>,
}

impl InFlightFetches {
    pub fn new() -> Self {
        Self::default()
    }

    /// Join the running fetch for `resource`, or start one with `start`.
    ///
    /// `start` receives a generation token that must be handed back to
    /// [`InFlightFetches::finish`]. The flag is `true` when an existing
    /// fetch was joined.
    pub fn join_or_start<F>(&self, resource: &ResourceType, start: F) -> (SharedFetch, bool)
    where
        F: FnOnce(u64) -> BoxFuture<'static, FetchOutcome>,
    {
        use dashmap::mapref::entry::Entry;

        match self.fetches.entry(resource.clone()) {
            Entry::Occupied(occupied) => (occupied.get().1.clone(), true),
            Entry::Vacant(vacant) => {
                let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                let fetch = start(generation).shared();
                vacant.insert((generation, fetch.clone()));
                (fetch, false)
            }
        }
    }

    /// Forget the fetch started under `generation`. A newer fetch for the
    /// same resource is left alone.
    pub fn finish(&self, resource: &ResourceType, generation: u64) {
        self.fetches
            .remove_if(resource, |_, (current, _)| *current == generation);
    }

    pub fn contains(&self, resource: &ResourceType) -> bool {
        self.fetches.contains_key(resource)
    }

    pub fn pending(&self) -> Vec<SharedFetch> {
        self.fetches
            .iter()
            .map(|entry| entry.value().1.clone())
            .collect()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.fetches.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.fetches.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use tokio::sync::oneshot;

    use super::*;

    fn stamp() -> Committed {
        Committed::Stored(time::macros::datetime!(2026-02-02 02:02 UTC))
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_fetch() {
        let inflight = InFlightFetches::new();
        let starts = Arc::new(AtomicUsize::new(0));
        let (release, gate) = oneshot::channel::<()>();

        let counter = starts.clone();
        let (first, joined_first) = inflight.join_or_start(&ResourceType::Theme, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                let _ = gate.await;
                Ok(stamp())
            }
            .boxed()
        });
        let (second, joined_second) = inflight.join_or_start(&ResourceType::Theme, |_| {
            unreachable!("second caller must join")
        });

        assert!(!joined_first);
        assert!(joined_second);
        assert!(inflight.contains(&ResourceType::Theme));

        release.send(()).unwrap();
        assert_eq!(first.await, Ok(stamp()));
        assert_eq!(second.await, Ok(stamp()));
        assert_eq!(starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn finish_ignores_stale_generation() {
        let inflight = InFlightFetches::new();

        let (_, _) = inflight.join_or_start(&ResourceType::Logo, |_| async { Ok(stamp()) }.boxed());
        inflight.finish(&ResourceType::Logo, 0);
        let (_, _) = inflight.join_or_start(&ResourceType::Logo, |generation| {
            assert_eq!(generation, 1);
            async { Ok(stamp()) }.boxed()
        });

        inflight.finish(&ResourceType::Logo, 0);
        assert!(inflight.contains(&ResourceType::Logo));

        inflight.finish(&ResourceType::Logo, 1);
        assert!(inflight.is_empty());
    }

    #[tokio::test]
    async fn different_resources_do_not_share() {
        let inflight = InFlightFetches::new();

        let (_, joined_theme) =
            inflight.join_or_start(&ResourceType::Theme, |_| async { Ok(stamp()) }.boxed());
        let (_, joined_logo) = inflight.join_or_start(&ResourceType::Logo, |_| {
            async { Err(FetchError::transient("boom")) }.boxed()
        });

        assert!(!joined_theme);
        assert!(!joined_logo);
        assert_eq!(inflight.len(), 2);
        assert_eq!(inflight.pending().len(), 2);
    }
}
