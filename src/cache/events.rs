//! Cache change notifications.
//!
//! Publishers announce that something changed; they never learn who listens.

use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::types::ResourceType;

use super::clock::Clock;
use super::lock;

const SOURCE: &str = "cache::events";

/// Monotonic, process-local ordering number of a notification.
pub type Epoch = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// A cached resource was replaced or the whole cache was reset.
    CacheChanged,
    /// Reward settings changed and must be re-read by their consumers.
    GamificationUpdated,
}

impl Topic {
    pub fn as_str(self) -> &'static str {
        match self {
            Topic::CacheChanged => "cacheChanged",
            Topic::GamificationUpdated => "gamificationUpdated",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Topic {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "cacheChanged" => Ok(Topic::CacheChanged),
            "gamificationUpdated" => Ok(Topic::GamificationUpdated),
            other => Err(format!("unknown topic `{other}`")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Notification {
    /// Unique identifier (UUIDv4).
    pub id: Uuid,
    pub epoch: Epoch,
    pub topic: Topic,
    /// The resource that changed; `None` means "everything".
    pub resource: Option<ResourceType>,
    pub timestamp: OffsetDateTime,
}

type Handler = Arc<dyn Fn(&Notification) + Send + Sync>;

struct Registry {
    handlers: RwLock<HashMap<Topic, Vec<(u64, Handler)>>>,
    next_handler_id: AtomicU64,
}

pub struct NotificationBus {
    registry: Arc<Registry>,
    epoch_counter: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl NotificationBus {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            registry: Arc::new(Registry {
                handlers: RwLock::new(HashMap::new()),
                next_handler_id: AtomicU64::new(0),
            }),
            epoch_counter: AtomicU64::new(0),
            clock,
        }
    }

    /// Register `handler` for `topic`. The handler stays registered until
    /// the returned [`Subscription`] is dropped.
    #[must_use = "dropping the subscription unsubscribes immediately"]
    pub fn subscribe<F>(&self, topic: Topic, handler: F) -> Subscription
    where
        F: Fn(&Notification) + Send + Sync + 'static,
    {
        let id = self.registry.next_handler_id.fetch_add(1, Ordering::Relaxed);
        lock::write(&self.registry.handlers, SOURCE, "subscribe")
            .entry(topic)
            .or_default()
            .push((id, Arc::new(handler)));

        Subscription {
            id,
            topic,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Deliver a notification to every current subscriber of `topic`.
    ///
    /// Handlers run synchronously on the publishing task; a panicking
    /// handler is logged and skipped.
    pub fn publish(&self, topic: Topic, resource: Option<ResourceType>) -> Notification {
        let notification = Notification {
            id: Uuid::new_v4(),
            epoch: self.epoch_counter.fetch_add(1, Ordering::SeqCst),
            topic,
            resource,
            timestamp: self.clock.now(),
        };

        let handlers: Vec<Handler> = lock::read(&self.registry.handlers, SOURCE, "publish")
            .get(&topic)
            .map(|handlers| handlers.iter().map(|(_, handler)| handler.clone()).collect())
            .unwrap_or_default();

        info!(
            notification_id = %notification.id,
            notification_epoch = notification.epoch,
            topic = %topic,
            resource = ?notification.resource.as_ref().map(ToString::to_string),
            subscribers = handlers.len(),
            "Cache notification published"
        );

        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(&notification))).is_err() {
                warn!(
                    notification_id = %notification.id,
                    topic = %topic,
                    "Notification handler panicked"
                );
            }
        }

        notification
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        lock::read(&self.registry.handlers, SOURCE, "subscriber_count")
            .get(&topic)
            .map_or(0, Vec::len)
    }
}

/// Drop guard that removes its handler from the bus.
pub struct Subscription {
    id: u64,
    topic: Topic,
    registry: Weak<Registry>,
}

impl Subscription {
    pub fn topic(&self) -> Topic {
        self.topic
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        if let Some(handlers) =
            lock::write(&registry.handlers, SOURCE, "unsubscribe").get_mut(&self.topic)
        {
            handlers.retain(|(id, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::cache::clock::ManualClock;

    fn bus() -> NotificationBus {
        NotificationBus::new(Arc::new(ManualClock::default()))
    }

    #[test]
    fn delivers_only_to_matching_topic() {
        let bus = bus();
        let changed = Arc::new(Mutex::new(Vec::new()));
        let rewards = Arc::new(AtomicUsize::new(0));

        let sink = changed.clone();
        let _changed_sub = bus.subscribe(Topic::CacheChanged, move |n| {
            sink.lock().unwrap().push(n.resource.clone());
        });
        let counter = rewards.clone();
        let _reward_sub = bus.subscribe(Topic::GamificationUpdated, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(Topic::CacheChanged, Some(ResourceType::Banners));
        bus.publish(Topic::GamificationUpdated, None);

        assert_eq!(
            *changed.lock().unwrap(),
            vec![Some(ResourceType::Banners)]
        );
        assert_eq!(rewards.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn epochs_increase() {
        let bus = bus();
        let first = bus.publish(Topic::CacheChanged, None);
        let second = bus.publish(Topic::CacheChanged, None);

        assert!(first.epoch < second.epoch);
        assert_ne!(first.id, second.id);
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let bus = bus();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let subscription = bus.subscribe(Topic::CacheChanged, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(bus.subscriber_count(Topic::CacheChanged), 1);

        drop(subscription);
        bus.publish(Topic::CacheChanged, None);

        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(bus.subscriber_count(Topic::CacheChanged), 0);
    }

    #[test]
    fn panicking_handler_does_not_block_others() {
        let bus = bus();
        let hits = Arc::new(AtomicUsize::new(0));

        let _bad = bus.subscribe(Topic::CacheChanged, |_| panic!("subscriber bug"));
        let counter = hits.clone();
        let _good = bus.subscribe(Topic::CacheChanged, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        bus.publish(Topic::CacheChanged, None);
        bus.publish(Topic::CacheChanged, None);

        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn topic_names_roundtrip() {
        for topic in [Topic::CacheChanged, Topic::GamificationUpdated] {
            assert_eq!(topic.as_str().parse::<Topic>(), Ok(topic));
        }
        assert!("orderPlaced".parse::<Topic>().is_err());
    }
}
