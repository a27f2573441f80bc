//! In-process realtime bus.
//!
//! Every subscription owns a bounded `mpsc` receiver. Publishing never waits
//! on a subscriber: a full buffer drops the frame for that subscriber only,
//! and consumers heal the gap by backfilling from the message store.
//!
//! The bus also models the realtime *link*. While the link is down nothing
//! is delivered, every subscription stream ends, and new subscriptions are
//! refused; reconnecting bumps the link epoch so that owners know to
//! resubscribe and backfill.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use concierge_shared::constants::BUS_BUFFER;
use concierge_shared::BusEvent;

use crate::error::{BusError, Result};
use crate::topic::Topic;

/// One encoded event as delivered to a subscriber.
#[derive(Debug, Clone)]
pub struct BusFrame {
    pub topic: String,
    pub data: Vec<u8>,
}

impl BusFrame {
    pub fn decode(&self) -> std::result::Result<BusEvent, bincode::Error> {
        BusEvent::from_bytes(&self.data)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub Uuid);

/// A live subscription. Dropping the receiver is not enough to free the
/// registry slot; call [`RealtimeBus::unsubscribe`].
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub topic: String,
    pub receiver: mpsc::Receiver<BusFrame>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkStatus {
    pub connected: bool,
    /// Incremented on every reconnect.
    pub epoch: u64,
}

#[derive(Default)]
struct Registry {
    topics: HashMap<String, HashMap<SubscriptionId, mpsc::Sender<BusFrame>>>,
    owners: HashMap<SubscriptionId, String>,
}

struct BusInner {
    registry: Mutex<Registry>,
    link: watch::Sender<LinkStatus>,
    buffer: usize,
}

#[derive(Clone)]
pub struct RealtimeBus {
    inner: Arc<BusInner>,
}

impl RealtimeBus {
    pub fn new() -> Self {
        Self::with_buffer(BUS_BUFFER)
    }

    pub fn with_buffer(buffer: usize) -> Self {
        let (link, _) = watch::channel(LinkStatus {
            connected: true,
            epoch: 0,
        });
        Self {
            inner: Arc::new(BusInner {
                registry: Mutex::new(Registry::default()),
                link,
                buffer: buffer.max(1),
            }),
        }
    }

    // The registry is never left half-updated, so a poisoned lock is safe
    // to keep using.
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.inner
            .registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a new subscriber on `topic`. Refused while the link is down.
    pub fn subscribe(&self, topic: &Topic) -> Result<Subscription> {
        let topic = topic.to_topic();
        let id = SubscriptionId(Uuid::new_v4());
        let (tx, rx) = mpsc::channel::<BusFrame>(self.inner.buffer);

        // Link changes happen under the registry lock.
        let mut registry = self.registry();
        if !self.link_status().connected {
            return Err(BusError::Disconnected);
        }
        registry
            .topics
            .entry(topic.clone())
            .or_default()
            .insert(id, tx);
        registry.owners.insert(id, topic.clone());

        debug!(
            topic = %topic,
            subscribers = registry.topics.get(&topic).map(|s| s.len()).unwrap_or(0),
            "Subscribed to topic"
        );

        Ok(Subscription {
            id,
            topic,
            receiver: rx,
        })
    }

    /// Remove a subscription. Synchronous, so that it can run from `Drop`.
    /// Returns `false` if the subscription was already gone.
    pub fn unsubscribe(&self, id: &SubscriptionId) -> bool {
        let mut registry = self.registry();
        let Some(topic) = registry.owners.remove(id) else {
            return false;
        };

        let now_empty = match registry.topics.get_mut(&topic) {
            Some(subscribers) => {
                subscribers.remove(id);
                subscribers.is_empty()
            }
            None => false,
        };
        if now_empty {
            registry.topics.remove(&topic);
        }

        debug!(topic = %topic, "Unsubscribed from topic");
        true
    }

    /// Fan an event out to every current subscriber of `topic`.
    ///
    /// Returns the number of subscribers the frame was queued for.
    pub fn publish(&self, topic: &Topic, event: &BusEvent) -> Result<usize> {
        if !self.link_status().connected {
            return Err(BusError::Disconnected);
        }

        let frame = BusFrame {
            topic: topic.to_topic(),
            data: event.to_bytes()?,
        };

        let mut registry = self.registry();
        let Some(subscribers) = registry.topics.get(&frame.topic) else {
            return Ok(0);
        };

        let mut delivered = 0;
        let mut closed = Vec::new();
        for (id, tx) in subscribers {
            match tx.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(topic = %frame.topic, "Dropping frame for slow subscriber");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*id),
            }
        }

        for id in closed {
            if let Some(subscribers) = registry.topics.get_mut(&frame.topic) {
                subscribers.remove(&id);
            }
            registry.owners.remove(&id);
        }

        Ok(delivered)
    }

    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.registry()
            .topics
            .get(&topic.to_topic())
            .map(|s| s.len())
            .unwrap_or(0)
    }

    pub fn link_status(&self) -> LinkStatus {
        *self.inner.link.borrow()
    }

    pub fn watch_link(&self) -> watch::Receiver<LinkStatus> {
        self.inner.link.subscribe()
    }

    /// Take the link down. All subscriptions are dropped, so every receiver
    /// observes end-of-stream once it has drained what was already queued.
    pub fn disconnect(&self) {
        let dropped = {
            let mut registry = self.registry();
            let count = registry.owners.len();
            registry.topics.clear();
            registry.owners.clear();
            self.inner.link.send_modify(|status| status.connected = false);
            count
        };
        warn!(dropped_subscriptions = dropped, "Realtime link disconnected");
    }

    /// Bring the link back up under a new epoch.
    pub fn reconnect(&self) {
        let epoch = {
            let _registry = self.registry();
            self.inner.link.send_modify(|status| {
                status.connected = true;
                status.epoch += 1;
            });
            self.link_status().epoch
        };
        info!(epoch, "Realtime link reconnected");
    }
}

impl Default for RealtimeBus {
    fn default() -> Self {
        Self::new()
    }
}
