use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use parley_types::events::{BusEvent, Topic};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ListenerId(u64);

struct Listener {
    id: ListenerId,
    tx: mpsc::UnboundedSender<BusEvent>,
}

/// In-process publish/subscribe hub. Cloning yields another handle to the
/// same registry.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

#[derive(Default)]
struct BusInner {
    /// topic -> listeners in registration order
    topics: RwLock<HashMap<Topic, Vec<Listener>>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener on `topic`. It sees every event published after
    /// this call returns, until the subscription is cancelled or dropped.
    pub fn subscribe(&self, topic: Topic) -> Subscription {
        let id = ListenerId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();

        let mut topics = self.inner.topics.write().unwrap_or_else(PoisonError::into_inner);
        let listeners = topics.entry(topic).or_default();
        listeners.push(Listener { id, tx });
        debug!(%topic, listener = id.0, total = listeners.len(), "Listener registered");

        Subscription {
            id,
            topic,
            rx,
            bus: self.clone(),
        }
    }

    /// Hand `event` to every listener registered on its topic, in
    /// registration order. Returns how many listeners accepted it.
    ///
    /// Listeners are snapshotted before dispatch, so one registering
    /// concurrently only sees later events. Delivery never blocks and a
    /// listener whose receiver is gone is pruned without affecting the rest.
    pub fn publish(&self, event: BusEvent) -> usize {
        let topic = event.topic();
        let conversation_id = event.conversation_id();
        let targets: Vec<(ListenerId, mpsc::UnboundedSender<BusEvent>)> = {
            let topics = self.inner.topics.read().unwrap_or_else(PoisonError::into_inner);
            match topics.get(&topic) {
                Some(listeners) => listeners.iter().map(|l| (l.id, l.tx.clone())).collect(),
                None => Vec::new(),
            }
        };

        let mut delivered = 0;
        let mut dead = Vec::new();
        for (id, tx) in targets {
            if tx.send(event.clone()).is_ok() {
                delivered += 1;
            } else {
                dead.push(id);
            }
        }

        for id in dead {
            trace!(%topic, listener = id.0, "Pruning closed listener");
            self.deregister(topic, id);
        }

        debug!(%topic, %conversation_id, delivered, "Event published");
        delivered
    }

    pub fn listener_count(&self, topic: Topic) -> usize {
        self.inner
            .topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&topic)
            .map_or(0, Vec::len)
    }

    fn deregister(&self, topic: Topic, id: ListenerId) {
        let mut topics = self.inner.topics.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(listeners) = topics.get_mut(&topic) {
            listeners.retain(|l| l.id != id);
            if listeners.is_empty() {
                topics.remove(&topic);
            }
        }
    }
}

/// A live registration on one topic. Yields events as a [`Stream`];
/// cancelling or dropping it deregisters the listener immediately.
pub struct Subscription {
    id: ListenerId,
    topic: Topic,
    rx: mpsc::UnboundedReceiver<BusEvent>,
    bus: EventBus,
}

impl Subscription {
    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Wait for the next event on this topic.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        self.rx.recv().await
    }

    /// Take an already delivered event without waiting.
    pub fn try_recv(&mut self) -> Option<BusEvent> {
        self.rx.try_recv().ok()
    }

    pub fn cancel(self) {}
}

impl Stream for Subscription {
    type Item = BusEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<BusEvent>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.rx.close();
        self.bus.deregister(self.topic, self.id);
        debug!(topic = %self.topic, listener = self.id.0, "Listener cancelled");
    }
}
