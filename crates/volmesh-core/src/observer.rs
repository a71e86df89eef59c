//! Typed publish/subscribe topics.
//!
//! [`Observer`] is a single topic; [`TopicObserver`] keys independent topics
//! by some value (typically a filesystem id). Subscribing returns a
//! [`Subscription`] that unsubscribes when dropped or when
//! [`Subscription::unsubscribe`] is called, so the publisher's subscriber
//! count is always exact.

use std::collections::HashMap;
use std::hash::Hash;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

use crate::constants::OBSERVER_CHANNEL_CAPACITY;

/// Handle to a subscription on a topic.
pub struct Subscription<T> {
    receiver: Option<broadcast::Receiver<T>>,
}

impl<T: Clone> Subscription<T> {
    fn new(receiver: broadcast::Receiver<T>) -> Self {
        Self {
            receiver: Some(receiver),
        }
    }

    /// Wait for the next published value.
    ///
    /// Values a slow subscriber missed are skipped. Returns `None` once the
    /// topic is gone or the subscription was cancelled.
    pub async fn recv(&mut self) -> Option<T> {
        let receiver = self.receiver.as_mut()?;
        loop {
            match receiver.recv().await {
                Ok(value) => return Some(value),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    debug!(missed, "subscriber lagged, skipping missed values");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`Subscription::recv`].
    pub fn try_recv(&mut self) -> Option<T> {
        let receiver = self.receiver.as_mut()?;
        loop {
            match receiver.try_recv() {
                Ok(value) => return Some(value),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    pub fn unsubscribe(&mut self) {
        self.receiver = None;
    }

    pub fn is_subscribed(&self) -> bool {
        self.receiver.is_some()
    }
}

/// A single typed topic.
pub struct Observer<T> {
    sender: broadcast::Sender<T>,
}

impl<T: Clone + Send + 'static> Default for Observer<T> {
    fn default() -> Self {
        Self::new(OBSERVER_CHANNEL_CAPACITY)
    }
}

impl<T: Clone + Send + 'static> Observer<T> {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish to current subscribers. Returns how many received it.
    pub fn publish(&self, value: T) -> usize {
        self.sender.send(value).unwrap_or(0)
    }

    pub fn subscribe(&self) -> Subscription<T> {
        Subscription::new(self.sender.subscribe())
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Independent typed topics keyed by `K`.
///
/// Topics are created on first subscribe and dropped once their last
/// subscriber is gone.
pub struct TopicObserver<K, T> {
    capacity: usize,
    topics: Mutex<HashMap<K, broadcast::Sender<T>>>,
}

impl<K: Eq + Hash + Clone, T: Clone + Send + 'static> Default for TopicObserver<K, T> {
    fn default() -> Self {
        Self::new(OBSERVER_CHANNEL_CAPACITY)
    }
}

impl<K: Eq + Hash + Clone, T: Clone + Send + 'static> TopicObserver<K, T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            topics: Mutex::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self, key: &K) -> Subscription<T> {
        let mut topics = self.topics.lock();
        let sender = topics.entry(key.clone()).or_insert_with(|| broadcast::channel(self.capacity).0);
        Subscription::new(sender.subscribe())
    }

    /// Publish on `key`'s topic. Returns how many subscribers received it.
    pub fn publish(&self, key: &K, value: T) -> usize {
        let mut topics = self.topics.lock();
        let Some(sender) = topics.get(key) else {
            return 0;
        };
        let delivered = sender.send(value).unwrap_or(0);
        if sender.receiver_count() == 0 {
            topics.remove(key);
        }
        delivered
    }

    pub fn subscriber_count(&self, key: &K) -> usize {
        self.topics.lock().get(key).map(|s| s.receiver_count()).unwrap_or(0)
    }

    /// Number of topics that still have a sender registered.
    pub fn topic_count(&self) -> usize {
        let mut topics = self.topics.lock();
        topics.retain(|_, sender| sender.receiver_count() > 0);
        topics.len()
    }
}
