//! Topic-keyed fan-out of small messages to subscriber channels.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc::UnboundedSender;

use crate::error::ConnectorError;

/// In-memory event bus. Subscribers hand in the sender half of an unbounded
/// channel; publishing walks the topic's subscriber list under the bus lock
/// and pushes into each channel, which preserves per-subscriber FIFO order
/// without ever blocking the publisher. Nothing is dropped while a
/// subscriber keeps its receiver alive; once the receiver is gone the
/// sender is pruned on the next publish.
///
/// A topic exists from its first subscription onward, even after the last
/// subscriber leaves. Publishing or unsubscribing on a topic nobody has
/// ever subscribed to is `NoSuchTopic`; publishing to an existing topic
/// with zero current subscribers succeeds and delivers nothing.
pub struct EventBus<T> {
    subscriptions: Mutex<HashMap<String, Vec<UnboundedSender<T>>>>,
}

impl<T: Clone> EventBus<T> {
    pub fn new() -> Self {
        Self {
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribes a channel to a topic, creating the topic if needed.
    /// Subscribing the same channel twice is permitted (it will then
    /// receive every message twice) but discouraged.
    pub fn subscribe(&self, topic: &str, sender: UnboundedSender<T>) {
        let mut subscriptions = self.subscriptions.lock().expect("bus lock poisoned");
        subscriptions.entry(topic.to_string()).or_default().push(sender);
    }

    /// Removes a channel from a topic, matching by channel identity rather
    /// than by value.
    pub fn unsubscribe(&self, topic: &str, sender: &UnboundedSender<T>) -> Result<(), ConnectorError> {
        let mut subscriptions = self.subscriptions.lock().expect("bus lock poisoned");
        let subscribers = subscriptions
            .get_mut(topic)
            .ok_or_else(|| ConnectorError::NoSuchTopic(topic.to_string()))?;

        if let Some(idx) = subscribers.iter().position(|s| s.same_channel(sender)) {
            subscribers.remove(idx);
        }

        Ok(())
    }

    /// Delivers a message to every current subscriber of the topic.
    /// Returns how many subscribers received it.
    pub fn publish(&self, topic: &str, message: T) -> Result<usize, ConnectorError> {
        let mut subscriptions = self.subscriptions.lock().expect("bus lock poisoned");
        let subscribers = subscriptions
            .get_mut(topic)
            .ok_or_else(|| ConnectorError::NoSuchTopic(topic.to_string()))?;

        subscribers.retain(|s| !s.is_closed());

        for subscriber in subscribers.iter() {
            let _ = subscriber.send(message.clone());
        }

        Ok(subscribers.len())
    }

    /// Current subscribers of a topic with a live receiver. `0` for a topic
    /// nobody has ever subscribed to.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        let subscriptions = self.subscriptions.lock().expect("bus lock poisoned");
        subscriptions
            .get(topic)
            .map(|subscribers| subscribers.iter().filter(|s| !s.is_closed()).count())
            .unwrap_or(0)
    }

    /// Live subscriptions across all topics.
    pub fn total_subscriptions(&self) -> usize {
        let subscriptions = self.subscriptions.lock().expect("bus lock poisoned");
        subscriptions
            .values()
            .map(|subscribers| subscribers.iter().filter(|s| !s.is_closed()).count())
            .sum()
    }
}

impl<T: Clone> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}
