//! Typed event fan-out with explicit listener bookkeeping.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::warn;

/// One kind of event, with any number of subscribers. Publishing to a topic
/// nobody listens to is legal but usually a mistake for error topics — see
/// [`EventTopic::warn_if_unhandled`].
pub struct EventTopic<T> {
    name: &'static str,
    tx: broadcast::Sender<T>,
    warned: AtomicBool,
}

impl<T: Clone + Send + 'static> EventTopic<T> {
    pub fn new(name: &'static str, capacity: usize) -> Arc<Self> {
        let (tx, _) = broadcast::channel(capacity);
        Arc::new(Self { name, tx, warned: AtomicBool::new(false) })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.tx.subscribe()
    }

    pub fn listener_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Deliver an event to every current listener; returns how many got it.
    pub fn publish(&self, event: T) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    /// One-shot diagnostic: after `grace`, log a warning if the topic still
    /// has no listener. Warns at most once per topic over its lifetime.
    /// Returns whether the warning fired.
    pub fn warn_if_unhandled(self: &Arc<Self>, grace: Duration) -> JoinHandle<bool> {
        let topic = self.clone();
        tokio::spawn(async move {
            sleep(grace).await;
            if topic.listener_count() == 0 && !topic.warned.swap(true, Ordering::SeqCst) {
                warn!(
                    topic = topic.name,
                    "no listener attached after {} ms; events are being dropped",
                    grace.as_millis()
                );
                true
            } else {
                false
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn warns_when_nobody_listens() {
        let topic: Arc<EventTopic<String>> = EventTopic::new("socket-error", 8);
        let warned = topic.warn_if_unhandled(Duration::from_secs(5)).await.unwrap();
        assert!(warned);
    }

    #[tokio::test(start_paused = true)]
    async fn stays_quiet_with_a_listener() {
        let topic: Arc<EventTopic<String>> = EventTopic::new("socket-error", 8);
        let _rx = topic.subscribe();
        let warned = topic.warn_if_unhandled(Duration::from_secs(5)).await.unwrap();
        assert!(!warned);
    }

    #[tokio::test(start_paused = true)]
    async fn warns_at_most_once() {
        let topic: Arc<EventTopic<String>> = EventTopic::new("socket-error", 8);
        assert!(topic.warn_if_unhandled(Duration::from_secs(1)).await.unwrap());
        assert!(!topic.warn_if_unhandled(Duration::from_secs(1)).await.unwrap());
    }

    #[tokio::test]
    async fn publish_reports_delivery_count() {
        let topic: Arc<EventTopic<u32>> = EventTopic::new("data", 8);
        assert_eq!(topic.publish(1), 0);

        let mut rx = topic.subscribe();
        assert_eq!(topic.listener_count(), 1);
        assert_eq!(topic.publish(2), 1);
        assert_eq!(rx.recv().await.unwrap(), 2);
    }
}
