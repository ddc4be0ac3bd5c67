use dashmap::DashMap;
use devwatch_protocol::stream::{Connected, Heartbeat};
use devwatch_protocol::{StreamEvent, now_ms};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;

pub type SubscriptionId = String;

/// Bounded outbound queue to one connected consumer.
#[derive(Debug, Clone)]
pub struct Transport {
    tx: mpsc::Sender<StreamEvent>,
}

impl Transport {
    pub fn new(tx: mpsc::Sender<StreamEvent>) -> Self {
        Self { tx }
    }

    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<StreamEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

enum Delivery {
    Sent,
    Full,
    Closed,
}

struct Subscriber {
    topic: String,
    transport: Transport,
    last_seen: Instant,
    missed: u64,
}

impl Subscriber {
    fn deliver(&mut self, event: StreamEvent) -> Delivery {
        match self.transport.tx.try_send(event) {
            Ok(()) => {
                self.last_seen = Instant::now();
                Delivery::Sent
            }
            Err(TrySendError::Full(_)) => {
                self.missed = self.missed.saturating_add(1);
                Delivery::Full
            }
            Err(TrySendError::Closed(_)) => Delivery::Closed,
        }
    }
}

/// Pub/sub hub fanning log, metric and status events out to live consumers.
///
/// Delivery never waits on a consumer: each subscriber has its own bounded
/// queue, a full queue drops the event for that subscriber only, and a
/// subscriber that has not accepted anything for `stale_after` is evicted.
pub struct StreamingBroker {
    config: BrokerConfig,
    subscribers: DashMap<SubscriptionId, Subscriber>,
    topics: DashMap<String, HashSet<SubscriptionId>>,
}

impl StreamingBroker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            subscribers: DashMap::new(),
            topics: DashMap::new(),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Register a consumer on `topic` and send it the `connected` event.
    pub fn subscribe(&self, topic: &str, transport: Transport) -> SubscriptionId {
        let id = uuid::Uuid::new_v4().to_string();
        let mut subscriber = Subscriber {
            topic: topic.to_string(),
            transport,
            last_seen: Instant::now(),
            missed: 0,
        };
        let hello = StreamEvent::Connected(Connected {
            topic: topic.to_string(),
            subscription_id: id.clone(),
        });
        if matches!(subscriber.deliver(hello), Delivery::Closed) {
            debug!(topic, "subscriber closed before connect");
            return id;
        }

        self.topics
            .entry(topic.to_string())
            .or_default()
            .insert(id.clone());
        self.subscribers.insert(id.clone(), subscriber);
        debug!(topic, subscription_id = %id, "subscribed");
        id
    }

    pub fn unsubscribe(&self, id: &str) -> bool {
        let Some((_, subscriber)) = self.subscribers.remove(id) else {
            return false;
        };
        let now_empty = match self.topics.get_mut(&subscriber.topic) {
            Some(mut ids) => {
                ids.remove(id);
                ids.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.topics.remove_if(&subscriber.topic, |_, ids| ids.is_empty());
        }
        debug!(topic = %subscriber.topic, subscription_id = %id, "unsubscribed");
        true
    }

    /// Deliver `event` to every subscriber of `topic`. Returns how many
    /// subscribers accepted it.
    pub fn publish(&self, topic: &str, event: StreamEvent) -> usize {
        let ids: Vec<SubscriptionId> = match self.topics.get(topic) {
            Some(ids) => ids.iter().cloned().collect(),
            None => return 0,
        };

        let mut delivered = 0;
        let mut closed = Vec::new();
        for id in ids {
            let outcome = match self.subscribers.get_mut(&id) {
                Some(mut subscriber) => subscriber.deliver(event.clone()),
                None => continue,
            };
            match outcome {
                Delivery::Sent => delivered += 1,
                Delivery::Full => debug!(topic, subscription_id = %id, "subscriber queue full"),
                Delivery::Closed => closed.push(id),
            }
        }
        for id in closed {
            self.unsubscribe(&id);
        }
        delivered
    }

    /// Send a heartbeat to every subscriber, on every topic.
    pub fn broadcast_heartbeat(&self) -> usize {
        let topics: Vec<String> = self.topics.iter().map(|t| t.key().clone()).collect();
        let event = StreamEvent::Heartbeat(Heartbeat {
            timestamp_ms: now_ms(),
            connections: self.connection_count(),
        });
        topics
            .iter()
            .map(|topic| self.publish(topic, event.clone()))
            .sum()
    }

    /// Refresh liveness for a subscriber that showed client-side activity.
    pub fn touch(&self, id: &str) {
        if let Some(mut subscriber) = self.subscribers.get_mut(id) {
            subscriber.last_seen = Instant::now();
        }
    }

    /// Evict subscribers silent for longer than the configured window.
    pub fn evict_stale(&self) -> Vec<SubscriptionId> {
        self.evict_silent_for(self.config.stale_after())
    }

    pub fn evict_silent_for(&self, max_silence: Duration) -> Vec<SubscriptionId> {
        let now = Instant::now();
        let stale: Vec<SubscriptionId> = self
            .subscribers
            .iter()
            .filter(|s| now.duration_since(s.last_seen) > max_silence)
            .map(|s| s.key().clone())
            .collect();
        for id in &stale {
            if let Some(subscriber) = self.subscribers.get(id) {
                warn!(
                    topic = %subscriber.topic,
                    subscription_id = %id,
                    missed = subscriber.missed,
                    "evicting unresponsive subscriber"
                );
            }
            self.unsubscribe(id);
        }
        stale
    }

    pub fn connection_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn topic_subscribers(&self, topic: &str) -> usize {
        self.topics.get(topic).map(|ids| ids.len()).unwrap_or(0)
    }

    pub fn is_subscribed(&self, id: &str) -> bool {
        self.subscribers.contains_key(id)
    }

    /// Heartbeat and stale-subscriber eviction loop.
    pub fn spawn_heartbeat(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let broker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(broker.config.heartbeat_interval());
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let delivered = broker.broadcast_heartbeat();
                        let evicted = broker.evict_stale();
                        debug!(delivered, evicted = evicted.len(), "heartbeat");
                    }
                }
            }
            info!("heartbeat loop stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devwatch_protocol::stream::ErrorNotice;

    fn error_event(message: &str) -> StreamEvent {
        StreamEvent::Error(ErrorNotice {
            message: message.to_string(),
        })
    }

    #[tokio::test]
    async fn subscribe_sends_connected_then_published_events() {
        let broker = StreamingBroker::new(BrokerConfig::default());
        let (transport, mut rx) = Transport::channel(8);
        let id = broker.subscribe("session:web", transport);

        match rx.recv().await.unwrap() {
            StreamEvent::Connected(c) => {
                assert_eq!(c.topic, "session:web");
                assert_eq!(c.subscription_id, id);
            }
            other => panic!("unexpected event: {other:?}"),
        }

        assert_eq!(broker.publish("session:web", error_event("a")), 1);
        assert_eq!(broker.publish("session:other", error_event("b")), 0);
        assert_eq!(rx.recv().await.unwrap(), error_event("a"));
    }

    #[tokio::test]
    async fn slow_subscriber_does_not_block_others() {
        let broker = StreamingBroker::new(BrokerConfig::default());
        let (slow, _slow_rx) = Transport::channel(1);
        let (fast, mut fast_rx) = Transport::channel(16);
        broker.subscribe("t", slow);
        broker.subscribe("t", fast);
        let _ = fast_rx.recv().await;

        for i in 0..5 {
            assert_eq!(broker.publish("t", error_event(&i.to_string())), 1);
        }
        for i in 0..5 {
            assert_eq!(fast_rx.recv().await.unwrap(), error_event(&i.to_string()));
        }
        assert_eq!(broker.connection_count(), 2);
    }

    #[tokio::test]
    async fn closed_transport_is_evicted_on_publish() {
        let broker = StreamingBroker::new(BrokerConfig::default());
        let (transport, rx) = Transport::channel(4);
        let id = broker.subscribe("t", transport);
        drop(rx);

        assert_eq!(broker.publish("t", error_event("x")), 0);
        assert!(!broker.is_subscribed(&id));
        assert_eq!(broker.topic_subscribers("t"), 0);
    }

    #[tokio::test]
    async fn unsubscribe_halts_delivery() {
        let broker = StreamingBroker::new(BrokerConfig::default());
        let (transport, mut rx) = Transport::channel(4);
        let id = broker.subscribe("t", transport);
        let _ = rx.recv().await;

        assert!(broker.unsubscribe(&id));
        assert!(!broker.unsubscribe(&id));
        assert_eq!(broker.publish("t", error_event("late")), 0);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn silent_subscriber_is_evicted_after_two_heartbeats() {
        let broker = StreamingBroker::new(BrokerConfig::default());
        // Capacity 1 is consumed by `connected`; nothing is ever read.
        let (stuck, _stuck_rx) = Transport::channel(1);
        let (healthy, mut healthy_rx) = Transport::channel(64);
        let stuck_id = broker.subscribe("session:web", stuck);
        let healthy_id = broker.subscribe("session:web", healthy);

        for _ in 0..2 {
            tokio::time::advance(Duration::from_secs(31)).await;
            broker.broadcast_heartbeat();
            while healthy_rx.try_recv().is_ok() {}
        }

        let evicted = broker.evict_stale();
        assert_eq!(evicted, vec![stuck_id.clone()]);
        assert!(!broker.is_subscribed(&stuck_id));
        assert!(broker.is_subscribed(&healthy_id));
        assert_eq!(broker.publish("session:web", error_event("after")), 1);
        assert_eq!(broker.topic_subscribers("session:web"), 1);
    }

    #[tokio::test]
    async fn heartbeat_carries_connection_count() {
        let broker = StreamingBroker::new(BrokerConfig::default());
        let (a, mut rx_a) = Transport::channel(4);
        let (b, _rx_b) = Transport::channel(4);
        broker.subscribe("x", a);
        broker.subscribe("y", b);
        let _ = rx_a.recv().await;

        assert_eq!(broker.broadcast_heartbeat(), 2);
        match rx_a.recv().await.unwrap() {
            StreamEvent::Heartbeat(hb) => assert_eq!(hb.connections, 2),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
