//! Topic-routed event bus with FIFO-per-saga delivery.
//!
//! # Guarantees
//!
//! - **At-least-once within the process**: every envelope is offered to
//!   every subscriber registered on its topic at delivery time.
//! - **FIFO per topic**: each topic has a single delivery worker, so
//!   envelopes published to one topic are observed in publish order.
//!   Since sequence numbers are per saga, this implies FIFO per saga.
//! - **Subscriber isolation**: a subscriber error is logged and counted;
//!   the envelope is dropped for that subscriber only. There is no dead
//!   letter queue; callers retry at the workflow layer.
//!
//! `publish` returns after the envelope is handed to the topic queue;
//! subscriber execution is asynchronous relative to the publisher.
//! `publish_sync` instead drives delivery inline and returns only after
//! every current subscriber has run - the blackboard uses it for
//! strong-consistency write notifications.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::Result;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::envelope::{CorrelationId, Envelope, Topic};

/// A handler for envelopes delivered on a subscribed topic.
#[async_trait::async_trait]
pub trait Subscriber: Send + Sync {
    /// Handle one delivered envelope.
    ///
    /// Errors are absorbed by the bus (logged and counted); they never
    /// propagate to the publisher.
    async fn on_event(&self, envelope: Envelope) -> Result<()>;
}

/// Adapter so plain async closures can subscribe.
struct FnSubscriber<F> {
    f: F,
}

#[async_trait::async_trait]
impl<F, Fut> Subscriber for FnSubscriber<F>
where
    F: Fn(Envelope) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn on_event(&self, envelope: Envelope) -> Result<()> {
        (self.f)(envelope).await
    }
}

type SubscriberList = Arc<RwLock<Vec<Arc<dyn Subscriber>>>>;

struct TopicState {
    tx: mpsc::UnboundedSender<Envelope>,
    subscribers: SubscriberList,
}

/// Delivery counters for the whole bus.
#[derive(Debug, Default)]
struct BusCounters {
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

/// Snapshot of bus delivery counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusMetrics {
    pub published: u64,
    pub delivered: u64,
    pub dropped: u64,
}

struct BusInner {
    topics: DashMap<Topic, TopicState>,
    /// Per-saga monotonic sequence counters.
    sequences: DashMap<String, Arc<AtomicU64>>,
    /// Shared with delivery workers, which must not keep the bus itself
    /// alive (dropping the last bus handle drops the topic senders and
    /// lets the workers drain out).
    counters: Arc<BusCounters>,
}

/// Topic-routed publish/subscribe bus.
///
/// Clones share the same underlying router.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    /// Create a new, empty bus.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                topics: DashMap::new(),
                sequences: DashMap::new(),
                counters: Arc::new(BusCounters::default()),
            }),
        }
    }

    /// Register a subscriber on a topic.
    ///
    /// Subscribers on the same topic run in registration order for each
    /// envelope.
    pub fn subscribe(&self, topic: impl Into<Topic>, subscriber: Arc<dyn Subscriber>) {
        let topic = topic.into();
        let subscribers = self.ensure_topic(&topic);
        subscribers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(subscriber);
        debug!(topic = %topic, "subscriber registered");
    }

    /// Register an async closure as a subscriber.
    pub fn subscribe_fn<F, Fut>(&self, topic: impl Into<Topic>, f: F)
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.subscribe(topic, Arc::new(FnSubscriber { f }));
    }

    /// Publish a payload to a topic (asynchronous delivery).
    ///
    /// Assigns the next per-saga sequence number, hands the envelope to
    /// the topic's delivery queue, and returns. Returns the envelope as
    /// published (useful for tests and tracing).
    pub fn publish(
        &self,
        topic: impl Into<Topic>,
        saga_id: impl Into<String>,
        payload: Value,
        correlation_id: CorrelationId,
    ) -> Envelope {
        let topic = topic.into();
        let envelope = self.make_envelope(topic.clone(), saga_id.into(), payload, correlation_id);

        self.ensure_topic(&topic);
        if let Some(state) = self.inner.topics.get(&topic) {
            // The worker holds the receiver for as long as the bus lives,
            // so a send failure means the bus is shutting down.
            if state.tx.send(envelope.clone()).is_err() {
                warn!(topic = %topic, "bus delivery worker gone, envelope dropped");
                self.inner.counters.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
        self.inner.counters.published.fetch_add(1, Ordering::Relaxed);
        envelope
    }

    /// Publish a payload and deliver it to every current subscriber
    /// before returning.
    ///
    /// Bypasses the per-topic delivery queue, so it must only be used on
    /// topics that are never published asynchronously (the
    /// strong-consistency notification topic).
    pub async fn publish_sync(
        &self,
        topic: impl Into<Topic>,
        saga_id: impl Into<String>,
        payload: Value,
        correlation_id: CorrelationId,
    ) -> Envelope {
        let topic = topic.into();
        let envelope = self.make_envelope(topic.clone(), saga_id.into(), payload, correlation_id);
        self.inner.counters.published.fetch_add(1, Ordering::Relaxed);

        let subscribers = self.ensure_topic(&topic);
        let handlers = snapshot(&subscribers);
        for subscriber in handlers {
            deliver(&self.inner.counters, &topic, subscriber.as_ref(), envelope.clone()).await;
        }
        envelope
    }

    /// Number of subscribers currently registered on a topic.
    pub fn subscriber_count(&self, topic: impl Into<Topic>) -> usize {
        let topic = topic.into();
        self.inner
            .topics
            .get(&topic)
            .map(|state| snapshot(&state.subscribers).len())
            .unwrap_or(0)
    }

    /// Snapshot of the bus delivery counters.
    pub fn metrics(&self) -> BusMetrics {
        BusMetrics {
            published: self.inner.counters.published.load(Ordering::Relaxed),
            delivered: self.inner.counters.delivered.load(Ordering::Relaxed),
            dropped: self.inner.counters.dropped.load(Ordering::Relaxed),
        }
    }

    /// Drop the sequence counter for a saga (called when a terminal saga
    /// is garbage-collected).
    pub fn release_saga(&self, saga_id: &str) {
        self.inner.sequences.remove(saga_id);
    }

    fn make_envelope(
        &self,
        topic: Topic,
        saga_id: String,
        payload: Value,
        correlation_id: CorrelationId,
    ) -> Envelope {
        let counter = self
            .inner
            .sequences
            .entry(saga_id.clone())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone();
        let sequence = counter.fetch_add(1, Ordering::AcqRel);

        Envelope {
            topic,
            saga_id,
            sequence,
            correlation_id,
            span_id: Uuid::new_v4(),
            published_at: Utc::now(),
            payload,
        }
    }

    /// Get or create the topic state, spawning its delivery worker on
    /// first use. Returns the subscriber list.
    fn ensure_topic(&self, topic: &Topic) -> SubscriberList {
        if let Some(state) = self.inner.topics.get(topic) {
            return state.subscribers.clone();
        }

        let entry = self.inner.topics.entry(topic.clone()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel::<Envelope>();
            let subscribers: SubscriberList = Arc::new(RwLock::new(Vec::new()));
            spawn_delivery_worker(topic.clone(), rx, subscribers.clone(), self.inner.counters.clone());
            TopicState { tx, subscribers }
        });
        entry.subscribers.clone()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("topics", &self.inner.topics.len())
            .finish()
    }
}

fn spawn_delivery_worker(
    topic: Topic,
    mut rx: mpsc::UnboundedReceiver<Envelope>,
    subscribers: SubscriberList,
    counters: Arc<BusCounters>,
) {
    tokio::spawn(async move {
        while let Some(envelope) = rx.recv().await {
            // Snapshot the subscriber list so registration during
            // delivery takes effect from the next envelope onward.
            let handlers = snapshot(&subscribers);
            for subscriber in handlers {
                deliver(&counters, &topic, subscriber.as_ref(), envelope.clone()).await;
            }
        }
        debug!(topic = %topic, "delivery worker stopped");
    });
}

async fn deliver(
    counters: &BusCounters,
    topic: &Topic,
    subscriber: &dyn Subscriber,
    envelope: Envelope,
) {
    let saga_id = envelope.saga_id.clone();
    match subscriber.on_event(envelope).await {
        Ok(()) => {
            counters.delivered.fetch_add(1, Ordering::Relaxed);
        }
        Err(err) => {
            warn!(topic = %topic, saga_id = %saga_id, error = %err, "subscriber failed, envelope dropped for it");
            counters.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

fn snapshot(subscribers: &SubscriberList) -> Vec<Arc<dyn Subscriber>> {
    subscribers
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    fn recording(target: Arc<Mutex<Vec<Envelope>>>) -> Arc<dyn Subscriber> {
        struct Rec(Arc<Mutex<Vec<Envelope>>>);
        #[async_trait::async_trait]
        impl Subscriber for Rec {
            async fn on_event(&self, envelope: Envelope) -> Result<()> {
                self.0.lock().unwrap().push(envelope);
                Ok(())
            }
        }
        Arc::new(Rec(target))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn test_publish_and_receive() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe("t", recording(seen.clone()));

        bus.publish("t", "saga-1", serde_json::json!({"n": 1}), CorrelationId::NONE);
        settle().await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].saga_id, "saga-1");
        assert_eq!(seen[0].payload["n"], 1);
    }

    #[tokio::test]
    async fn test_fifo_per_topic() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe("orders", recording(seen.clone()));

        for n in 0..20 {
            bus.publish("orders", "saga-1", serde_json::json!({ "n": n }), CorrelationId::NONE);
        }
        settle().await;

        let seen = seen.lock().unwrap();
        let observed: Vec<u64> = seen.iter().map(|e| e.payload["n"].as_u64().unwrap()).collect();
        assert_eq!(observed, (0..20).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_sequence_is_monotonic_per_saga() {
        let bus = EventBus::new();
        let a = bus.publish("t", "saga-a", Value::Null, CorrelationId::NONE);
        let b = bus.publish("u", "saga-a", Value::Null, CorrelationId::NONE);
        let c = bus.publish("t", "saga-b", Value::Null, CorrelationId::NONE);

        assert_eq!(a.sequence, 0);
        assert_eq!(b.sequence, 1);
        // Independent saga starts its own sequence.
        assert_eq!(c.sequence, 0);
    }

    #[tokio::test]
    async fn test_subscribers_run_in_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = order.clone();
            bus.subscribe_fn("t", move |_env| {
                let order = order.clone();
                async move {
                    order.lock().unwrap().push(tag);
                    Ok(())
                }
            });
        }

        bus.publish("t", "s", Value::Null, CorrelationId::NONE);
        settle().await;

        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn test_failing_subscriber_does_not_block_others() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        bus.subscribe_fn("t", |_env| async { Err(anyhow::anyhow!("boom")) });
        bus.subscribe("t", recording(seen.clone()));

        bus.publish("t", "s", Value::Null, CorrelationId::NONE);
        settle().await;

        assert_eq!(seen.lock().unwrap().len(), 1);
        let metrics = bus.metrics();
        assert_eq!(metrics.dropped, 1);
        assert_eq!(metrics.delivered, 1);
    }

    #[tokio::test]
    async fn test_publish_sync_delivers_before_returning() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe("strong", recording(seen.clone()));

        bus.publish_sync("strong", "s", serde_json::json!("x"), CorrelationId::NONE)
            .await;

        // No settle: delivery completed inside publish_sync.
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_no_cross_topic_delivery() {
        let bus = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        bus.subscribe("a", recording(seen.clone()));

        bus.publish("b", "s", Value::Null, CorrelationId::NONE);
        settle().await;

        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_subscriber_count() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count("t"), 0);
        bus.subscribe_fn("t", |_| async { Ok(()) });
        bus.subscribe_fn("t", |_| async { Ok(()) });
        assert_eq!(bus.subscriber_count("t"), 2);
    }

    #[tokio::test]
    async fn test_release_saga_resets_sequence() {
        let bus = EventBus::new();
        bus.publish("t", "s", Value::Null, CorrelationId::NONE);
        bus.release_saga("s");
        let env = bus.publish("t", "s", Value::Null, CorrelationId::NONE);
        assert_eq!(env.sequence, 0);
    }
}
