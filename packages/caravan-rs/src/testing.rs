//! Test support: envelope recording and polling helpers.
//!
//! Available to dependents through the `testing` feature.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::bus::EventBus;
use crate::envelope::{Envelope, Topic};

/// Records every envelope delivered on the topics it is attached to.
#[derive(Clone, Default)]
pub struct Recorder {
    envelopes: Arc<Mutex<Vec<Envelope>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe this recorder to a topic on the bus.
    pub fn attach(&self, bus: &EventBus, topic: impl Into<Topic>) {
        let sink = self.envelopes.clone();
        bus.subscribe_fn(topic, move |envelope| {
            let sink = sink.clone();
            async move {
                sink.lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .push(envelope);
                Ok(())
            }
        });
    }

    /// All recorded envelopes, in delivery order.
    pub fn envelopes(&self) -> Vec<Envelope> {
        self.envelopes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Recorded envelopes on one topic.
    pub fn on_topic(&self, topic: &str) -> Vec<Envelope> {
        self.envelopes()
            .into_iter()
            .filter(|envelope| envelope.topic.as_str() == topic)
            .collect()
    }

    pub fn count(&self) -> usize {
        self.envelopes().len()
    }

    pub fn clear(&self) {
        self.envelopes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clear();
    }
}

/// Poll `condition` every 10 ms until it returns true or the deadline
/// passes. Returns whether the condition was met.
pub async fn wait_until(deadline: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = tokio::time::Instant::now();
    loop {
        if condition() {
            return true;
        }
        if start.elapsed() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::CorrelationId;
    use serde_json::Value;

    #[tokio::test]
    async fn test_recorder_captures_envelopes() {
        let bus = EventBus::new();
        let recorder = Recorder::new();
        recorder.attach(&bus, "a");
        recorder.attach(&bus, "b");

        bus.publish("a", "s", Value::Null, CorrelationId::NONE);
        bus.publish("b", "s", Value::Null, CorrelationId::NONE);
        bus.publish("c", "s", Value::Null, CorrelationId::NONE);

        assert!(wait_until(Duration::from_secs(1), || recorder.count() == 2).await);
        assert_eq!(recorder.on_topic("a").len(), 1);
        assert_eq!(recorder.on_topic("c").len(), 0);

        recorder.clear();
        assert_eq!(recorder.count(), 0);
    }

    #[tokio::test]
    async fn test_wait_until_times_out() {
        assert!(!wait_until(Duration::from_millis(30), || false).await);
    }
}
