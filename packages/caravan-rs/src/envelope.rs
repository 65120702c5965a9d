//! Event envelope and correlation metadata.
//!
//! Every message on the bus travels inside an [`Envelope`]: the topic it
//! was published to, the saga it belongs to, a per-saga sequence number
//! assigned at publish time, correlation/span identifiers, and an opaque
//! JSON payload.
//!
//! Domain payload types stay clean - correlation is transport-level
//! metadata carried by the envelope, not by the payload.

use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

/// Correlation ID for tracking related envelopes across a request.
///
/// Each admission generates a unique correlation ID that propagates
/// through every envelope the saga produces. Use `CorrelationId::NONE`
/// for uncorrelated publishes, or `CorrelationId::new()` for a fresh ID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Sentinel value for uncorrelated envelopes (nil UUID).
    pub const NONE: Self = Self(Uuid::nil());

    /// Create a new random correlation ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Check if this is the NONE sentinel value.
    pub fn is_none(&self) -> bool {
        self.0.is_nil()
    }

    /// Check if this is a real correlation ID (not NONE).
    pub fn is_some(&self) -> bool {
        !self.is_none()
    }

    /// Get the inner UUID value.
    pub fn into_inner(self) -> Uuid {
        self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for CorrelationId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<CorrelationId> for Uuid {
    fn from(cid: CorrelationId) -> Uuid {
        cid.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "NONE")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// A topic name on the bus.
///
/// Cheap to clone and hash; used as the routing key for subscriptions.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Topic(Arc<str>);

impl Topic {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Topic {
    fn from(s: &str) -> Self {
        Self(Arc::from(s))
    }
}

impl From<String> for Topic {
    fn from(s: String) -> Self {
        Self(Arc::from(s.as_str()))
    }
}

impl From<&Topic> for Topic {
    fn from(t: &Topic) -> Self {
        t.clone()
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Topic({})", self.0)
    }
}

/// Envelope wrapping a payload with routing and ordering metadata.
///
/// Payloads are `serde_json::Value` so that stage participants in other
/// crates can exchange them without sharing concrete types. Typed payload
/// structs convert at the edge via [`Envelope::read`] and
/// [`Envelope::payload_of`].
#[derive(Debug, Clone)]
pub struct Envelope {
    /// The topic this envelope was published to.
    pub topic: Topic,
    /// The saga this envelope belongs to (opaque, caller-supplied).
    pub saga_id: String,
    /// Monotonic per-saga sequence number, assigned by the bus.
    pub sequence: u64,
    /// Correlation ID for tracking the originating request.
    pub correlation_id: CorrelationId,
    /// Span ID for this publish, unique per envelope.
    pub span_id: Uuid,
    /// When the envelope was handed to the bus.
    pub published_at: DateTime<Utc>,
    /// The opaque payload.
    pub payload: Value,
}

impl Envelope {
    /// Deserialize the payload into a typed struct.
    pub fn read<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.payload.clone())
            .with_context(|| format!("malformed payload on topic {}", self.topic))
    }

    /// Serialize a typed payload into a `Value` for publishing.
    ///
    /// Payload types in this crate are plain serde structs, so
    /// serialization cannot fail in practice; a failure here means the
    /// payload type itself is broken and is reported to the publisher.
    pub fn payload_of<T: Serialize>(payload: &T) -> Result<Value> {
        serde_json::to_value(payload).context("unserializable payload")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct Ping {
        n: u32,
    }

    #[test]
    fn test_correlation_id_none() {
        let cid = CorrelationId::NONE;
        assert!(cid.is_none());
        assert!(!cid.is_some());
        assert_eq!(format!("{}", cid), "NONE");
    }

    #[test]
    fn test_correlation_id_new_is_unique() {
        assert_ne!(CorrelationId::new(), CorrelationId::new());
    }

    #[test]
    fn test_topic_equality_and_display() {
        let a = Topic::from("stage.ranking.request");
        let b = Topic::from(String::from("stage.ranking.request"));
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "stage.ranking.request");
    }

    #[test]
    fn test_envelope_read_roundtrip() {
        let env = Envelope {
            topic: Topic::from("t"),
            saga_id: "saga-1".into(),
            sequence: 7,
            correlation_id: CorrelationId::new(),
            span_id: Uuid::new_v4(),
            published_at: Utc::now(),
            payload: Envelope::payload_of(&Ping { n: 3 }).unwrap(),
        };
        let ping: Ping = env.read().unwrap();
        assert_eq!(ping, Ping { n: 3 });
    }

    #[test]
    fn test_envelope_read_wrong_shape() {
        let env = Envelope {
            topic: Topic::from("t"),
            saga_id: "saga-1".into(),
            sequence: 0,
            correlation_id: CorrelationId::NONE,
            span_id: Uuid::new_v4(),
            published_at: Utc::now(),
            payload: serde_json::json!({"other": true}),
        };
        assert!(env.read::<Ping>().is_err());
    }
}
