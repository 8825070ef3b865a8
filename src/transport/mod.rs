//! Boundary to the pub/sub transport.
//!
//! The runtime never touches the wire itself. A [`Transport`] creates
//! endpoints, moves opaque payloads, and calls [`OnMessage`] from its own
//! threads. Typed encoding and decoding happen here, at the edge, so the
//! channel and callbacks only ever see decoded messages.

mod loopback;

pub use loopback::LoopbackTransport;

use anyhow::Context;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Prefix applied to user topic names on the wire.
pub const TOPIC_PREFIX: &str = "rt/";

/// A message type that can cross the transport.
pub trait Message: Serialize + DeserializeOwned + Send + 'static {
    /// Registered type name, e.g. `std_msgs::msg::String`.
    const TYPE_NAME: &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reliability {
    BestEffort,
    #[default]
    Reliable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Durability {
    #[default]
    Volatile,
    TransientLocal,
}

/// Quality-of-service settings. Opaque to the runtime; passed through to the transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Qos {
    #[serde(default)]
    pub reliability: Reliability,
    #[serde(default)]
    pub durability: Durability,
    #[serde(default = "default_history_depth")]
    pub history_depth: usize,
}

fn default_history_depth() -> usize {
    10
}

impl Default for Qos {
    fn default() -> Self {
        Self {
            reliability: Reliability::default(),
            durability: Durability::default(),
            history_depth: default_history_depth(),
        }
    }
}

impl Qos {
    pub fn best_effort(mut self) -> Self {
        self.reliability = Reliability::BestEffort;
        self
    }

    pub fn transient_local(mut self) -> Self {
        self.durability = Durability::TransientLocal;
        self
    }

    pub fn keep_last(mut self, depth: usize) -> Self {
        self.history_depth = depth;
        self
    }
}

/// Everything the transport needs to create a publisher or subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointSpec {
    pub domain_id: u16,
    pub type_name: String,
    pub topic: String,
    pub qos: Qos,
}

impl EndpointSpec {
    pub fn new(domain_id: u16, type_name: impl Into<String>, topic: impl Into<String>, qos: Qos) -> Self {
        Self {
            domain_id,
            type_name: type_name.into(),
            topic: topic.into(),
            qos,
        }
    }

    /// Topic name as seen on the wire.
    pub fn wire_topic(&self) -> String {
        wire_topic(&self.topic)
    }
}

pub fn wire_topic(topic: &str) -> String {
    format!("{TOPIC_PREFIX}{}", topic.trim_start_matches('/'))
}

/// Called by the transport, on a transport-owned thread, for every sample.
/// Implementations on the runtime side only buffer and enqueue.
pub type OnMessage = Arc<dyn Fn(Bytes) + Send + Sync>;

pub trait PublisherPort: Send + Sync {
    fn publish(&self, payload: Bytes) -> anyhow::Result<()>;

    /// Number of matched subscriptions.
    fn subscriber_count(&self) -> usize;
}

pub trait SubscriptionPort: Send + Sync {
    /// Number of matched publishers.
    fn publisher_count(&self) -> usize;
}

/// Pub/sub transport collaborator.
///
/// Dropping a returned port releases the transport-side resource. A delivery
/// already in flight may still reach `on_message` after a subscription port is
/// dropped; the runtime discards such late samples.
pub trait Transport: Send + Sync + 'static {
    /// Register a message type name. Fails on duplicates.
    fn register_type(&self, type_name: &str) -> anyhow::Result<()>;

    fn has_type(&self, type_name: &str) -> bool;

    fn create_publisher(&self, spec: &EndpointSpec) -> anyhow::Result<Box<dyn PublisherPort>>;

    fn create_subscription(
        &self,
        spec: &EndpointSpec,
        on_message: OnMessage,
    ) -> anyhow::Result<Box<dyn SubscriptionPort>>;
}

pub fn encode<T: Message>(msg: &T) -> anyhow::Result<Bytes> {
    let buf = serde_json::to_vec(msg)
        .with_context(|| format!("failed to encode {}", T::TYPE_NAME))?;
    Ok(Bytes::from(buf))
}

pub fn decode<T: Message>(payload: &[u8]) -> anyhow::Result<T> {
    serde_json::from_slice(payload).with_context(|| format!("failed to decode {}", T::TYPE_NAME))
}
