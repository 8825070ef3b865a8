use super::{EndpointSpec, OnMessage, PublisherPort, SubscriptionPort, Transport, wire_topic};
use ahash::{AHashMap, AHashSet};
use anyhow::bail;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

type TopicKey = (u16, String);

struct TopicEntry {
    type_name: String,
    publishers: usize,
    subscribers: Vec<(u64, OnMessage)>,
}

#[derive(Default)]
struct Inner {
    types: Mutex<AHashSet<String>>,
    topics: Mutex<AHashMap<TopicKey, TopicEntry>>,
    next_id: AtomicU64,
}

impl Inner {
    /// Find or create the topic for `spec` and register an endpoint on it.
    fn attach(
        &self,
        spec: &EndpointSpec,
        register: impl FnOnce(&mut TopicEntry),
    ) -> anyhow::Result<TopicKey> {
        if !self.types.lock().contains(&spec.type_name) {
            bail!("message type '{}' is not registered", spec.type_name);
        }

        let key = (spec.domain_id, spec.wire_topic());
        let mut topics = self.topics.lock();
        let entry = topics.entry(key.clone()).or_insert_with(|| TopicEntry {
            type_name: spec.type_name.clone(),
            publishers: 0,
            subscribers: Vec::new(),
        });
        if entry.type_name != spec.type_name {
            bail!(
                "topic '{}' already carries '{}', not '{}'",
                key.1,
                entry.type_name,
                spec.type_name
            );
        }
        register(entry);
        Ok(key)
    }

    fn deliver(&self, key: &TopicKey, payload: Bytes) -> usize {
        // callbacks run outside the topic lock
        let targets: Vec<OnMessage> = match self.topics.lock().get(key) {
            Some(entry) => entry.subscribers.iter().map(|(_, cb)| cb.clone()).collect(),
            None => return 0,
        };
        for cb in &targets {
            cb(payload.clone());
        }
        targets.len()
    }

    fn with_entry<R>(&self, key: &TopicKey, f: impl FnOnce(&mut TopicEntry) -> R) -> Option<R> {
        let mut topics = self.topics.lock();
        let entry = topics.get_mut(key)?;
        let out = f(entry);
        if entry.publishers == 0 && entry.subscribers.is_empty() {
            topics.remove(key);
        }
        Some(out)
    }
}

/// In-process transport.
///
/// Topics are keyed by domain and wire name; every endpoint on a topic must
/// use the same registered type. Publishing fans out synchronously on the
/// publishing thread. [`LoopbackTransport::inject`] stands in for a transport
/// I/O thread delivering a sample from outside the process.
#[derive(Clone, Default)]
pub struct LoopbackTransport {
    inner: Arc<Inner>,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver a raw payload to every subscription on `topic` in `domain_id`.
    /// Returns the number of subscriptions reached.
    pub fn inject(&self, domain_id: u16, topic: &str, payload: Bytes) -> usize {
        self.inner.deliver(&(domain_id, wire_topic(topic)), payload)
    }

    /// Number of live topics (with at least one endpoint).
    pub fn topic_count(&self) -> usize {
        self.inner.topics.lock().len()
    }
}

impl Transport for LoopbackTransport {
    fn register_type(&self, type_name: &str) -> anyhow::Result<()> {
        if !self.inner.types.lock().insert(type_name.to_string()) {
            bail!("message type '{type_name}' is already registered");
        }
        Ok(())
    }

    fn has_type(&self, type_name: &str) -> bool {
        self.inner.types.lock().contains(type_name)
    }

    fn create_publisher(&self, spec: &EndpointSpec) -> anyhow::Result<Box<dyn PublisherPort>> {
        let key = self.inner.attach(spec, |e| e.publishers += 1)?;
        tracing::debug!("[Loopback] publisher on {} (domain {})", key.1, key.0);
        Ok(Box::new(LoopbackPublisher {
            inner: self.inner.clone(),
            key,
        }))
    }

    fn create_subscription(
        &self,
        spec: &EndpointSpec,
        on_message: OnMessage,
    ) -> anyhow::Result<Box<dyn SubscriptionPort>> {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let key = self
            .inner
            .attach(spec, |e| e.subscribers.push((id, on_message)))?;
        tracing::debug!("[Loopback] subscription on {} (domain {})", key.1, key.0);
        Ok(Box::new(LoopbackSubscription {
            inner: self.inner.clone(),
            key,
            id,
        }))
    }
}

struct LoopbackPublisher {
    inner: Arc<Inner>,
    key: TopicKey,
}

impl PublisherPort for LoopbackPublisher {
    fn publish(&self, payload: Bytes) -> anyhow::Result<()> {
        self.inner.deliver(&self.key, payload);
        Ok(())
    }

    fn subscriber_count(&self) -> usize {
        self.inner
            .with_entry(&self.key, |e| e.subscribers.len())
            .unwrap_or(0)
    }
}

impl Drop for LoopbackPublisher {
    fn drop(&mut self) {
        self.inner.with_entry(&self.key, |e| e.publishers -= 1);
    }
}

struct LoopbackSubscription {
    inner: Arc<Inner>,
    key: TopicKey,
    id: u64,
}

impl SubscriptionPort for LoopbackSubscription {
    fn publisher_count(&self) -> usize {
        self.inner
            .with_entry(&self.key, |e| e.publishers)
            .unwrap_or(0)
    }
}

impl Drop for LoopbackSubscription {
    fn drop(&mut self) {
        let id = self.id;
        self.inner
            .with_entry(&self.key, |e| e.subscribers.retain(|(sid, _)| *sid != id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::Qos;
    use std::sync::atomic::AtomicUsize;

    fn spec(domain: u16, ty: &str, topic: &str) -> EndpointSpec {
        EndpointSpec::new(domain, ty, topic, Qos::default())
    }

    fn counter() -> (Arc<AtomicUsize>, OnMessage) {
        let hits = Arc::new(AtomicUsize::new(0));
        let cb: OnMessage = {
            let hits = hits.clone();
            Arc::new(move |_payload: Bytes| {
                hits.fetch_add(1, Ordering::SeqCst);
            })
        };
        (hits, cb)
    }

    #[test]
    fn duplicate_and_unknown_types_fail() {
        let t = LoopbackTransport::new();
        t.register_type("A").unwrap();
        assert!(t.register_type("A").is_err());
        assert!(t.has_type("A"));
        assert!(t.create_publisher(&spec(0, "B", "x")).is_err());
    }

    #[test]
    fn matched_counts_and_fanout() {
        let t = LoopbackTransport::new();
        t.register_type("A").unwrap();

        let publisher = t.create_publisher(&spec(0, "A", "chatter")).unwrap();
        let (hits1, cb1) = counter();
        let (hits2, cb2) = counter();
        let sub1 = t.create_subscription(&spec(0, "A", "chatter"), cb1).unwrap();
        let _sub2 = t.create_subscription(&spec(0, "A", "/chatter"), cb2).unwrap();

        assert_eq!(publisher.subscriber_count(), 2);
        assert_eq!(sub1.publisher_count(), 1);

        publisher.publish(Bytes::from_static(b"{}")).unwrap();
        assert_eq!(t.inject(0, "chatter", Bytes::from_static(b"{}")), 2);
        assert_eq!(hits1.load(Ordering::SeqCst), 2);
        assert_eq!(hits2.load(Ordering::SeqCst), 2);

        drop(sub1);
        assert_eq!(publisher.subscriber_count(), 1);
        publisher.publish(Bytes::new()).unwrap();
        assert_eq!(hits1.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn domains_are_isolated_and_topics_typed() {
        let t = LoopbackTransport::new();
        t.register_type("A").unwrap();
        t.register_type("B").unwrap();

        let (hits, cb) = counter();
        let _sub = t.create_subscription(&spec(1, "A", "x"), cb).unwrap();
        assert_eq!(t.inject(0, "x", Bytes::new()), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        assert!(t.create_publisher(&spec(1, "B", "x")).is_err());
        assert!(t.create_publisher(&spec(0, "B", "x")).is_ok());
    }

    #[test]
    fn topic_is_released_with_last_endpoint() {
        let t = LoopbackTransport::new();
        t.register_type("A").unwrap();
        let p = t.create_publisher(&spec(0, "A", "x")).unwrap();
        assert_eq!(t.topic_count(), 1);
        drop(p);
        assert_eq!(t.topic_count(), 0);
    }
}
