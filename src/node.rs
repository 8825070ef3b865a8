use crate::callback::{
    CallbackRef, CallbackResult, ChannelCallback, MessageBuffer, MessageCallback, TimerCallback,
    dispatch,
};
use crate::config::SpinConfig;
use crate::error::{HandleKind, RclError, RclResult};
use crate::handle::{Handle, PublisherHandle, SubscriptionHandle, TimerHandle};
use crate::io::Channel;
use crate::transport::{
    EndpointSpec, Message, OnMessage, PublisherPort, Qos, SubscriptionPort, Transport, decode,
    encode,
};
use crate::utils::{CancelToken, FlagGuard, HealthFlag, Rate, Registry, try_pin_core};
use bytes::Bytes;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

static NEXT_NODE_UID: AtomicU64 = AtomicU64::new(1);

struct PublisherEntry {
    type_name: &'static str,
    port: Arc<dyn PublisherPort>,
}

struct SubscriptionEntry {
    type_name: &'static str,
    // dropped before the callback: no new samples once the callback is gone
    port: Box<dyn SubscriptionPort>,
    _callback: Arc<dyn ChannelCallback>,
}

struct TimerEntry {
    period: Duration,
    _worker: TimerWorker,
    _callback: Arc<dyn ChannelCallback>,
}

enum Entity {
    Publisher(PublisherEntry),
    Subscription(SubscriptionEntry),
    Timer(TimerEntry),
}

impl Entity {
    fn kind(&self) -> HandleKind {
        match self {
            Entity::Publisher(_) => HandleKind::Publisher,
            Entity::Subscription(_) => HandleKind::Subscription,
            Entity::Timer(_) => HandleKind::Timer,
        }
    }
}

/// Thread producing timer ticks into a node's channel.
struct TimerWorker {
    cancel: CancelToken,
    join: Option<JoinHandle<()>>,
}

impl Drop for TimerWorker {
    fn drop(&mut self) {
        self.cancel.cancel();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Logical owner of a callback channel and of the publishers, subscriptions
/// and timers created through it.
///
/// Transport threads and timer threads only ever enqueue into the node's
/// channel; user handlers run exclusively inside a spin call (`spin`,
/// `spin_once`, `spin_some`, a [`SpinThread`] or an
/// [`Executor`](crate::executor::Executor)). Only one of those may consume a
/// node's channel at a time; a second concurrent attempt gets `Busy`.
///
/// Nodes are created by a [`Context`](crate::context::Context) and shared as
/// `Arc<Node>`. The node is dropped only after the context has released it,
/// every executor has detached it and its spin thread has exited.
pub struct Node {
    uid: u64,
    name: String,
    domain_id: u16,
    transport: Arc<dyn Transport>,
    channel: Arc<Channel<CallbackRef>>,
    process: CancelToken,
    stop: CancelToken,
    spin_cfg: SpinConfig,
    entities: Mutex<Registry<Entity>>,
    attachments: AtomicUsize,
    spinning: HealthFlag,
}

impl Node {
    pub(crate) fn new(
        name: impl Into<String>,
        domain_id: u16,
        transport: Arc<dyn Transport>,
        process: CancelToken,
        spin_cfg: SpinConfig,
    ) -> Arc<Self> {
        let uid = NEXT_NODE_UID.fetch_add(1, Ordering::Relaxed);
        let name = name.into();
        tracing::debug!("[Node] {} created in domain {}", name, domain_id);
        Arc::new(Self {
            uid,
            name,
            domain_id,
            transport,
            channel: Arc::new(Channel::new()),
            stop: process.new_child(),
            process,
            spin_cfg,
            entities: Mutex::new(Registry::new()),
            attachments: AtomicUsize::new(0),
            spinning: HealthFlag::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn domain_id(&self) -> u16 {
        self.domain_id
    }

    /// Items waiting in the callback channel.
    pub fn pending(&self) -> usize {
        self.channel.len()
    }

    /// Live publishers, subscriptions and timers.
    pub fn entity_count(&self) -> usize {
        self.entities.lock().len()
    }

    // ---- entities

    fn handle<K>(&self, slot: crate::utils::SlotId) -> Handle<K> {
        Handle::new(self.uid, slot)
    }

    fn invalid(&self, kind: HandleKind) -> RclError {
        tracing::warn!("[Node] {}: invalid {} handle", self.name, kind.as_str());
        RclError::invalid_handle(kind)
    }

    /// Resolve a handle and extract something from the matching entity.
    fn lookup<K, R>(
        &self,
        handle: &Handle<K>,
        kind: HandleKind,
        f: impl FnOnce(&Entity) -> Option<R>,
    ) -> RclResult<R> {
        if handle.owner() != self.uid {
            return Err(self.invalid(kind));
        }
        let found = self.entities.lock().get(handle.slot()).and_then(f);
        found.ok_or_else(|| self.invalid(kind))
    }

    fn remove<K>(&self, handle: &Handle<K>, kind: HandleKind) -> RclResult<()> {
        if handle.owner() != self.uid {
            return Err(self.invalid(kind));
        }
        let removed = {
            let mut entities = self.entities.lock();
            let same_kind = entities
                .get(handle.slot())
                .is_some_and(|e| e.kind() == kind);
            if same_kind {
                entities.remove(handle.slot())
            } else {
                None
            }
        };
        // dropped outside the lock: a timer entry joins its thread
        match removed {
            Some(entity) => {
                drop(entity);
                tracing::debug!("[Node] {}: {} destroyed", self.name, kind.as_str());
                Ok(())
            }
            None => Err(self.invalid(kind)),
        }
    }

    fn endpoint<T: Message>(&self, topic: &str, qos: Qos) -> RclResult<EndpointSpec> {
        if !self.transport.has_type(T::TYPE_NAME) {
            tracing::error!(
                "[Node] {}: message type '{}' is not registered",
                self.name,
                T::TYPE_NAME
            );
            return Err(RclError::registration(T::TYPE_NAME, "message type is not registered"));
        }
        Ok(EndpointSpec::new(self.domain_id, T::TYPE_NAME, topic, qos))
    }

    pub fn create_publisher<T: Message>(&self, topic: &str, qos: Qos) -> RclResult<PublisherHandle<T>> {
        let spec = self.endpoint::<T>(topic, qos)?;
        let port = self.transport.create_publisher(&spec).map_err(|e| {
            tracing::error!("[Node] {}: cannot create publisher on {}: {:#}", self.name, topic, e);
            RclError::registration(T::TYPE_NAME, format!("{e:#}"))
        })?;

        let slot = self.entities.lock().insert(Entity::Publisher(PublisherEntry {
            type_name: T::TYPE_NAME,
            port: Arc::from(port),
        }));
        tracing::info!("[Node] {}: publisher on {}", self.name, spec.wire_topic());
        Ok(self.handle(slot))
    }

    fn publisher_port<T: Message>(&self, handle: &PublisherHandle<T>) -> RclResult<Arc<dyn PublisherPort>> {
        self.lookup(handle, HandleKind::Publisher, |e| match e {
            Entity::Publisher(p) if p.type_name == T::TYPE_NAME => Some(p.port.clone()),
            _ => None,
        })
    }

    /// Encode and hand a message to the transport.
    pub fn publish<T: Message>(&self, handle: &PublisherHandle<T>, msg: &T) -> RclResult<()> {
        let port = self.publisher_port(handle)?;
        let payload = encode(msg)?;
        // lock released: delivery may re-enter this node
        port.publish(payload)?;
        Ok(())
    }

    /// Number of subscriptions matched with this publisher.
    pub fn get_subscriber_count<T: Message>(&self, handle: &PublisherHandle<T>) -> RclResult<usize> {
        Ok(self.publisher_port(handle)?.subscriber_count())
    }

    pub fn destroy_publisher<T: Message>(&self, handle: PublisherHandle<T>) -> RclResult<()> {
        self.remove(&handle, HandleKind::Publisher)
    }

    /// Subscribe to `topic`. `handler` runs only inside this node's spin
    /// calls, once per received message, in arrival order.
    ///
    /// The transport-side listener decodes the sample, appends it to the
    /// subscription's buffer and enqueues a callback token; nothing else
    /// happens on the transport thread.
    pub fn create_subscription<T, F, R>(
        &self,
        topic: &str,
        qos: Qos,
        handler: F,
    ) -> RclResult<SubscriptionHandle<T>>
    where
        T: Message,
        F: FnMut(T) -> R + Send + 'static,
        R: CallbackResult,
    {
        let spec = self.endpoint::<T>(topic, qos)?;
        let label = format!("{}:{}", self.name, spec.wire_topic());

        let buffer = Arc::new(MessageBuffer::<T>::new());
        let callback: Arc<dyn ChannelCallback> =
            Arc::new(MessageCallback::new(label.clone(), buffer.clone(), handler));
        let token: CallbackRef = Arc::downgrade(&callback);

        let channel = self.channel.clone();
        let on_message: OnMessage = Arc::new(move |payload: Bytes| match decode::<T>(&payload) {
            Ok(msg) => {
                buffer.push(msg);
                channel.produce(token.clone());
            }
            Err(e) => {
                crate::warn_throttled!(
                    Duration::from_secs(1),
                    "[{}] dropping undecodable sample: {:#}",
                    label,
                    e
                );
            }
        });

        let port = self
            .transport
            .create_subscription(&spec, on_message)
            .map_err(|e| {
                tracing::error!("[Node] {}: cannot subscribe to {}: {:#}", self.name, topic, e);
                RclError::registration(T::TYPE_NAME, format!("{e:#}"))
            })?;

        let slot = self
            .entities
            .lock()
            .insert(Entity::Subscription(SubscriptionEntry {
                type_name: T::TYPE_NAME,
                port,
                _callback: callback,
            }));
        tracing::info!("[Node] {}: subscription on {}", self.name, spec.wire_topic());
        Ok(self.handle(slot))
    }

    /// Number of publishers matched with this subscription.
    pub fn get_publisher_count<T: Message>(&self, handle: &SubscriptionHandle<T>) -> RclResult<usize> {
        self.lookup(handle, HandleKind::Subscription, |e| match e {
            Entity::Subscription(s) if s.type_name == T::TYPE_NAME => Some(s.port.publisher_count()),
            _ => None,
        })
    }

    /// Unsubscribe. Tokens still queued for this subscription are discarded.
    pub fn destroy_subscription<T: Message>(&self, handle: SubscriptionHandle<T>) -> RclResult<()> {
        self.remove(&handle, HandleKind::Subscription)
    }

    /// Start a timer thread that enqueues a tick every `period`.
    ///
    /// Ticks missed while the thread was delayed are skipped, not replayed.
    /// `handler` runs inside this node's spin calls. The timer keeps ticking
    /// until destroyed, the node is dropped, or the process token fires.
    pub fn create_timer<F, R>(&self, period: Duration, handler: F) -> RclResult<TimerHandle>
    where
        F: FnMut() -> R + Send + 'static,
        R: CallbackResult,
    {
        if period.is_zero() {
            return Err(RclError::InvalidArgument("timer period must be non-zero".into()));
        }

        let label = format!("{}:timer", self.name);
        let callback: Arc<dyn ChannelCallback> = Arc::new(TimerCallback::new(label, handler));
        let token: CallbackRef = Arc::downgrade(&callback);

        let cancel = self.process.new_child();
        let join = {
            let cancel = cancel.clone();
            let channel = self.channel.clone();
            let owner = self.name.clone();
            thread::Builder::new()
                .name(format!("rclite-timer-{}", self.uid))
                .spawn(move || {
                    let mut rate = Rate::new(period);
                    while rate.sleep_cancellable(&cancel) {
                        channel.produce(token.clone());
                    }
                    tracing::debug!("[Timer] {} ({:?}) stopped", owner, period);
                })?
        };

        let slot = self.entities.lock().insert(Entity::Timer(TimerEntry {
            period,
            _worker: TimerWorker {
                cancel,
                join: Some(join),
            },
            _callback: callback,
        }));
        tracing::info!("[Node] {}: timer every {:?}", self.name, period);
        Ok(self.handle(slot))
    }

    pub fn timer_period(&self, handle: &TimerHandle) -> RclResult<Duration> {
        self.lookup(handle, HandleKind::Timer, |e| match e {
            Entity::Timer(t) => Some(t.period),
            _ => None,
        })
    }

    pub fn destroy_timer(&self, handle: TimerHandle) -> RclResult<()> {
        self.remove(&handle, HandleKind::Timer)
    }

    // ---- spinning

    fn acquire_spin(&self) -> RclResult<FlagGuard> {
        FlagGuard::acquire(&self.spinning)
            .ok_or_else(|| RclError::busy(format!("node '{}' is already being spun", self.name)))
    }

    fn spin_loop(&self) {
        let poll = self.spin_cfg.poll_interval();
        while let Some(token) = self.channel.consume_blocking(&self.stop, poll) {
            dispatch(token);
        }
    }

    /// Invoke callbacks as they arrive until [`Node::stop`] or the process
    /// token fires. Blocks the calling thread.
    pub fn spin(&self) -> RclResult<()> {
        let _guard = self.acquire_spin()?;
        tracing::info!("[Node] {} spinning", self.name);
        self.spin_loop();
        tracing::info!("[Node] {} stopped spinning", self.name);
        Ok(())
    }

    /// Block until one callback has been invoked. Returns false if stopped first.
    /// Tokens of destroyed subscriptions and timers are skipped.
    pub fn spin_once(&self) -> RclResult<bool> {
        let _guard = self.acquire_spin()?;
        let poll = self.spin_cfg.poll_interval();
        while let Some(token) = self.channel.consume_blocking(&self.stop, poll) {
            if dispatch(token) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Invoke every callback queued right now without waiting for more.
    /// Returns the number of queued items processed.
    pub fn spin_some(&self) -> RclResult<usize> {
        let _guard = self.acquire_spin()?;
        Ok(self.channel.drain_available(|token| {
            dispatch(token);
        }))
    }

    /// Spin on a dedicated thread owned by the returned [`SpinThread`].
    pub fn spawn_spin(self: &Arc<Self>) -> RclResult<SpinThread> {
        if !self.spinning.try_raise() {
            return Err(RclError::busy(format!(
                "node '{}' is already being spun",
                self.name
            )));
        }

        let node = self.clone();
        let spawned = thread::Builder::new()
            .name(format!("rclite-spin-{}", self.uid))
            .spawn(move || {
                let _guard = FlagGuard::adopt(&node.spinning);
                if let Some(core_id) = node.spin_cfg.core_id {
                    match try_pin_core(core_id) {
                        Ok(core_id) => tracing::info!("[Node] {} pinned to core: {}", node.name, core_id),
                        Err(e) => tracing::error!("[Node] {} cannot pin core: {:#}", node.name, e),
                    }
                }
                tracing::info!("[Node] {} spinning on dedicated thread", node.name);
                node.spin_loop();
                tracing::info!("[Node] {} spin thread exiting", node.name);
            });

        match spawned {
            Ok(join) => Ok(SpinThread {
                node: self.clone(),
                join: Some(join),
            }),
            Err(e) => {
                self.spinning.down();
                Err(e.into())
            }
        }
    }

    /// Request any spin loop on this node to return. Safe from any thread,
    /// including from inside a callback; never waits for the loop.
    ///
    /// The stop is permanent: later `spin`/`spin_once` calls return at once.
    /// `spin_some` keeps draining, so executors can still service the node.
    pub fn stop(&self) {
        if !self.stop.is_cancelled() {
            tracing::info!("[Node] {} stop requested", self.name);
        }
        self.stop.cancel();
        self.channel.wake();
    }

    /// True once [`Node::stop`] was called or the process token fired.
    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub fn is_spinning(&self) -> bool {
        self.spinning.get()
    }

    // ---- executor bookkeeping

    pub(crate) fn attach(&self) {
        self.attachments.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn detach(&self) {
        self.attachments.fetch_sub(1, Ordering::AcqRel);
    }

    /// Number of executors this node is currently registered with.
    pub fn attachments(&self) -> usize {
        self.attachments.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("name", &self.name)
            .field("domain_id", &self.domain_id)
            .field("pending", &self.channel.len())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        // timer entries join their threads as the registry drops
        self.stop.cancel();
        tracing::debug!("[Node] {} dropped", self.name);
    }
}

/// Dedicated spin thread of a node. Stops and joins the thread when dropped.
pub struct SpinThread {
    node: Arc<Node>,
    join: Option<JoinHandle<()>>,
}

impl SpinThread {
    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn is_finished(&self) -> bool {
        self.join.as_ref().is_none_or(|j| j.is_finished())
    }

    /// Stop the node and wait for the thread to exit.
    pub fn stop_and_join(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if let Some(join) = self.join.take() {
            self.node.stop();
            if join.join().is_err() {
                tracing::error!("[Node] {} spin thread panicked", self.node.name);
            }
        }
    }
}

impl fmt::Debug for SpinThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpinThread")
            .field("node", &self.node.name)
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl Drop for SpinThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}
