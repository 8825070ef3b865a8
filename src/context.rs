use crate::config::SpinConfig;
use crate::error::{HandleKind, RclError, RclResult};
use crate::handle::{Handle, NodeHandle};
use crate::node::Node;
use crate::transport::{Message, Transport};
use crate::utils::{CancelToken, Registry, init_process_token};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_CONTEXT_UID: AtomicU64 = AtomicU64::new(1);

struct Inner {
    uid: u64,
    transport: Arc<dyn Transport>,
    cancel: CancelToken,
    spin_cfg: SpinConfig,
    nodes: Mutex<Registry<Arc<Node>>>,
    next_node: AtomicU64,
}

/// Entry point of the runtime: owns the transport, the process-wide
/// cancellation token and every node created through it.
///
/// Cheap to clone. Nodes are addressed by generation-checked [`NodeHandle`]s,
/// so a handle to a destroyed node is rejected rather than dereferenced.
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

impl Context {
    /// Build a context around an explicit cancellation token. No signal
    /// handlers are installed.
    pub fn new(transport: Arc<dyn Transport>, cancel: CancelToken, spin_cfg: SpinConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                uid: NEXT_CONTEXT_UID.fetch_add(1, Ordering::Relaxed),
                transport,
                cancel,
                spin_cfg,
                nodes: Mutex::new(Registry::new()),
                next_node: AtomicU64::new(0),
            }),
        }
    }

    /// Build a context bound to the process token; SIGINT/SIGTERM/SIGQUIT
    /// cancel every loop created from it.
    ///
    /// Fails with `StartupFatal` if the signal handlers cannot be installed.
    pub fn init(transport: Arc<dyn Transport>, spin_cfg: SpinConfig) -> RclResult<Self> {
        let cancel = init_process_token().inspect_err(|e| {
            tracing::error!("[Context] {}", e);
        })?;
        tracing::info!("[Context] initialized");
        Ok(Self::new(transport, cancel, spin_cfg))
    }

    /// Register a message type with the transport. Duplicates are an error.
    pub fn register_type<T: Message>(&self) -> RclResult<()> {
        self.inner
            .transport
            .register_type(T::TYPE_NAME)
            .map_err(|e| {
                tracing::error!("[Context] cannot register '{}': {:#}", T::TYPE_NAME, e);
                RclError::registration(T::TYPE_NAME, format!("{e:#}"))
            })
    }

    /// Register a batch of type names, skipping ones already known.
    /// Returns how many were newly registered.
    pub fn register_types<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> usize {
        let transport = &self.inner.transport;
        let mut added = 0;
        for name in names {
            if transport.has_type(name) {
                tracing::debug!("[Context] type '{}' already registered", name);
                continue;
            }
            match transport.register_type(name) {
                Ok(()) => added += 1,
                Err(e) => tracing::warn!("[Context] cannot register '{}': {:#}", name, e),
            }
        }
        added
    }

    pub fn create_node(&self, domain_id: u16) -> NodeHandle {
        let name = format!("node_{}", self.inner.next_node.fetch_add(1, Ordering::Relaxed));
        self.create_named_node(name, domain_id)
    }

    pub fn create_named_node(&self, name: impl Into<String>, domain_id: u16) -> NodeHandle {
        let node = Node::new(
            name,
            domain_id,
            self.inner.transport.clone(),
            self.inner.cancel.clone(),
            self.inner.spin_cfg.clone(),
        );
        let slot = self.inner.nodes.lock().insert(node);
        Handle::new(self.inner.uid, slot)
    }

    fn resolve(&self, nodes: &Registry<Arc<Node>>, handle: &NodeHandle) -> RclResult<Arc<Node>> {
        let found = if handle.owner() == self.inner.uid {
            nodes.get(handle.slot()).cloned()
        } else {
            None
        };
        found.ok_or_else(|| {
            tracing::warn!("[Context] invalid node handle {:?}", handle);
            RclError::invalid_handle(HandleKind::Node)
        })
    }

    /// Resolve a handle to the live node.
    pub fn node(&self, handle: &NodeHandle) -> RclResult<Arc<Node>> {
        self.resolve(&self.inner.nodes.lock(), handle)
    }

    /// Resolve and mark attached to an executor under the registry lock, so
    /// `destroy_node` cannot slip in between.
    pub(crate) fn attach_node(&self, handle: &NodeHandle) -> RclResult<Arc<Node>> {
        let nodes = self.inner.nodes.lock();
        let node = self.resolve(&nodes, handle)?;
        node.attach();
        Ok(node)
    }

    /// Release a node. Refused with `Busy` while any executor holds it or
    /// its spin thread is still running.
    ///
    /// The node object itself lives on until the last `Arc` clone obtained
    /// from [`Context::node`] is dropped.
    pub fn destroy_node(&self, handle: NodeHandle) -> RclResult<()> {
        let mut nodes = self.inner.nodes.lock();
        let node = self.resolve(&nodes, &handle)?;
        if node.attachments() > 0 {
            return Err(RclError::busy(format!(
                "node '{}' is attached to {} executor(s)",
                node.name(),
                node.attachments()
            )));
        }
        if node.is_spinning() {
            return Err(RclError::busy(format!("node '{}' is still spinning", node.name())));
        }
        let removed = nodes
            .remove(handle.slot())
            .ok_or_else(|| RclError::invalid_handle(HandleKind::Node))?;
        drop(nodes);

        removed.stop();
        tracing::info!("[Context] node {} destroyed", removed.name());
        Ok(())
    }

    pub fn node_count(&self) -> usize {
        self.inner.nodes.lock().len()
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.inner.cancel
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    pub fn spin_config(&self) -> &SpinConfig {
        &self.inner.spin_cfg
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Cancel the context token: every node spin, executor and timer bound
    /// to it winds down on its next poll.
    pub fn shutdown(&self) {
        tracing::info!("[Context] shutdown requested");
        self.inner.cancel.cancel();
        for (_, node) in self.inner.nodes.lock().iter() {
            node.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackTransport;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize)]
    struct Ping(u32);

    impl Message for Ping {
        const TYPE_NAME: &'static str = "test_msgs::Ping";
    }

    fn context() -> Context {
        Context::new(
            Arc::new(LoopbackTransport::new()),
            CancelToken::new_root(),
            SpinConfig::default(),
        )
    }

    #[test]
    fn duplicate_registration_fails_but_bulk_skips() {
        let ctx = context();
        ctx.register_type::<Ping>().unwrap();
        let err = ctx.register_type::<Ping>().unwrap_err();
        assert!(matches!(err, RclError::RegistrationFailure { .. }));

        let added = ctx.register_types(["test_msgs::Ping", "test_msgs::Pong", "test_msgs::Pong"]);
        assert_eq!(added, 1);
        assert!(ctx.transport().has_type("test_msgs::Pong"));
    }

    #[test]
    fn destroyed_node_handle_goes_stale() {
        let ctx = context();
        let h = ctx.create_named_node("talker", 0);
        let node = ctx.node(&h).unwrap();
        assert_eq!(node.name(), "talker");

        ctx.destroy_node(h).unwrap();
        assert!(node.is_stopped());
        assert!(ctx.node(&h).unwrap_err().is_invalid_handle());
        assert!(ctx.destroy_node(h).unwrap_err().is_invalid_handle());

        // slot reuse does not revive the old handle
        let h2 = ctx.create_node(0);
        assert_ne!(h, h2);
        assert!(ctx.node(&h).is_err());
        assert!(ctx.node(&h2).is_ok());
    }

    #[test]
    fn default_names_stay_unique_after_destroy() {
        let ctx = context();
        let a = ctx.create_node(0);
        let b = ctx.create_node(0);
        ctx.destroy_node(a).unwrap();
        let c = ctx.create_node(0);
        assert_ne!(ctx.node(&b).unwrap().name(), ctx.node(&c).unwrap().name());
    }

    #[test]
    fn attached_node_cannot_be_destroyed() {
        let ctx = context();
        let h = ctx.create_node(0);
        let node = ctx.attach_node(&h).unwrap();
        assert_eq!(node.attachments(), 1);
        assert!(ctx.destroy_node(h).unwrap_err().is_busy());

        node.detach();
        ctx.destroy_node(h).unwrap();
        assert!(ctx.attach_node(&h).unwrap_err().is_invalid_handle());
        assert_eq!(node.attachments(), 0);
    }

    #[test]
    fn foreign_handle_is_rejected() {
        let a = context();
        let b = context();
        let h = a.create_node(0);
        assert!(b.node(&h).unwrap_err().is_invalid_handle());
    }

    #[test]
    fn spinning_node_cannot_be_destroyed() {
        let ctx = context();
        let h = ctx.create_node(0);
        let spinner = ctx.node(&h).unwrap().spawn_spin().unwrap();

        assert!(ctx.destroy_node(h).unwrap_err().is_busy());
        spinner.stop_and_join();
        ctx.destroy_node(h).unwrap();
        assert_eq!(ctx.node_count(), 0);
    }

    #[test]
    fn shutdown_stops_every_node() {
        let ctx = context();
        let a = ctx.node(&ctx.create_node(0)).unwrap();
        let b = ctx.node(&ctx.create_node(1)).unwrap();
        ctx.shutdown();
        assert!(ctx.is_shutdown());
        assert!(a.is_stopped() && b.is_stopped());
        assert!(!a.spin_once().unwrap());
    }
}
