use crate::context::Context;
use crate::error::{RclError, RclResult};
use crate::handle::NodeHandle;
use crate::node::Node;
use crate::utils::{CancelToken, FlagGuard, HealthFlag};
use parking_lot::{Mutex, ReentrantMutex};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Drives many nodes from the calling thread.
///
/// Each round drains whatever every member node has queued at that moment
/// (`Node::spin_some`) and then sleeps for the configured idle interval, so a
/// busy node cannot starve the others. The executor references nodes; it
/// never owns their lifetime. While a node is a member, `Context::destroy_node`
/// refuses it with `Busy`.
///
/// A round runs under the round lock. [`Executor::remove_node`] takes the
/// same lock, so once it returns no callback of the removed node runs on
/// behalf of this executor. The lock is reentrant: a callback may remove its
/// own node.
pub struct Executor {
    context: Context,
    nodes: Mutex<Vec<(NodeHandle, Arc<Node>)>>,
    round: ReentrantMutex<()>,
    running: HealthFlag,
    cancel: CancelToken,
    idle: Duration,
}

/// The single-threaded flavour is the only one: every round runs on the
/// thread that called [`Executor::spin`].
pub type SingleThreadedExecutor = Executor;

impl Executor {
    pub fn new(context: &Context) -> Self {
        Self {
            context: context.clone(),
            nodes: Mutex::new(Vec::new()),
            round: ReentrantMutex::new(()),
            running: HealthFlag::new(false),
            cancel: context.cancel_token().clone(),
            idle: context.spin_config().executor_idle(),
        }
    }

    /// Start managing a node. Adding a member twice is a no-op.
    pub fn add_node(&self, handle: &NodeHandle) -> RclResult<()> {
        let mut nodes = self.nodes.lock();
        if nodes.iter().any(|(h, _)| h == handle) {
            return Ok(());
        }
        let node = self.context.attach_node(handle)?;
        tracing::debug!("[Executor] node {} added", node.name());
        nodes.push((*handle, node));
        Ok(())
    }

    /// Stop managing a node. Safe while another thread is inside
    /// [`Executor::spin`]: the call waits for the current round to finish.
    ///
    /// Returns false if the node was not a member.
    pub fn remove_node(&self, handle: &NodeHandle) -> bool {
        let _round = self.round.lock();
        let removed = {
            let mut nodes = self.nodes.lock();
            nodes
                .iter()
                .position(|(h, _)| h == handle)
                .map(|idx| nodes.remove(idx).1)
        };
        match removed {
            Some(node) => {
                node.detach();
                tracing::debug!("[Executor] node {} removed", node.name());
                true
            }
            None => false,
        }
    }

    pub fn node_count(&self) -> usize {
        self.nodes.lock().len()
    }

    pub fn is_running(&self) -> bool {
        self.running.get()
    }

    fn is_member(&self, node: &Arc<Node>) -> bool {
        self.nodes.lock().iter().any(|(_, n)| Arc::ptr_eq(n, node))
    }

    /// One pass over every member node; returns the number of queued items
    /// processed.
    fn run_round(&self) -> usize {
        let _round = self.round.lock();
        let snapshot: Vec<Arc<Node>> = self.nodes.lock().iter().map(|(_, n)| n.clone()).collect();

        let mut processed = 0;
        for node in &snapshot {
            // a callback earlier in this round may have removed it
            if !self.is_member(node) {
                continue;
            }
            match node.spin_some() {
                Ok(n) => processed += n,
                Err(e) if e.is_busy() => {
                    crate::debug_throttled!(
                        Duration::from_secs(1),
                        "[Executor] skipping node {}: {}",
                        node.name(),
                        e
                    );
                }
                Err(e) => tracing::warn!("[Executor] node {}: {}", node.name(), e),
            }
        }
        processed
    }

    /// Run a single non-blocking round.
    pub fn spin_once(&self) -> usize {
        self.run_round()
    }

    /// Run rounds until [`Executor::stop`] or cancellation of the context
    /// token. Blocks the calling thread; `Busy` if already spinning.
    pub fn spin(&self) -> RclResult<()> {
        let Some(guard) = FlagGuard::acquire(&self.running) else {
            return Err(RclError::busy("executor is already spinning"));
        };
        tracing::info!("[Executor] spinning {} node(s)", self.node_count());

        while self.running.get() {
            if self.cancel.is_cancelled() {
                tracing::warn!("[Executor] termination signal received");
                break;
            }
            self.run_round();
            if !self.idle.is_zero() {
                thread::sleep(self.idle);
            }
        }

        drop(guard);
        tracing::info!("[Executor] stopped");
        Ok(())
    }

    /// Ask a running [`Executor::spin`] to return and stop every member node.
    /// Idempotent; never waits for the current round.
    pub fn stop(&self) {
        if !self.running.take() {
            return;
        }
        tracing::info!("[Executor] stop requested");
        let nodes: Vec<Arc<Node>> = self.nodes.lock().iter().map(|(_, n)| n.clone()).collect();
        for node in nodes {
            node.stop();
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.stop();
        for (_, node) in self.nodes.get_mut().drain(..) {
            node.detach();
        }
    }
}
