//! Callback objects queued into a node's channel.
//!
//! The channel carries [`CallbackRef`]s: weak references to callbacks owned
//! by the node's subscription and timer entries. A token whose owner was
//! destroyed while the token sat in the queue fails to upgrade and is
//! discarded, so teardown can never leave a dangling reference behind.

use parking_lot::Mutex;
use std::any::Any;
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Invocation contract for anything the spin loop can dispatch.
pub trait ChannelCallback: Send + Sync {
    fn invoke(&self);

    /// Short description used in logs.
    fn label(&self) -> &str {
        "callback"
    }
}

/// Non-owning reference to a queued callback.
pub type CallbackRef = Weak<dyn ChannelCallback>;

/// Conversion of a handler's return value into a uniform result, so handlers
/// may return either `()` or a `Result`.
pub trait CallbackResult {
    fn into_result(self) -> anyhow::Result<()>;
}

impl CallbackResult for () {
    #[inline]
    fn into_result(self) -> anyhow::Result<()> {
        Ok(())
    }
}

impl<E> CallbackResult for Result<(), E>
where
    E: Into<anyhow::Error>,
{
    #[inline]
    fn into_result(self) -> anyhow::Result<()> {
        self.map_err(Into::into)
    }
}

/// Upgrade and invoke a queued reference. Returns false for stale tokens.
#[inline]
pub fn dispatch(token: CallbackRef) -> bool {
    match token.upgrade() {
        Some(cb) => {
            cb.invoke();
            true
        }
        None => {
            tracing::debug!("[Channel] stale callback discarded");
            false
        }
    }
}

/// Run a user handler, containing both returned errors and panics.
/// Returns true if the handler completed successfully.
pub fn run_guarded<F>(label: &str, f: F) -> bool
where
    F: FnOnce() -> anyhow::Result<()>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            tracing::error!("[{}] callback failed: {:#}", label, e);
            false
        }
        Err(payload) => {
            tracing::error!("[{}] callback panicked: {}", label, panic_message(&*payload));
            false
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Received messages of one subscription, oldest first.
pub struct MessageBuffer<T> {
    inner: Mutex<VecDeque<T>>,
}

impl<T> Default for MessageBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MessageBuffer<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
        }
    }

    #[inline]
    pub fn push(&self, msg: T) {
        self.inner.lock().push_back(msg);
    }

    #[inline]
    pub fn pop(&self) -> Option<T> {
        self.inner.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

type MessageHandler<T> = Box<dyn FnMut(T) -> anyhow::Result<()> + Send>;

/// Delivers the oldest buffered message of a subscription to its handler.
pub struct MessageCallback<T> {
    label: String,
    buffer: Arc<MessageBuffer<T>>,
    handler: Mutex<MessageHandler<T>>,
}

impl<T: Send + 'static> MessageCallback<T> {
    pub fn new<F, R>(label: impl Into<String>, buffer: Arc<MessageBuffer<T>>, mut handler: F) -> Self
    where
        F: FnMut(T) -> R + Send + 'static,
        R: CallbackResult,
    {
        Self {
            label: label.into(),
            buffer,
            handler: Mutex::new(Box::new(move |msg| handler(msg).into_result())),
        }
    }

    pub fn buffer(&self) -> &Arc<MessageBuffer<T>> {
        &self.buffer
    }
}

impl<T: Send + 'static> ChannelCallback for MessageCallback<T> {
    fn invoke(&self) {
        // buffer lock is released before the handler runs
        let Some(msg) = self.buffer.pop() else {
            crate::warn_throttled!(
                Duration::from_secs(1),
                "[{}] invoked with an empty message buffer",
                self.label
            );
            return;
        };
        let mut handler = self.handler.lock();
        run_guarded(&self.label, || (*handler)(msg));
    }

    fn label(&self) -> &str {
        &self.label
    }
}

type TimerHandler = Box<dyn FnMut() -> anyhow::Result<()> + Send>;

/// Calls a zero-argument timer handler on each tick.
pub struct TimerCallback {
    label: String,
    handler: Mutex<TimerHandler>,
}

impl TimerCallback {
    pub fn new<F, R>(label: impl Into<String>, mut handler: F) -> Self
    where
        F: FnMut() -> R + Send + 'static,
        R: CallbackResult,
    {
        Self {
            label: label.into(),
            handler: Mutex::new(Box::new(move || handler().into_result())),
        }
    }
}

impl ChannelCallback for TimerCallback {
    fn invoke(&self) {
        let mut handler = self.handler.lock();
        run_guarded(&self.label, || (*handler)());
    }

    fn label(&self) -> &str {
        &self.label
    }
}
